pub mod catalog;
pub mod job_status;
pub mod jobs;
pub mod liveness;
pub mod passthrough;
pub mod readiness;
pub mod workspaces;
