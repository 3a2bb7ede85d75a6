pub mod identity;
pub mod job_types;
pub mod parameters;
pub mod registry;
pub mod resources;
