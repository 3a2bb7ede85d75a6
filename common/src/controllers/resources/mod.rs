mod hpc_api;
mod local;

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rust_decimal::Decimal;
use url::Url;

pub use hpc_api::HpcApiResource;
pub use local::LocalProcessResource;

use crate::{
    controllers::{job_types::JobSpecProvider, parameters::OptionTranslator},
    error::AppError,
    storage::{
        store::StorageController,
        types::{
            job::{CurrentJobDetails, Job, JobStatus, ResourceOptions},
            user::User,
            workspace::Workspace,
        },
    },
};

/// Everything a backend needs to start one job.
pub struct LaunchRequest<'a> {
    pub job: &'a Job,
    pub workspace: &'a Workspace,
    pub owner: &'a User,
    pub job_spec: &'a dyn JobSpecProvider,
    /// Options already validated and translated for this backend.
    pub resource_options: &'a ResourceOptions,
}

/// One poll's worth of backend state.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceJobInfo {
    pub status: JobStatus,
    pub current_job_details: CurrentJobDetails,
}

impl ResourceJobInfo {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            current_job_details: CurrentJobDetails::default(),
        }
    }
}

/// A place that runs jobs.
#[async_trait]
pub trait ResourceController: Send + Sync {
    fn name(&self) -> &str;

    /// Base URL that proxied job traffic is reachable under.
    fn passthrough_domain(&self) -> &str;

    fn storage(&self) -> &Arc<dyn StorageController>;

    fn options(&self) -> &OptionTranslator;

    /// Maps a backend status word onto [`JobStatus`]. Unknown words are an error.
    fn translate_status(&self, native: &str) -> Result<JobStatus, AppError>;

    fn validate_options(&self, options: &ResourceOptions) -> Result<ResourceOptions, AppError> {
        self.options().validate(options)
    }

    fn translate_options(&self, options: &ResourceOptions) -> ResourceOptions {
        self.options().translate(options)
    }

    /// Working directory of a job, relative to the storage root.
    fn job_dir(&self, workspace: &Workspace, job_id: &str) -> String {
        format!("{}/.{job_id}", workspace.file_path)
    }

    fn job_dir_full_path(&self, workspace: &Workspace, job_id: &str) -> PathBuf {
        self.storage()
            .full_path(&self.job_dir(workspace, job_id))
    }

    /// Starts the job and returns the backend's handle for it.
    async fn launch_job(&self, request: LaunchRequest<'_>) -> Result<i64, AppError>;

    /// Current backend view of the job. Degrades to `Complete` on any error.
    async fn get_resource_job(&self, job: &Job) -> ResourceJobInfo;

    /// Compute used by a finished job. Zero on any error.
    async fn get_job_core_hours(&self, job: &Job) -> Decimal;

    /// Best-effort cancellation.
    async fn stop_job(&self, job: &Job) -> bool;
}

/// Externally routable base URL for a job.
///
/// With a subdomain the passthrough host is prefixed, keeping scheme and port.
pub fn compose_url_domain(passthrough_domain: &str, subdomain: Option<&str>) -> String {
    let Some(subdomain) = subdomain.filter(|s| !s.is_empty()) else {
        return passthrough_domain.to_string();
    };
    let Ok(url) = Url::parse(passthrough_domain) else {
        return passthrough_domain.to_string();
    };
    let Some(host) = url.host_str() else {
        return passthrough_domain.to_string();
    };

    match url.port() {
        Some(port) => format!("{}://{subdomain}.{host}:{port}", url.scheme()),
        None => format!("{}://{subdomain}.{host}", url.scheme()),
    }
}

/// Seconds as fractional hours, rounded to five places.
pub(crate) fn hours_from_seconds(seconds: Decimal) -> Decimal {
    seconds
        .checked_div(Decimal::from(3600))
        .unwrap_or_default()
        .round_dp(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_domain_prefixes_subdomain() {
        assert_eq!(
            compose_url_domain("https://jobs.example.org", Some("node1-8888")),
            "https://node1-8888.jobs.example.org"
        );
        assert_eq!(
            compose_url_domain("http://localhost:8000", Some("node1-8888")),
            "http://node1-8888.localhost:8000"
        );
        assert_eq!(
            compose_url_domain("https://jobs.example.org", None),
            "https://jobs.example.org"
        );
        assert_eq!(compose_url_domain("", Some("node1-8888")), "");
    }

    #[test]
    fn hours_round_to_five_places() {
        assert_eq!(hours_from_seconds(Decimal::from(5400)), Decimal::new(15, 1));
        assert_eq!(hours_from_seconds(Decimal::from(1)), Decimal::new(28, 5));
        assert_eq!(hours_from_seconds(Decimal::ZERO), Decimal::ZERO);
    }
}
