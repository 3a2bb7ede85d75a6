use std::time::Duration;

use chrono::Utc;
use common::{
    controllers::resources::LaunchRequest,
    error::AppError,
    storage::types::{
        job::{Job, JobStatus, ResourceOptions},
        queued_task::{Lane, TaskPayload},
        user::User,
        workspace::{Workspace, WorkspaceStatus},
    },
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};

use super::Orchestrator;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartJobRequest {
    pub job_type: String,
    #[serde(default)]
    pub job_details: Map<String, Value>,
    #[serde(default)]
    pub resource_options: ResourceOptions,
}

/// Result of a user stop request.
#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// The job never reached a backend and is complete already.
    Completed(Job),
    /// The job is `Stopping` and a stop task is queued.
    Queued(Job),
}

impl StopOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StopOutcome::Completed(_) => "Successful stop",
            StopOutcome::Queued(_) => "Job queued to stop.",
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            StopOutcome::Completed(job) | StopOutcome::Queued(job) => job,
        }
    }
}

impl Orchestrator {
    /// Creates a job in the workspace and launches it on the main resource.
    ///
    /// A rejected launch leaves the job `Failed` and is returned as
    /// [`AppError::Launch`]; it is never retried.
    #[tracing::instrument(skip_all, fields(user_id = %owner.id, workspace_id = %workspace_id, job_type = %request.job_type))]
    pub async fn start_job(
        &self,
        owner: &User,
        workspace_id: &str,
        request: StartJobRequest,
    ) -> Result<Job, AppError> {
        let workspace = Workspace::get_for_user(&self.db, &owner.id, workspace_id).await?;
        if workspace.status == WorkspaceStatus::Deleting {
            return Err(AppError::Validation("Workspace is being deleted.".into()));
        }

        let resource = self.registry.main_resource()?;
        if !resource.storage().is_valid_path(&workspace.file_path) {
            return Err(AppError::Validation("Invalid path specified".into()));
        }

        let job_spec = self.registry.job_types().get(&request.job_type)?;
        let validated = resource.validate_options(&request.resource_options)?;
        let translated = resource.translate_options(&validated);

        let job = Job::new(
            owner.id.clone(),
            workspace.id.clone(),
            request.job_type,
            resource.name().to_string(),
            request.job_details,
            validated,
        )
        .create_and_add_to_db(&self.db)
        .await?;

        let launched = resource
            .launch_job(LaunchRequest {
                job: &job,
                workspace: &workspace,
                owner,
                job_spec: job_spec.as_ref(),
                resource_options: &translated,
            })
            .await;

        let resource_job_id = match launched {
            Ok(handle) => handle,
            Err(err) => {
                let reason = match err {
                    AppError::Launch(reason) => reason,
                    other => other.to_string(),
                };
                error!(job_id = %job.id, resource = %resource.name(), error = %reason, "Job launch failed");

                let mut failed = job;
                failed.apply_observation(JobStatus::Failed, Utc::now());
                failed.job_details.current_job_details.message = Some(reason.clone());
                failed.save(&self.db).await?;
                return Err(AppError::Launch(reason));
            }
        };

        let job = Job::set_resource_job_id(&self.db, &job.id, resource_job_id).await?;
        // Active before the first poll can finalize the job and idle the workspace.
        Workspace::mark_active(&self.db, &workspace.id).await?;
        self.enqueue_job_poll(&job.id, Duration::ZERO).await?;

        info!(job_id = %job.id, resource_job_id, resource = %resource.name(), "Job launched");
        Ok(job)
    }

    /// Handles a user stop request without waiting for the backend.
    #[tracing::instrument(skip_all, fields(user_id = %owner.id, job_id = %job_id))]
    pub async fn request_stop(&self, owner: &User, job_id: &str) -> Result<StopOutcome, AppError> {
        let job = Job::get_for_user(&self.db, &owner.id, job_id).await?;

        if !job.is_launched() {
            if let Some(job) = Job::complete_unlaunched(&self.db, job_id, "Successful stop").await? {
                return Ok(StopOutcome::Completed(job));
            }
        }

        let Some(job) = Job::request_stop(&self.db, job_id).await? else {
            return Err(AppError::Validation(
                "This job is not running or pending.".into(),
            ));
        };

        self.enqueue(
            TaskPayload::StopJob {
                job_id: job.id.clone(),
            },
            Lane::Short,
            None,
            Duration::ZERO,
        )
        .await?;

        info!(job_id = %job.id, "Job queued to stop");
        Ok(StopOutcome::Queued(job))
    }
}
