use std::time::Duration;

use chrono::Utc;
use common::{
    controllers::{job_types::StatusContext, resources::compose_url_domain},
    error::AppError,
    storage::types::{
        job::{Job, JobDetailsDelta, JobStatus},
        queued_task::{Lane, TaskPayload},
        user::User,
        user_quota::UserQuota,
        workspace::Workspace,
    },
};
use tracing::{debug, info, warn};

use super::Orchestrator;

/// Conditional writes attempted per poll before leaving the job to the next one.
const STATUS_WRITE_ATTEMPTS: usize = 3;

impl Orchestrator {
    /// One poll: folds the backend observation and the job type's readiness
    /// check into the stored job.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn update_job_status(&self, job_id: &str) -> Result<(), AppError> {
        let job = Job::get(&self.db, job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let resource = self.registry.resource(&job.resource_name)?;
        let job_spec = self.registry.job_types().get(&job.job_type)?;
        let observed = resource.get_resource_job(&job).await;
        let now = Utc::now();

        let mut checked = job;
        checked.apply_observation(observed.status, now);
        checked
            .job_details
            .current_job_details
            .merge(observed.current_job_details.clone());

        let mut delta = JobDetailsDelta::default();
        if checked.job_details.current_job_details.connection_details.is_none() {
            // A stopping job may outlive its workspace record.
            match self.db.get_item::<Workspace>(&checked.workspace_id).await? {
                Some(workspace) => {
                    let job_dir = resource.job_dir_full_path(&workspace, &checked.id);
                    delta = job_spec
                        .status_check(&StatusContext {
                            job: &checked,
                            job_dir: &job_dir,
                            now,
                        })
                        .await;
                }
                None => debug!(
                    job_id = %checked.id,
                    workspace_id = %checked.workspace_id,
                    "Workspace gone; skipping readiness check"
                ),
            }
        }

        if checked.status == JobStatus::Pending {
            let waited = now
                .signed_duration_since(checked.created_at)
                .to_std()
                .unwrap_or_default();
            if waited > self.config.pending_warning {
                warn!(
                    job_id = %checked.id,
                    resource = %checked.resource_name,
                    pending_secs = waited.as_secs(),
                    "Job has been pending longer than expected"
                );
            }
        }

        // The stop endpoint may write while the backend and readiness checks run,
        // so the fold is redone against the current row and written conditionally.
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let mut job = Job::get(&self.db, job_id).await?;
            if job.status.is_terminal() {
                return Ok(());
            }
            let read_status = job.status;

            job.apply_observation(observed.status, now);
            job.job_details
                .current_job_details
                .merge(observed.current_job_details.clone());
            job.job_details.merge(delta.clone());
            if let Some(connection) = job.job_details.current_job_details.connection_details.as_mut() {
                connection.url_domain = compose_url_domain(
                    resource.passthrough_domain(),
                    connection.subdomain.as_deref(),
                );
            }

            if let Some(saved) = job.save_if_status(&self.db, read_status).await? {
                if saved.status == JobStatus::Failed {
                    warn!(job_id = %saved.id, resource = %saved.resource_name, "Job failed");
                }
                return Ok(());
            }
        }

        warn!(job_id = %job_id, "Job status kept changing during the poll; leaving it to the next poll");
        Ok(())
    }

    /// Asks the backend to cancel. A refused stop fails the job instead of
    /// leaving it in `Stopping`.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn stop_job(&self, job_id: &str) -> Result<(), AppError> {
        let job = Job::get(&self.db, job_id).await?;
        let resource = self.registry.resource(&job.resource_name)?;

        if resource.stop_job(&job).await {
            info!(job_id = %job.id, resource = %job.resource_name, "Stop sent to backend");
            return Ok(());
        }

        let now = Utc::now();
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let mut job = Job::get(&self.db, job_id).await?;
            if job.status.is_terminal() {
                return Ok(());
            }
            let read_status = job.status;
            job.apply_observation(JobStatus::Failed, now);
            if job.save_if_status(&self.db, read_status).await?.is_some() {
                warn!(job_id = %job.id, resource = %job.resource_name, "Backend refused stop; marked job failed");
                return Ok(());
            }
        }

        Err(AppError::InternalError(format!(
            "Job {job_id} kept changing while marking it failed"
        )))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) async fn update_job_core_hours(&self, job_id: &str) -> Result<(), AppError> {
        let job = Job::get(&self.db, job_id).await?;
        let resource = self.registry.resource(&job.resource_name)?;

        let core_hours = resource.get_job_core_hours(&job).await;
        let job = Job::set_core_hours(&self.db, job_id, core_hours).await?;
        info!(job_id = %job.id, core_hours = %job.core_hours, "Core hours recorded");

        if let Some(quota) = UserQuota::find_for_user(&self.db, &job.user_id).await? {
            self.enqueue(
                TaskPayload::UpdateUserQuotaCoreHours {
                    user_quota_id: quota.id,
                },
                Lane::Long,
                None,
                Duration::ZERO,
            )
            .await?;
        }
        Ok(())
    }

    /// Re-reads the workspace tree and size from storage.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn update_workspace(&self, workspace_id: &str) -> Result<(), AppError> {
        let workspace = Workspace::get(&self.db, workspace_id).await?;
        if workspace.file_path.is_empty() {
            return Ok(());
        }

        let storage = self.registry.main_storage()?;
        let files = storage.get_dir_tree(&workspace.file_path).await?;
        let disk_space = storage.get_dir_size(&workspace.file_path).await?;
        Workspace::update_snapshot(&self.db, workspace_id, files, disk_space).await?;

        self.enqueue_disk_quota_refresh(&workspace.user_id).await
    }

    #[tracing::instrument(skip(self))]
    pub(crate) async fn delete_workspace(&self, workspace_id: &str) -> Result<(), AppError> {
        let workspace = Workspace::get(&self.db, workspace_id).await?;

        if !workspace.file_path.is_empty() {
            let storage = self.registry.main_storage()?;
            let owner = self
                .db
                .get_item::<User>(&workspace.user_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User {} not found.", workspace.user_id)))?;
            let mapping = storage
                .user_authentication()
                .has_permission(&owner)
                .await?
                .ok_or_else(|| {
                    AppError::Identity(format!("No external user for {}", owner.username))
                })?;
            storage.delete_dir(&workspace.file_path, &mapping).await?;
        }

        self.db.delete_item::<Workspace>(workspace_id).await?;
        info!(workspace_id, "Workspace deleted");

        self.enqueue_disk_quota_refresh(&workspace.user_id).await
    }

    pub(crate) async fn update_user_quota_core_hours(&self, user_quota_id: &str) -> Result<(), AppError> {
        UserQuota::refresh_core_hours(&self.db, user_quota_id).await?;
        Ok(())
    }

    pub(crate) async fn update_user_quota_disk_space(&self, user_quota_id: &str) -> Result<(), AppError> {
        UserQuota::refresh_disk_space(&self.db, user_quota_id).await?;
        Ok(())
    }

    async fn enqueue_disk_quota_refresh(&self, user_id: &str) -> Result<(), AppError> {
        if let Some(quota) = UserQuota::find_for_user(&self.db, user_id).await? {
            self.enqueue(
                TaskPayload::UpdateUserQuotaDiskSpace {
                    user_quota_id: quota.id,
                },
                Lane::Long,
                None,
                Duration::ZERO,
            )
            .await?;
        }
        Ok(())
    }
}
