use std::time::Duration;

use common::{
    error::AppError,
    storage::types::{
        job::Job,
        queued_task::{Lane, TaskPayload},
        workspace::Workspace,
    },
};
use tracing::{debug, info};

use super::Orchestrator;

impl Orchestrator {
    /// Continuation of every poll: schedule the next one, or finalize the job
    /// once it is terminal.
    pub(crate) async fn queue_job_update(&self, job_id: &str) -> Result<(), AppError> {
        let job = Job::get(&self.db, job_id).await?;
        if !job.status.is_terminal() {
            self.enqueue_job_poll(job_id, self.config.poll_interval).await?;
            return Ok(());
        }

        self.finalize_job(job_id).await
    }

    /// Runs at most once per job, guarded by the `finalized` flag.
    async fn finalize_job(&self, job_id: &str) -> Result<(), AppError> {
        let Some(job) = Job::claim_finalization(&self.db, job_id).await? else {
            debug!(job_id, "Job already finalized");
            return Ok(());
        };
        info!(job_id = %job.id, status = %job.status, "Finalizing job");

        self.enqueue(
            TaskPayload::UpdateJobCoreHours {
                job_id: job.id.clone(),
            },
            Lane::Long,
            None,
            Duration::ZERO,
        )
        .await?;

        if Job::count_unfinished_in_workspace(&self.db, &job.workspace_id).await? > 0 {
            return Ok(());
        }

        if Workspace::mark_idle_if_active(&self.db, &job.workspace_id)
            .await?
            .is_some()
        {
            info!(workspace_id = %job.workspace_id, "Workspace idle");
            self.enqueue(
                TaskPayload::UpdateWorkspace {
                    workspace_id: job.workspace_id.clone(),
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
