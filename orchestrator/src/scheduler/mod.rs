mod config;
mod finalize;
mod launch;
mod tasks;
mod workspaces;

pub use config::{OrchestratorConfig, OrchestratorTuning};
pub use launch::{StartJobRequest, StopOutcome};

use std::{collections::HashSet, sync::Arc, time::Duration};

use common::{
    controllers::registry::ControllerRegistry,
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            job::Job,
            queued_task::{Lane, QueuedTask, TaskHook, TaskPayload},
        },
    },
    utils::config::SchedulerConfig,
};
use tracing::{debug, error, info, warn};

/// Runs queued job, workspace and quota tasks against the configured controllers.
#[derive(Clone)]
pub struct Orchestrator {
    db: Arc<SurrealDbClient>,
    registry: Arc<ControllerRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        registry: Arc<ControllerRegistry>,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self::with_config(db, registry, OrchestratorConfig::from(scheduler))
    }

    pub fn with_config(
        db: Arc<SurrealDbClient>,
        registry: Arc<ControllerRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    #[tracing::instrument(
        skip_all,
        fields(
            task_id = %task.id,
            task = task.payload.name(),
            lane = task.lane.as_str(),
            attempt = task.attempts,
            worker_id = task.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_task(&self, task: QueuedTask) -> Result<(), AppError> {
        let processing_task = task.mark_processing(&self.db).await?;

        let outcome = self.run_payload(&processing_task.payload).await;

        let result = match outcome {
            Ok(()) => {
                processing_task.mark_succeeded(&self.db).await?;
                debug!(
                    task_id = %processing_task.id,
                    attempt = processing_task.attempts,
                    "task succeeded"
                );
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                let retryable = !matches!(err, AppError::Validation(_) | AppError::NotFound(_));

                if retryable && processing_task.can_retry() {
                    let delay = self.retry_delay(processing_task.attempts);
                    processing_task
                        .mark_failed(&reason, delay, &self.db)
                        .await?;
                    warn!(
                        task_id = %processing_task.id,
                        attempt = processing_task.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %reason,
                        "task failed; scheduled retry"
                    );
                } else {
                    let failed_task = processing_task
                        .mark_failed(&reason, Duration::from_secs(0), &self.db)
                        .await?;
                    failed_task.mark_dead_letter(&self.db).await?;
                    error!(
                        task_id = %failed_task.id,
                        attempt = failed_task.attempts,
                        error = %reason,
                        "task failed; moved to dead letter queue"
                    );
                }

                Err(AppError::Processing(reason))
            }
        };

        if let Some(hook) = &processing_task.hook {
            if let Err(err) = self.run_hook(hook).await {
                error!(task_id = %processing_task.id, error = %err, "task hook failed");
            }
        }

        result
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let tuning = &self.config.tuning;
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
    }

    async fn run_payload(&self, payload: &TaskPayload) -> Result<(), AppError> {
        match payload {
            TaskPayload::UpdateJobStatus { job_id } => self.update_job_status(job_id).await,
            TaskPayload::StopJob { job_id } => self.stop_job(job_id).await,
            TaskPayload::UpdateJobCoreHours { job_id } => self.update_job_core_hours(job_id).await,
            TaskPayload::UpdateWorkspace { workspace_id } => {
                self.update_workspace(workspace_id).await
            }
            TaskPayload::DeleteWorkspace { workspace_id } => {
                self.delete_workspace(workspace_id).await
            }
            TaskPayload::UpdateUserQuotaCoreHours { user_quota_id } => {
                self.update_user_quota_core_hours(user_quota_id).await
            }
            TaskPayload::UpdateUserQuotaDiskSpace { user_quota_id } => {
                self.update_user_quota_disk_space(user_quota_id).await
            }
        }
    }

    async fn run_hook(&self, hook: &TaskHook) -> Result<(), AppError> {
        match hook {
            TaskHook::QueueJobUpdate { job_id } => self.queue_job_update(job_id).await,
        }
    }

    async fn enqueue(
        &self,
        payload: TaskPayload,
        lane: Lane,
        hook: Option<TaskHook>,
        delay: Duration,
    ) -> Result<QueuedTask, AppError> {
        let task = QueuedTask::enqueue(&self.db, payload, lane, hook, delay).await?;
        debug!(task_id = %task.id, task = task.payload.name(), lane = lane.as_str(), "task queued");
        Ok(task)
    }

    /// Starts the poll chain of one job.
    async fn enqueue_job_poll(&self, job_id: &str, delay: Duration) -> Result<QueuedTask, AppError> {
        self.enqueue(
            TaskPayload::UpdateJobStatus {
                job_id: job_id.to_owned(),
            },
            Lane::Short,
            Some(TaskHook::QueueJobUpdate {
                job_id: job_id.to_owned(),
            }),
            delay,
        )
        .await
    }

    /// Gives every unfinished job without a live poll chain a fresh one. Run once when workers start.
    pub async fn recover_unfinished_jobs(&self) -> Result<usize, AppError> {
        let open_chains: HashSet<String> = QueuedTask::open_job_chains(&self.db)
            .await?
            .into_iter()
            .collect();
        let mut recovered = 0_usize;
        for job in Job::find_unfinished(&self.db).await? {
            if !job.is_launched() || open_chains.contains(&job.id) {
                continue;
            }
            self.enqueue_job_poll(&job.id, Duration::ZERO).await?;
            recovered = recovered.saturating_add(1);
        }
        if recovered > 0 {
            info!(count = recovered, "Re-queued polls for unfinished jobs");
        }
        Ok(recovered)
    }
}
