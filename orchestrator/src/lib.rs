#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod notifications;
pub mod scheduler;

use chrono::Utc;
use common::{
    storage::{
        db::SurrealDbClient,
        types::queued_task::{Lane, QueuedTask, DEFAULT_LEASE_SECS},
    },
    utils::config::SchedulerConfig,
};
pub use scheduler::{
    Orchestrator, OrchestratorConfig, OrchestratorTuning, StartJobRequest, StopOutcome,
};
use std::sync::Arc;
use tokio::{
    task::JoinSet,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Claims and runs tasks from one lane forever.
pub async fn run_lane_worker(
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<Orchestrator>,
    lane: Lane,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let worker_id = format!("{}-worker-{}", lane.as_str(), Uuid::new_v4());
    let lease_duration = Duration::from_secs(u64::try_from(DEFAULT_LEASE_SECS).unwrap_or(300));
    let idle_backoff = Duration::from_millis(500);

    info!(%worker_id, lane = lane.as_str(), "Worker started");
    loop {
        match QueuedTask::claim_next_ready(&db, lane, &worker_id, Utc::now(), lease_duration).await {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                debug!(
                    %worker_id,
                    %task_id,
                    task = task.payload.name(),
                    attempt = task.attempts,
                    "claimed task"
                );
                if let Err(err) = orchestrator.process_task(task).await {
                    error!(%worker_id, %task_id, error = %err, "task failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim task");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Recovers orphaned poll chains, then starts the configured number of
/// workers on each lane.
pub async fn spawn_workers(
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<Orchestrator>,
    config: &SchedulerConfig,
) -> Result<JoinSet<()>, common::error::AppError> {
    orchestrator.recover_unfinished_jobs().await?;

    let mut workers = JoinSet::new();
    let lanes = [
        (Lane::Short, config.short_lane_workers),
        (Lane::Long, config.long_lane_workers),
    ];
    for (lane, count) in lanes {
        for _ in 0..count.max(1) {
            let db = Arc::clone(&db);
            let orchestrator = Arc::clone(&orchestrator);
            workers.spawn(async move {
                if let Err(err) = run_lane_worker(db, orchestrator, lane).await {
                    error!(lane = lane.as_str(), error = %err, "Worker stopped");
                }
            });
        }
    }
    Ok(workers)
}
