use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::new_record_id;

pub const DEFAULT_LEASE_SECS: i64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue partition. Polls and stops go to `Short`; slow filesystem and
/// accounting work goes to `Long`.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Short,
    Long,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Short => "short",
            Lane::Long => "long",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskPayload {
    UpdateJobStatus { job_id: String },
    StopJob { job_id: String },
    UpdateJobCoreHours { job_id: String },
    UpdateWorkspace { workspace_id: String },
    DeleteWorkspace { workspace_id: String },
    UpdateUserQuotaCoreHours { user_quota_id: String },
    UpdateUserQuotaDiskSpace { user_quota_id: String },
}

impl TaskPayload {
    pub fn name(&self) -> &'static str {
        match self {
            TaskPayload::UpdateJobStatus { .. } => "update_job_status",
            TaskPayload::StopJob { .. } => "stop_job",
            TaskPayload::UpdateJobCoreHours { .. } => "update_job_core_hours",
            TaskPayload::UpdateWorkspace { .. } => "update_workspace",
            TaskPayload::DeleteWorkspace { .. } => "delete_workspace",
            TaskPayload::UpdateUserQuotaCoreHours { .. } => "update_user_quota_core_hours",
            TaskPayload::UpdateUserQuotaDiskSpace { .. } => "update_user_quota_disk_space",
        }
    }
}

/// Continuation run after a task body finishes, whatever its outcome.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskHook {
    /// Re-enqueue the job's poll, or finalize it once terminal.
    QueueJobUpdate { job_id: String },
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskState {
    #[serde(rename = "Pending")]
    #[default]
    Pending,
    #[serde(rename = "Reserved")]
    Reserved,
    #[serde(rename = "Processing")]
    Processing,
    #[serde(rename = "Succeeded")]
    Succeeded,
    #[serde(rename = "Failed")]
    Failed,
    #[serde(rename = "DeadLetter")]
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Reserved => "Reserved",
            TaskState::Processing => "Processing",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::DeadLetter => "DeadLetter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::DeadLetter)
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskTransition {
    Reserve,
    StartProcessing,
    Succeed,
    Fail,
    DeadLetter,
}

impl TaskTransition {
    fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Reserve => "reserve",
            TaskTransition::StartProcessing => "start_processing",
            TaskTransition::Succeed => "succeed",
            TaskTransition::Fail => "fail",
            TaskTransition::DeadLetter => "deadletter",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: QueuedTaskMachine,
        initial: Pending,
        states: [Pending, Reserved, Processing, Succeeded, Failed, DeadLetter],
        events {
            reserve {
                transition: { from: Pending, to: Reserved }
                transition: { from: Failed, to: Reserved }
            }
            start_processing {
                transition: { from: Reserved, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Succeeded }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            deadletter {
                transition: { from: Failed, to: DeadLetter }
            }
        }
    }

    pub(super) fn pending() -> QueuedTaskMachine<(), Pending> {
        QueuedTaskMachine::new(())
    }

    pub(super) fn reserved() -> QueuedTaskMachine<(), Reserved> {
        pending()
            .reserve()
            .expect("reserve transition from Pending should exist")
    }

    pub(super) fn processing() -> QueuedTaskMachine<(), Processing> {
        reserved()
            .start_processing()
            .expect("start_processing transition from Reserved should exist")
    }

    pub(super) fn failed() -> QueuedTaskMachine<(), Failed> {
        processing()
            .fail()
            .expect("fail transition from Processing should exist")
    }
}

fn invalid_transition(state: &TaskState, event: TaskTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid task transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &TaskState, event: TaskTransition) -> Result<TaskState, AppError> {
    use lifecycle::*;
    match (state, event) {
        (TaskState::Pending, TaskTransition::Reserve) => pending()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::Reserve) => failed()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Reserved, TaskTransition::StartProcessing) => reserved()
            .start_processing()
            .map(|_| TaskState::Processing)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Succeed) => processing()
            .succeed()
            .map(|_| TaskState::Succeeded)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Fail) => processing()
            .fail()
            .map(|_| TaskState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::DeadLetter) => failed()
            .deadletter()
            .map(|_| TaskState::DeadLetter)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

stored_object!(QueuedTask, "queued_task", {
    payload: TaskPayload,
    lane: Lane,
    hook: Option<TaskHook>,
    state: TaskState,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<DateTime<Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<DateTime<Utc>>
});

impl QueuedTask {
    pub fn new(payload: TaskPayload, lane: Lane, hook: Option<TaskHook>) -> Self {
        let now = Utc::now();
        // A hooked task chains its own follow-up, so a retry would fork the chain.
        let max_attempts = if hook.is_some() { 1 } else { DEFAULT_MAX_ATTEMPTS };

        Self {
            id: new_record_id(),
            payload,
            lane,
            hook,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_message: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_secs).unwrap_or(0))
    }

    /// Persists a task that becomes claimable once `delay` has elapsed.
    pub async fn enqueue(
        db: &SurrealDbClient,
        payload: TaskPayload,
        lane: Lane,
        hook: Option<TaskHook>,
        delay: Duration,
    ) -> Result<QueuedTask, AppError> {
        let mut task = Self::new(payload, lane, hook);
        task.scheduled_at = task.scheduled_at
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        db.store_item(task.clone()).await?;
        Ok(task)
    }

    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        lane: Lane,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<QueuedTask>, AppError> {
        debug_assert!(compute_next_state(&TaskState::Pending, TaskTransition::Reserve).is_ok());
        debug_assert!(compute_next_state(&TaskState::Failed, TaskTransition::Reserve).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE lane = $lane
                  AND state IN $candidate_states
                  AND scheduled_at <= $now
                  AND (
                        attempts < max_attempts
                        OR state IN $sticky_states
                  )
                  AND (
                        locked_at = NONE
                        OR time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                  )
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET state = $reserved_state,
                attempts = if state IN $increment_states THEN
                    if attempts + 1 > max_attempts THEN max_attempts ELSE attempts + 1 END
                ELSE
                    attempts
                END,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("lane", lane.as_str()))
            .bind((
                "candidate_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Failed.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                ],
            ))
            .bind((
                "sticky_states",
                vec![TaskState::Reserved.as_str(), TaskState::Processing.as_str()],
            ))
            .bind((
                "increment_states",
                vec![TaskState::Pending.as_str(), TaskState::Failed.as_str()],
            ))
            .bind(("reserved_state", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("lease_secs", i64::try_from(lease_duration.as_secs()).unwrap_or(DEFAULT_LEASE_SECS)))
            .await?;

        let task: Option<QueuedTask> = result.take(0)?;
        Ok(task)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<QueuedTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::StartProcessing)?;
        debug_assert_eq!(next, TaskState::Processing);

        const START_PROCESSING_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $processing,
                updated_at = $now,
                locked_at = $now
            WHERE state = $reserved AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(START_PROCESSING_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("reserved", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<QueuedTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::StartProcessing))
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<QueuedTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::Succeed)?;
        debug_assert_eq!(next, TaskState::Succeeded);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $succeeded,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_message = NONE,
                last_error_at = NONE
            WHERE state = $processing AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("succeeded", TaskState::Succeeded.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<QueuedTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::Succeed))
    }

    pub async fn mark_failed(
        &self,
        error_message: &str,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<QueuedTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::Fail)?;
        debug_assert_eq!(next, TaskState::Failed);

        let now = Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $failed,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                scheduled_at = $retry_at,
                error_message = $error_message,
                last_error_at = $now
            WHERE state = $processing AND worker_id = $worker_id
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", TaskState::Failed.as_str()))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("retry_at", SurrealDatetime::from(retry_at)))
            .bind(("error_message", error_message.to_owned()))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<QueuedTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::Fail))
    }

    pub async fn mark_dead_letter(&self, db: &SurrealDbClient) -> Result<QueuedTask, AppError> {
        let next = compute_next_state(&self.state, TaskTransition::DeadLetter)?;
        debug_assert_eq!(next, TaskState::DeadLetter);

        const DEAD_LETTER_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $dead,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE
            WHERE state = $failed
            RETURN *;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(DEAD_LETTER_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("dead", TaskState::DeadLetter.as_str()))
            .bind(("failed", TaskState::Failed.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<QueuedTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, TaskTransition::DeadLetter))
    }

    /// Tasks still waiting for a worker, oldest first.
    pub async fn get_pending(db: &SurrealDbClient) -> Result<Vec<QueuedTask>, AppError> {
        let tasks: Vec<QueuedTask> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE state IN $waiting_states
                 ORDER BY scheduled_at ASC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind((
                "waiting_states",
                vec![TaskState::Pending.as_str(), TaskState::Failed.as_str()],
            ))
            .await?
            .take(0)?;

        Ok(tasks)
    }

    /// Ids of jobs that still have an open hooked task, i.e. a live poll chain.
    pub async fn open_job_chains(db: &SurrealDbClient) -> Result<Vec<String>, AppError> {
        let job_ids: Vec<Option<String>> = db
            .query(
                "SELECT VALUE hook.QueueJobUpdate.job_id FROM type::table($table)
                 WHERE hook != NONE AND state NOT IN $closed_states",
            )
            .bind(("table", Self::table_name()))
            .bind((
                "closed_states",
                vec![TaskState::Succeeded.as_str(), TaskState::DeadLetter.as_str()],
            ))
            .await?
            .take(0)?;

        Ok(job_ids.into_iter().flatten().collect())
    }
}
