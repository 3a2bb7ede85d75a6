use std::str::FromStr;

use rust_decimal::Decimal;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::new_record_id;

/// Backend handle of a job that was never launched.
pub const UNLAUNCHED_RESOURCE_JOB_ID: i64 = -1;

/// Requested resource sizing, keyed by parameter or backend field name.
pub type ResourceOptions = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Stopping,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stopping => "stopping",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "stopping" => Ok(JobStatus::Stopping),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AppError::Validation(format!("Unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Start,
    RequestStop,
    Complete,
    Fail,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::RequestStop => "request_stop",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Running, Stopping, Complete, Failed],
        events {
            start {
                transition: { from: Pending, to: Running }
            }
            request_stop {
                transition: { from: Pending, to: Stopping }
                transition: { from: Running, to: Stopping }
            }
            complete {
                transition: { from: Pending, to: Complete }
                transition: { from: Running, to: Complete }
                transition: { from: Stopping, to: Complete }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Running, to: Failed }
                transition: { from: Stopping, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        pending()
            .start()
            .expect("start transition from Pending should exist")
    }

    pub(super) fn stopping() -> JobLifecycleMachine<(), Stopping> {
        running()
            .request_stop()
            .expect("request_stop transition from Running should exist")
    }
}

fn invalid_transition(state: JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

pub fn compute_next_state(state: JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (state, event) {
        (JobStatus::Pending, JobTransition::Start) => pending()
            .start()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Pending, JobTransition::RequestStop) => pending()
            .request_stop()
            .map(|_| JobStatus::Stopping)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::RequestStop) => running()
            .request_stop()
            .map(|_| JobStatus::Stopping)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Pending, JobTransition::Complete) => pending()
            .complete()
            .map(|_| JobStatus::Complete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Complete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Stopping, JobTransition::Complete) => stopping()
            .complete()
            .map(|_| JobStatus::Complete)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Pending, JobTransition::Fail) => pending()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::Fail) => running()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Stopping, JobTransition::Fail) => stopping()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

/// Folds a backend observation into the stored status.
///
/// Terminal states are final, and `Stopping` only yields to a terminal
/// observation. A backend still reporting `Pending` never regresses a job.
pub fn resolve_polled_status(current: JobStatus, observed: JobStatus) -> JobStatus {
    let event = match observed {
        JobStatus::Running => JobTransition::Start,
        JobStatus::Complete => JobTransition::Complete,
        JobStatus::Failed => JobTransition::Fail,
        JobStatus::Pending | JobStatus::Stopping => return current,
    };
    compute_next_state(current, event).unwrap_or(current)
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ProxyDetails {
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ConnectionDetails {
    pub url_path: String,
    #[serde(default)]
    pub url_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

/// Orchestrator-owned view of a running job. Also used as a partial update.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CurrentJobDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_details: Option<ProxyDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_left: Option<f64>,
}

impl CurrentJobDetails {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Overlays the fields present in `delta`. Absent fields never erase stored ones.
    pub fn merge(&mut self, delta: CurrentJobDetails) {
        if delta.message.is_some() {
            self.message = delta.message;
        }
        if delta.proxy_details.is_some() {
            self.proxy_details = delta.proxy_details;
        }
        if delta.connection_details.is_some() {
            self.connection_details = delta.connection_details;
        }
        if delta.time_left.is_some() {
            self.time_left = delta.time_left;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct JobMetrics {
    /// Seconds between creation and the first observed `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_pending: Option<f64>,
    /// Seconds between start and the service becoming reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_init: Option<f64>,
}

impl JobMetrics {
    pub fn merge(&mut self, delta: JobMetrics) {
        if delta.time_pending.is_some() {
            self.time_pending = delta.time_pending;
        }
        if delta.time_init.is_some() {
            self.time_init = delta.time_init;
        }
    }
}

/// Partial update produced by a job-type status check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetailsDelta {
    pub current_job_details: CurrentJobDetails,
    pub metrics: JobMetrics,
}

impl JobDetailsDelta {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            current_job_details: CurrentJobDetails::with_message(message),
            metrics: JobMetrics::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_job_details.is_empty() && self.metrics == JobMetrics::default()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct JobDetails {
    #[serde(default)]
    pub request_job_details: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub current_job_details: CurrentJobDetails,
    #[serde(default)]
    pub metrics: JobMetrics,
}

impl JobDetails {
    pub fn merge(&mut self, delta: JobDetailsDelta) {
        self.current_job_details.merge(delta.current_job_details);
        self.metrics.merge(delta.metrics);
    }
}

#[derive(serde::Deserialize)]
struct CountResult {
    count: usize,
}

/// Optional filters for listing a user's jobs.
#[derive(Debug, Clone, Default, serde::Deserialize, PartialEq)]
pub struct JobFilter {
    pub workspace_id: Option<String>,
    pub resource_job_id: Option<i64>,
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
}

stored_object!(Job, "job", {
    user_id: String,
    workspace_id: String,
    job_type: String,
    resource_name: String,
    status: JobStatus,
    resource_job_id: i64,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    datetime_start: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    datetime_end: Option<DateTime<Utc>>,
    #[serde(default)]
    core_hours: Decimal,
    #[serde(default)]
    job_details: JobDetails,
    #[serde(default)]
    resource_options: ResourceOptions,
    #[serde(default)]
    finalized: bool
});

impl Job {
    pub fn new(
        user_id: String,
        workspace_id: String,
        job_type: String,
        resource_name: String,
        request_job_details: serde_json::Map<String, serde_json::Value>,
        resource_options: ResourceOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_record_id(),
            created_at: now,
            updated_at: now,
            user_id,
            workspace_id,
            job_type,
            resource_name,
            status: JobStatus::Pending,
            resource_job_id: UNLAUNCHED_RESOURCE_JOB_ID,
            datetime_start: None,
            datetime_end: None,
            core_hours: Decimal::ZERO,
            job_details: JobDetails {
                request_job_details,
                ..JobDetails::default()
            },
            resource_options,
            finalized: false,
        }
    }

    pub fn is_launched(&self) -> bool {
        self.resource_job_id != UNLAUNCHED_RESOURCE_JOB_ID
    }

    /// Applies a backend observation taken at `now`.
    ///
    /// `datetime_start` is only stamped on the first observed `Running` and
    /// `datetime_end` on the first observed terminal state.
    pub fn apply_observation(&mut self, observed: JobStatus, now: DateTime<Utc>) {
        if observed == JobStatus::Running && self.datetime_start.is_none() {
            self.datetime_start = Some(now);
            self.job_details.metrics.time_pending = Some(seconds_between(self.created_at, now));
        }
        if observed.is_terminal() && self.datetime_end.is_none() {
            self.datetime_end = Some(now);
        }
        self.status = resolve_polled_status(self.status, observed);
    }

    pub async fn create_and_add_to_db(self, db: &SurrealDbClient) -> Result<Job, AppError> {
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<Job, AppError> {
        db.get_item::<Job>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {id} not found.")))
    }

    pub async fn get_for_user(
        db: &SurrealDbClient,
        user_id: &str,
        id: &str,
    ) -> Result<Job, AppError> {
        let job = db.get_item::<Job>(id).await?;
        match job {
            Some(job) if job.user_id == user_id => Ok(job),
            _ => Err(AppError::NotFound(format!("Job {id} not found for user."))),
        }
    }

    pub async fn list_for_user(
        db: &SurrealDbClient,
        user_id: &str,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, AppError> {
        let mut sql = String::from("SELECT * FROM type::table($table) WHERE user_id = $user_id");
        if filter.workspace_id.is_some() {
            sql.push_str(" AND workspace_id = $workspace_id");
        }
        if filter.resource_job_id.is_some() {
            sql.push_str(" AND resource_job_id = $resource_job_id");
        }
        if filter.job_type.is_some() {
            sql.push_str(" AND job_type = $job_type");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = $status");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let jobs: Vec<Job> = db
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .bind(("workspace_id", filter.workspace_id.clone()))
            .bind(("resource_job_id", filter.resource_job_id))
            .bind(("job_type", filter.job_type.clone()))
            .bind(("status", filter.status.map(|s| s.as_str())))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Jobs whose lifecycle still needs polling.
    pub async fn find_unfinished(db: &SurrealDbClient) -> Result<Vec<Job>, AppError> {
        let jobs: Vec<Job> = db
            .query("SELECT * FROM type::table($table) WHERE status IN $statuses ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind((
                "statuses",
                vec![
                    JobStatus::Pending.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::Stopping.as_str(),
                ],
            ))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Jobs in the workspace that have not reached a terminal state, `Stopping` included.
    pub async fn count_unfinished_in_workspace(
        db: &SurrealDbClient,
        workspace_id: &str,
    ) -> Result<usize, AppError> {
        let result: Option<CountResult> = db
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE workspace_id = $workspace_id AND status IN $statuses
                 GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_owned()))
            .bind((
                "statuses",
                vec![
                    JobStatus::Pending.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::Stopping.as_str(),
                ],
            ))
            .await?
            .take(0)?;

        Ok(result.map_or(0, |r| r.count))
    }

    pub async fn total_core_hours_for_user(
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Decimal, AppError> {
        let hours: Vec<Decimal> = db
            .query("SELECT VALUE core_hours FROM type::table($table) WHERE user_id = $user_id")
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(hours.into_iter().fold(Decimal::ZERO, |acc, h| acc.saturating_add(h)))
    }

    /// Writes the whole record back, refreshing `updated_at`.
    pub async fn save(mut self, db: &SurrealDbClient) -> Result<Job, AppError> {
        self.updated_at = Utc::now();
        let id = self.id.clone();
        db.update_item(self)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {id} not found.")))
    }

    /// Writes the fields a status poll owns, but only while the stored status
    /// is still `expected`. `None` when another writer changed it first.
    pub async fn save_if_status(
        &self,
        db: &SurrealDbClient,
        expected: JobStatus,
    ) -> Result<Option<Job>, AppError> {
        let updated: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $status,
                     datetime_start = $datetime_start,
                     datetime_end = $datetime_end,
                     job_details = $job_details,
                     updated_at = $now
                 WHERE status = $expected
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("status", self.status.as_str()))
            .bind(("datetime_start", self.datetime_start.map(SurrealDatetime::from)))
            .bind(("datetime_end", self.datetime_end.map(SurrealDatetime::from)))
            .bind(("job_details", self.job_details.clone()))
            .bind(("expected", expected.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        Ok(updated)
    }

    pub async fn set_resource_job_id(
        db: &SurrealDbClient,
        id: &str,
        resource_job_id: i64,
    ) -> Result<Job, AppError> {
        let updated: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET resource_job_id = $resource_job_id, updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("resource_job_id", resource_job_id))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Job {id} not found.")))
    }

    /// Moves a launched, non-terminal job to `Stopping`. `None` when the job is not stoppable.
    pub async fn request_stop(db: &SurrealDbClient, id: &str) -> Result<Option<Job>, AppError> {
        debug_assert!(compute_next_state(JobStatus::Running, JobTransition::RequestStop).is_ok());

        let updated: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $stopping, updated_at = $now
                 WHERE status IN $stoppable AND resource_job_id != $unlaunched
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("stopping", JobStatus::Stopping.as_str()))
            .bind((
                "stoppable",
                vec![JobStatus::Pending.as_str(), JobStatus::Running.as_str()],
            ))
            .bind(("unlaunched", UNLAUNCHED_RESOURCE_JOB_ID))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        Ok(updated)
    }

    /// Completes a job that never reached a backend. `None` when it was launched or is already terminal.
    pub async fn complete_unlaunched(
        db: &SurrealDbClient,
        id: &str,
        message: &str,
    ) -> Result<Option<Job>, AppError> {
        let now = Utc::now();
        let updated: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $complete,
                     datetime_end = $now,
                     job_details.current_job_details.message = $message,
                     updated_at = $now
                 WHERE resource_job_id = $unlaunched AND status IN $open
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("complete", JobStatus::Complete.as_str()))
            .bind(("message", message.to_owned()))
            .bind(("unlaunched", UNLAUNCHED_RESOURCE_JOB_ID))
            .bind((
                "open",
                vec![
                    JobStatus::Pending.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::Stopping.as_str(),
                ],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .take(0)?;

        Ok(updated)
    }

    /// Claims the one-time finalization of a terminal job. Only the first caller gets `Some`.
    pub async fn claim_finalization(
        db: &SurrealDbClient,
        id: &str,
    ) -> Result<Option<Job>, AppError> {
        let claimed: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET finalized = true, updated_at = $now
                 WHERE finalized = false AND status IN $terminal
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind((
                "terminal",
                vec![JobStatus::Complete.as_str(), JobStatus::Failed.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        Ok(claimed)
    }

    pub async fn set_core_hours(
        db: &SurrealDbClient,
        id: &str,
        core_hours: Decimal,
    ) -> Result<Job, AppError> {
        let updated: Option<Job> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET core_hours = $core_hours, updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("core_hours", core_hours))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Job {id} not found.")))
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from).num_milliseconds() as f64 / 1000.0
}
