use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{CurrentJobDetails, Job, JobStatus},
    },
};
use futures::{future, Stream, StreamExt};
use serde::Serialize;
use surrealdb::Action;
use tracing::warn;

/// Snapshot pushed to job-status subscribers after every write to a job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatusEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub current_job_details: CurrentJobDetails,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatusEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            current_job_details: job.job_details.current_job_details.clone(),
            updated_at: job.updated_at,
        }
    }
}

/// Live status feed for one job, backed by a live query on the job table.
///
/// Every poll saves the job, so subscribers see a snapshot per poll even when
/// the status is unchanged.
pub async fn subscribe_job_status(
    db: &SurrealDbClient,
    job_id: String,
) -> Result<impl Stream<Item = JobStatusEvent>, AppError> {
    let stream = db.listen::<Job>().await?;

    Ok(stream.filter_map(move |notification| {
        let event = match notification {
            Ok(notification) if notification.data.id == job_id => match notification.action {
                Action::Create | Action::Update => Some(JobStatusEvent::from(&notification.data)),
                _ => None,
            },
            Ok(_) => None,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Job status notification failed");
                None
            }
        };
        future::ready(event)
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_their_job() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        let job = Job::new(
            "user-1".into(),
            "ws-1".into(),
            "jupyter_lab".into(),
            "local".into(),
            Map::new(),
            Map::new(),
        )
        .create_and_add_to_db(&db)
        .await
        .expect("job");
        let other = Job::new(
            "user-1".into(),
            "ws-1".into(),
            "jupyter_lab".into(),
            "local".into(),
            Map::new(),
            Map::new(),
        )
        .create_and_add_to_db(&db)
        .await
        .expect("other job");

        let stream = subscribe_job_status(&db, job.id.clone())
            .await
            .expect("subscribe");
        futures::pin_mut!(stream);

        let mut noise = other;
        noise.status = JobStatus::Running;
        noise.save(&db).await.expect("save other");

        let mut watched = job;
        watched.status = JobStatus::Running;
        watched.job_details.current_job_details.message = Some("Webserver ready.".into());
        let watched = watched.save(&db).await.expect("save watched");

        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event before timeout")
            .expect("stream open");
        assert_eq!(event.job_id, watched.id);
        assert_eq!(event.status, JobStatus::Running);
        assert_eq!(
            event.current_job_details.message.as_deref(),
            Some("Webserver ready.")
        );
    }
}
