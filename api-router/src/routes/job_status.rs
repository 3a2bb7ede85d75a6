use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use common::storage::{db::SurrealDbClient, types::job::Job};
use futures::{SinkExt, StreamExt};
use orchestrator::notifications::{subscribe_job_status, JobStatusEvent};
use tracing::{debug, warn};

use crate::{api_state::ApiState, error::ApiError};

/// Pushes the job's current snapshot, then one snapshot per write to the job.
pub async fn job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    Job::get(&state.db, &job_id).await?;

    let db = Arc::clone(&state.db);
    Ok(ws.on_upgrade(move |socket| push_status(socket, db, job_id)))
}

async fn push_status(socket: WebSocket, db: Arc<SurrealDbClient>, job_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let events = match subscribe_job_status(&db, job_id.clone()).await {
        Ok(events) => events,
        Err(err) => {
            warn!(%job_id, error = %err, "Job status subscription failed");
            sender.close().await.ok();
            return;
        }
    };
    futures::pin_mut!(events);

    // Read after subscribing so no write between the two is lost.
    let snapshot = match Job::get(&db, &job_id).await {
        Ok(job) => JobStatusEvent::from(&job),
        Err(err) => {
            warn!(%job_id, error = %err, "Job vanished before status snapshot");
            sender.close().await.ok();
            return;
        }
    };
    if send_event(&mut sender, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(%job_id, "Job status subscriber left");
}

async fn send_event<S>(sender: &mut S, event: &JobStatusEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(payload.into())).await
}
