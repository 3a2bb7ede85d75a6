use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use common::storage::types::{
    job::{Job, JobFilter},
    user::User,
};
use serde_json::json;

use crate::{api_state::ApiState, error::ApiError};

pub async fn list_jobs(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Query(filter): Query<JobFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = Job::list_for_user(&state.db, &user.id, &filter).await?;

    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = Job::get_for_user(&state.db, &user.id, &job_id).await?;

    Ok(Json(json!({ "job": job })))
}

pub async fn update_job(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path((job_id, action)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    match action.as_str() {
        "stop" => {
            let outcome = state.orchestrator.request_stop(&user, &job_id).await?;
            Ok(Json(json!({
                "message": outcome.message(),
                "job": outcome.job(),
            })))
        }
        _ => Err(ApiError::ValidationError("Unknown put type".to_string())),
    }
}
