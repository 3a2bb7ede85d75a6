use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use common::storage::types::{user::User, workspace::Workspace};
use orchestrator::StartJobRequest;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workspace_details: Map<String, Value>,
}

pub async fn create_workspace(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Json(params): Json<CreateWorkspaceParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .orchestrator
        .create_workspace(
            &user,
            params.name,
            params.description,
            params.workspace_details,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "workspace": workspace }))))
}

pub async fn list_workspaces(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse, ApiError> {
    let workspaces = Workspace::list_for_user(&state.db, &user.id).await?;

    Ok(Json(json!({ "workspaces": workspaces })))
}

pub async fn get_workspace(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = Workspace::get_for_user(&state.db, &user.id, &workspace_id).await?;

    Ok(Json(json!({ "workspace": workspace })))
}

pub async fn update_workspace(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path((workspace_id, action)): Path<(String, String)>,
    Json(request): Json<StartJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match action.as_str() {
        "start" => {
            info!(user_id = %user.id, %workspace_id, job_type = %request.job_type, "Received start request");
            let job = state
                .orchestrator
                .start_job(&user, &workspace_id, request)
                .await?;
            Ok(Json(json!({
                "message": "Successful start.",
                "job": job,
            })))
        }
        _ => Err(ApiError::ValidationError("Unknown put type".to_string())),
    }
}

pub async fn delete_workspace(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .orchestrator
        .request_workspace_delete(&user, &workspace_id)
        .await?;

    Ok(Json(json!({
        "message": "Workspace queued for deletion.",
        "workspace": workspace,
    })))
}
