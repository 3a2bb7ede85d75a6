use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Job types offered by this deployment, keyed by their request name.
pub async fn list_job_types(State(state): State<ApiState>) -> impl IntoResponse {
    let job_types: serde_json::Map<String, serde_json::Value> = state
        .orchestrator
        .registry()
        .job_types()
        .list()
        .into_iter()
        .map(|(key, name)| (key.clone(), json!({ "id": key, "name": name })))
        .collect();

    Json(json!({ "job_types": job_types }))
}

pub async fn list_parameters(State(state): State<ApiState>) -> impl IntoResponse {
    let parameters = state.orchestrator.registry().parameters().parameters();

    Json(json!({ "parameters": parameters }))
}
