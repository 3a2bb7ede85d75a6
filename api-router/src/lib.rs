use api_state::ApiState;
use axum::{
    extract::FromRef,
    middleware::from_fn_with_state,
    routing::{get, put},
    Router,
};
use middleware_api_auth::api_auth;
use tower_http::trace::TraceLayer;
use routes::{
    catalog::{list_job_types, list_parameters},
    job_status::job_status,
    jobs::{get_job, list_jobs, update_job},
    liveness::live,
    passthrough::passthrough,
    readiness::ready,
    workspaces::{
        create_workspace, delete_workspace, get_workspace, list_workspaces, update_workspace,
    },
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd health checks)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // Job services reached through the proxy authenticate on their own.
    let proxied = get(passthrough)
        .post(passthrough)
        .put(passthrough)
        .patch(passthrough)
        .delete(passthrough);
    let passthrough_routes = Router::new()
        .route("/passthrough/{hostname}/{job_id}", proxied.clone())
        .route("/passthrough/{hostname}/{job_id}/{*path}", proxied)
        .route("/ws/jobs/{job_id}", get(job_status));

    // Protected API endpoints (require auth)
    let protected = Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/{action}", put(update_job))
        .route("/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/workspaces/{workspace_id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/workspaces/{workspace_id}/{action}", put(update_workspace))
        .route("/job_types", get(list_job_types))
        .route("/parameters", get(list_parameters))
        .route_layer(from_fn_with_state(app_state.clone(), api_auth));

    public
        .merge(passthrough_routes)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}
