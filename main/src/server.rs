use std::sync::Arc;

use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    controllers::registry::ControllerRegistry, storage::db::SurrealDbClient,
    utils::config::get_config,
};
use orchestrator::Orchestrator;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // Jobs started here are picked up by a separately running worker.
    let registry = Arc::new(ControllerRegistry::from_config(&config, Arc::clone(&db))?);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        registry,
        &config.scheduler,
    ));

    let api_state = ApiState::new(&config, db, orchestrator)?;

    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
