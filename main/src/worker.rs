use std::sync::Arc;

use common::{
    controllers::registry::ControllerRegistry, storage::db::SurrealDbClient,
    utils::config::get_config,
};
use orchestrator::{spawn_workers, Orchestrator};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

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
    db.ensure_initialized().await?;

    let registry = Arc::new(ControllerRegistry::from_config(&config, Arc::clone(&db))?);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        registry,
        &config.scheduler,
    ));

    info!(
        short_lane_workers = config.scheduler.short_lane_workers,
        long_lane_workers = config.scheduler.long_lane_workers,
        "Starting worker process"
    );
    let mut workers = spawn_workers(db, orchestrator, &config.scheduler).await?;
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!("Worker task panicked: {}", e);
        }
    }

    Ok(())
}
