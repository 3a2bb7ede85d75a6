use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    controllers::registry::ControllerRegistry, storage::db::SurrealDbClient,
    utils::config::get_config,
};
use orchestrator::{spawn_workers, Orchestrator};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
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

    // Server and workers share one registry and one orchestrator.
    let registry = Arc::new(ControllerRegistry::from_config(&config, Arc::clone(&db))?);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        registry,
        &config.scheduler,
    ));

    let api_state = ApiState::new(&config, Arc::clone(&db), Arc::clone(&orchestrator))?;
    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    info!("Starting worker process");
    let mut workers = spawn_workers(db, orchestrator, &config.scheduler).await?;

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server task panicked: {:?}", e);
            }
        }
        Some(result) = workers.join_next() => {
            if let Err(e) = result {
                error!("Worker task panicked: {:?}", e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use common::{
        controllers::parameters::ParameterValidator,
        utils::config::{AppConfig, PassthroughConfig, SchedulerConfig},
    };
    use std::collections::HashMap;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn smoke_test_config(namespace: &str, database: &str) -> AppConfig {
        AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: namespace.into(),
            surrealdb_database: database.into(),
            http_port: 0,
            api_user_authentication: "local".into(),
            main_storage: "local".into(),
            main_resource: "local".into(),
            available_user_authentication: HashMap::new(),
            available_storage: HashMap::new(),
            available_resources: HashMap::new(),
            available_job_types: HashMap::new(),
            parameters: Vec::new(),
            scheduler: SchedulerConfig::default(),
            passthrough: PassthroughConfig::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let namespace = "test_ns";
        let database = format!("test_db_{}", Uuid::new_v4());
        let config = smoke_test_config(namespace, &database);
        let db = Arc::new(
            SurrealDbClient::memory(namespace, &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized()
            .await
            .expect("failed to initialize database");

        let registry = Arc::new(ControllerRegistry::new(
            ParameterValidator::new(Vec::new()),
            "local",
            "local",
            "local",
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&db),
            registry,
            &config.scheduler,
        ));

        let mut workers = spawn_workers(Arc::clone(&db), Arc::clone(&orchestrator), &config.scheduler)
            .await
            .expect("workers start");

        let api_state =
            ApiState::new(&config, Arc::clone(&db), orchestrator).expect("api state");
        let app = Router::new()
            .nest("/api/v1", api_routes_v1(&api_state))
            .with_state(api_state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);

        let ready_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready_response.status(), StatusCode::OK);

        workers.abort_all();
    }
}
