use std::{sync::Arc, time::Duration};

use common::{error::AppError, storage::db::SurrealDbClient, utils::config::AppConfig};
use orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub orchestrator: Arc<Orchestrator>,
    /// Client used by the passthrough proxy. Redirects go back to the caller.
    pub http: reqwest::Client,
}

impl ApiState {
    pub fn new(
        config: &AppConfig,
        db: Arc<SurrealDbClient>,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.scheduler.http_timeout_secs))
            .build()?;

        Ok(Self {
            db,
            config: config.clone(),
            orchestrator,
            http,
        })
    }
}
