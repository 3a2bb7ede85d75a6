use async_trait::async_trait;
use serde_json::Map;

use crate::{
    error::AppError,
    storage::types::job::JobDetailsDelta,
    utils::{config::JobTypeConfig, template_engine::TemplateEngine},
};

use super::{JobSpecProvider, ScriptParams, StatusContext, TemplatedJob};

/// Short-lived job that writes a line and sleeps. Never exposes a server.
pub struct LocalTestJob {
    inner: TemplatedJob,
}

impl LocalTestJob {
    pub fn new(key: String, config: JobTypeConfig, templates: TemplateEngine) -> Self {
        Self {
            inner: TemplatedJob::new(key, config, templates, "local_test.sh"),
        }
    }
}

#[async_trait]
impl JobSpecProvider for LocalTestJob {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn display_name(&self) -> &str {
        &self.inner.config.name
    }

    fn script(&self, params: &ScriptParams<'_>) -> Result<String, AppError> {
        self.inner.render(params, Map::new())
    }

    fn time_limit(&self, resource_name: &str) -> String {
        self.inner.time_limit(resource_name)
    }

    async fn status_check(&self, _ctx: &StatusContext<'_>) -> JobDetailsDelta {
        JobDetailsDelta::default()
    }
}
