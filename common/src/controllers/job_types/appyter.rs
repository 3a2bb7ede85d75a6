use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    error::AppError,
    storage::types::job::{
        ConnectionDetails, CurrentJobDetails, JobDetailsDelta, JobMetrics, ProxyDetails,
    },
    utils::{config::JobTypeConfig, template_engine::TemplateEngine},
};

use super::{
    precheck, read_network_config, seconds_since_start, JobSpecProvider, ScriptParams,
    StatusContext, TemplatedJob,
};

const DEFAULT_NOTEBOOK: &str = "appyter.ipynb";

pub struct AppyterJob {
    inner: TemplatedJob,
}

impl AppyterJob {
    pub fn new(key: String, config: JobTypeConfig, templates: TemplateEngine) -> Self {
        Self {
            inner: TemplatedJob::new(key, config, templates, "appyter.sh"),
        }
    }
}

#[async_trait]
impl JobSpecProvider for AppyterJob {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn display_name(&self) -> &str {
        &self.inner.config.name
    }

    fn script(&self, params: &ScriptParams<'_>) -> Result<String, AppError> {
        let notebook_path = params
            .request_job_details
            .get("notebook_path")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_NOTEBOOK);
        let mut extra = Map::new();
        extra.insert("notebook_path".into(), Value::from(notebook_path));
        self.inner.render(params, extra)
    }

    fn time_limit(&self, resource_name: &str) -> String {
        self.inner.time_limit(resource_name)
    }

    async fn status_check(&self, ctx: &StatusContext<'_>) -> JobDetailsDelta {
        if let Some(delta) = precheck(ctx.job) {
            return delta;
        }

        let Some(network) = read_network_config(ctx.job_dir).await else {
            warn!(job_id = %ctx.job.id, "Appyter network config missing");
            return JobDetailsDelta::message("No network config found.");
        };

        if !tokio::fs::try_exists(ctx.job_dir.join(".env"))
            .await
            .unwrap_or(false)
        {
            warn!(job_id = %ctx.job.id, "Appyter environment marker missing");
            return JobDetailsDelta::message("Webserver not ready.");
        }

        JobDetailsDelta {
            current_job_details: CurrentJobDetails {
                message: Some("Webserver ready.".into()),
                proxy_details: Some(ProxyDetails {
                    hostname: network.hostname,
                    port: network.port,
                    path: String::new(),
                }),
                connection_details: Some(ConnectionDetails {
                    url_path: String::new(),
                    url_domain: String::new(),
                    subdomain: Some(network.subdomain),
                }),
                time_left: None,
            },
            metrics: JobMetrics {
                time_init: seconds_since_start(ctx.job, ctx.now),
                ..JobMetrics::default()
            },
        }
    }
}
