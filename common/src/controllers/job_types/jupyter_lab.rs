use async_trait::async_trait;
use serde_json::Map;
use tracing::warn;
use url::Url;

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

pub struct JupyterLabJob {
    inner: TemplatedJob,
}

impl JupyterLabJob {
    pub fn new(key: String, config: JobTypeConfig, templates: TemplateEngine) -> Self {
        Self {
            inner: TemplatedJob::new(key, config, templates, "jupyter_lab.sh"),
        }
    }
}

/// Pulls the server URL out of the first log line that mentions one.
fn find_server_url(log: &str) -> Option<Url> {
    let line = log.lines().find(|line| line.contains("http://"))?;
    let candidate = line.split_once("] ").map_or(line, |(_, rest)| rest).trim();
    let start = candidate.find("http://")?;
    Url::parse(candidate.get(start..)?).ok()
}

fn token_of(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl JobSpecProvider for JupyterLabJob {
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

    async fn status_check(&self, ctx: &StatusContext<'_>) -> JobDetailsDelta {
        if let Some(delta) = precheck(ctx.job) {
            return delta;
        }

        let log_path = ctx
            .job_dir
            .join(format!("JupyterLabJob_{}_output.log", ctx.job.id));
        let Ok(log) = tokio::fs::read_to_string(&log_path).await else {
            warn!(job_id = %ctx.job.id, path = %log_path.display(), "JupyterLab output file missing");
            return JobDetailsDelta::message("Webserver not ready.");
        };

        let Some(url) = find_server_url(&log) else {
            return JobDetailsDelta::message("No url found.");
        };

        let Some(network) = read_network_config(ctx.job_dir).await else {
            warn!(job_id = %ctx.job.id, "Jupyter network config missing");
            return JobDetailsDelta::message("No network config found.");
        };

        let Some(token) = token_of(&url) else {
            warn!(job_id = %ctx.job.id, "Token missing in JupyterLab output");
            return JobDetailsDelta::message("Token undefined.");
        };

        let connection_string = format!("{}?token={token}", url.path());

        JobDetailsDelta {
            current_job_details: CurrentJobDetails {
                message: Some("Webserver ready.".into()),
                proxy_details: Some(ProxyDetails {
                    hostname: network.hostname,
                    port: network.port,
                    path: connection_string.clone(),
                }),
                connection_details: Some(ConnectionDetails {
                    url_path: connection_string,
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
