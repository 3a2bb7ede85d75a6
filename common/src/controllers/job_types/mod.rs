mod appyter;
mod jupyter_lab;
mod local_test;

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

pub use appyter::AppyterJob;
pub use jupyter_lab::JupyterLabJob;
pub use local_test::LocalTestJob;

use crate::{
    error::AppError,
    storage::types::job::{Job, JobDetailsDelta, JobStatus},
    utils::{
        config::{JobTypeConfig, JobTypeKind},
        template_engine::TemplateEngine,
    },
};

pub const DEFAULT_TIME_LIMIT: &str = "30";
pub const FAILED_JOB_MESSAGE: &str =
    "This job has failed. Support team has been notified and will investigate the error.";

/// Inputs for rendering a launch script.
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    pub job_id: &'a str,
    pub resource_name: &'a str,
    pub workspace_full_path: &'a Path,
    pub job_dir: &'a Path,
    pub request_job_details: &'a Map<String, Value>,
}

/// What a status check may look at.
#[derive(Debug, Clone)]
pub struct StatusContext<'a> {
    pub job: &'a Job,
    pub job_dir: &'a Path,
    pub now: DateTime<Utc>,
}

/// Produces launch scripts for one job type and reads back its readiness.
#[async_trait]
pub trait JobSpecProvider: Send + Sync {
    fn key(&self) -> &str;

    fn display_name(&self) -> &str;

    fn script(&self, params: &ScriptParams<'_>) -> Result<String, AppError>;

    /// Wall-clock limit requested from batch schedulers, in minutes.
    fn time_limit(&self, resource_name: &str) -> String;

    /// Inspects the job directory for connection details.
    ///
    /// Safe to call on every poll. Returns an empty delta once connection
    /// details are known.
    async fn status_check(&self, ctx: &StatusContext<'_>) -> JobDetailsDelta;
}

/// Config shared by every templated job type.
#[derive(Clone)]
pub(crate) struct TemplatedJob {
    key: String,
    config: JobTypeConfig,
    templates: TemplateEngine,
    template_name: &'static str,
}

impl TemplatedJob {
    pub(crate) fn new(
        key: String,
        config: JobTypeConfig,
        templates: TemplateEngine,
        template_name: &'static str,
    ) -> Self {
        Self {
            key,
            config,
            templates,
            template_name,
        }
    }

    fn environment(&self, resource_name: &str) -> Option<&Map<String, Value>> {
        self.config.environment_details.get(resource_name)
    }

    /// Renders with per-resource environment values layered over `extra`.
    pub(crate) fn render(
        &self,
        params: &ScriptParams<'_>,
        extra: Map<String, Value>,
    ) -> Result<String, AppError> {
        let mut ctx = extra;
        ctx.insert("job_id".into(), Value::from(params.job_id));
        ctx.insert(
            "workspace_full_path".into(),
            Value::from(params.workspace_full_path.to_string_lossy().into_owned()),
        );
        ctx.insert(
            "job_dir".into(),
            Value::from(params.job_dir.to_string_lossy().into_owned()),
        );
        if let Some(environment) = self.environment(params.resource_name) {
            for (k, v) in environment {
                ctx.insert(k.clone(), v.clone());
            }
        }

        let ctx = minijinja::Value::from_serialize(&ctx);
        Ok(self.templates.render(self.template_name, &ctx)?)
    }

    pub(crate) fn time_limit(&self, resource_name: &str) -> String {
        match self
            .environment(resource_name)
            .and_then(|env| env.get("time_limit"))
        {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => DEFAULT_TIME_LIMIT.to_string(),
        }
    }
}

/// Host and port a job's web server announced, plus the routable subdomain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NetworkConfig {
    pub hostname: String,
    pub port: u16,
    pub subdomain: String,
}

/// Parses the `hostname-port` marker a launch script writes once its server
/// port is known.
pub(crate) fn parse_network_config(contents: &str) -> Option<NetworkConfig> {
    let line = contents.lines().next()?.trim();
    let (hostname, port) = line.rsplit_once('-')?;
    let port = port.parse().ok()?;
    if hostname.is_empty() {
        return None;
    }
    Some(NetworkConfig {
        hostname: hostname.to_string(),
        port,
        subdomain: line.replace('.', "-"),
    })
}

pub(crate) async fn read_network_config(job_dir: &Path) -> Option<NetworkConfig> {
    let path = job_dir.join(".network_config");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let parsed = parse_network_config(&contents);
            if parsed.is_none() {
                warn!(path = %path.display(), "Malformed network config");
            }
            parsed
        }
        Err(_) => None,
    }
}

/// Checks that run before any artifact parsing.
pub(crate) fn precheck(job: &Job) -> Option<JobDetailsDelta> {
    if job.status == JobStatus::Failed {
        return Some(JobDetailsDelta::message(FAILED_JOB_MESSAGE));
    }
    if job
        .job_details
        .current_job_details
        .connection_details
        .is_some()
    {
        return Some(JobDetailsDelta::default());
    }
    None
}

pub(crate) fn seconds_since_start(job: &Job, now: DateTime<Utc>) -> Option<f64> {
    job.datetime_start.map(|start| {
        #[allow(clippy::cast_precision_loss)]
        let millis = (now - start).num_milliseconds() as f64;
        millis / 1000.0
    })
}

/// Job types selectable by key, built once from configuration.
#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    providers: HashMap<String, Arc<dyn JobSpecProvider>>,
}

impl JobTypeRegistry {
    pub fn from_config(
        configs: &HashMap<String, JobTypeConfig>,
        templates: &TemplateEngine,
    ) -> Self {
        let providers = configs
            .iter()
            .map(|(key, config)| {
                let provider: Arc<dyn JobSpecProvider> = match config.job_type {
                    JobTypeKind::JupyterLab => Arc::new(JupyterLabJob::new(
                        key.clone(),
                        config.clone(),
                        templates.clone(),
                    )),
                    JobTypeKind::Appyter => Arc::new(AppyterJob::new(
                        key.clone(),
                        config.clone(),
                        templates.clone(),
                    )),
                    JobTypeKind::LocalTest => Arc::new(LocalTestJob::new(
                        key.clone(),
                        config.clone(),
                        templates.clone(),
                    )),
                };
                (key.clone(), provider)
            })
            .collect();

        Self { providers }
    }

    pub fn insert(&mut self, provider: Arc<dyn JobSpecProvider>) {
        self.providers.insert(provider.key().to_string(), provider);
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn JobSpecProvider>, AppError> {
        self.providers
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::Validation("Invalid job type specified".into()))
    }

    /// `(key, display name)` pairs, sorted by key.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .providers
            .iter()
            .map(|(key, provider)| (key.clone(), provider.display_name().to_string()))
            .collect();
        entries.sort();
        entries
    }
}
