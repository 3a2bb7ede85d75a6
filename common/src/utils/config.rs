use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::controllers::parameters::ParameterSpec;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_api_user_authentication")]
    pub api_user_authentication: String,
    #[serde(default = "default_main_storage")]
    pub main_storage: String,
    #[serde(default = "default_main_resource")]
    pub main_resource: String,
    #[serde(default)]
    pub available_user_authentication: HashMap<String, UserAuthenticationConfig>,
    #[serde(default)]
    pub available_storage: HashMap<String, StorageConfig>,
    #[serde(default)]
    pub available_resources: HashMap<String, ResourceConfig>,
    #[serde(default)]
    pub available_job_types: HashMap<String, JobTypeConfig>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub passthrough: PassthroughConfig,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(tag = "user_authentication_type")]
pub enum UserAuthenticationConfig {
    #[serde(rename = "LocalUserAuthentication")]
    Local(LocalUserAuthenticationConfig),
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct LocalUserAuthenticationConfig {
    /// Run `useradd` when a user has no OS account yet.
    #[serde(default)]
    pub create_external_users: bool,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(tag = "storage_type")]
pub enum StorageConfig {
    #[serde(rename = "LocalFileSystemStorage")]
    LocalFileSystem(LocalFileSystemStorageConfig),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LocalFileSystemStorageConfig {
    pub root_dir: PathBuf,
    pub user_authentication: String,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(tag = "resource_type")]
pub enum ResourceConfig {
    #[serde(rename = "LocalResource")]
    Local(LocalResourceConfig),
    #[serde(rename = "SlurmAPIResource", alias = "HpcApiResource")]
    HpcApi(HpcApiResourceConfig),
}

impl ResourceConfig {
    pub fn storage(&self) -> &str {
        match self {
            ResourceConfig::Local(cfg) => &cfg.storage,
            ResourceConfig::HpcApi(cfg) => &cfg.storage,
        }
    }

    pub fn user_authentication(&self) -> &str {
        match self {
            ResourceConfig::Local(cfg) => &cfg.user_authentication,
            ResourceConfig::HpcApi(cfg) => &cfg.user_authentication,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LocalResourceConfig {
    pub storage: String,
    pub user_authentication: String,
    #[serde(default)]
    pub passthrough_domain: String,
    #[serde(default)]
    pub parameter_mapping: HashMap<String, String>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct HpcApiResourceConfig {
    pub storage: String,
    pub user_authentication: String,
    #[serde(default)]
    pub passthrough_domain: String,
    #[serde(default)]
    pub parameter_mapping: HashMap<String, String>,
    pub connection_details: HpcConnectionDetails,
    #[serde(default)]
    pub cpu_partition: String,
    #[serde(default)]
    pub gpu_partition: Option<String>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct HpcConnectionDetails {
    pub root_url: String,
    pub api_token: String,
    /// Lifespan requested for user tokens, in seconds.
    #[serde(default = "default_token_lifespan")]
    pub token_lifespan: u64,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq, Copy)]
pub enum JobTypeKind {
    #[serde(rename = "JupyterLabJob")]
    JupyterLab,
    #[serde(rename = "AppyterJob")]
    Appyter,
    #[serde(rename = "LocalTestJob")]
    LocalTest,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct JobTypeConfig {
    pub name: String,
    pub job_type: JobTypeKind,
    /// Template values per resource name.
    #[serde(default)]
    pub environment_details: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_pending_warning_secs")]
    pub pending_warning_secs: u64,
    #[serde(default = "default_short_lane_workers")]
    pub short_lane_workers: usize,
    #[serde(default = "default_long_lane_workers")]
    pub long_lane_workers: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            pending_warning_secs: default_pending_warning_secs(),
            short_lane_workers: default_short_lane_workers(),
            long_lane_workers: default_long_lane_workers(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PassthroughConfig {
    #[serde(default = "default_passthrough_scheme")]
    pub scheme: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            scheme: default_passthrough_scheme(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_api_user_authentication() -> String {
    "local".to_string()
}

fn default_main_storage() -> String {
    "local".to_string()
}

fn default_main_resource() -> String {
    "local".to_string()
}

fn default_token_lifespan() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_pending_warning_secs() -> u64 {
    600
}

fn default_short_lane_workers() -> usize {
    4
}

fn default_long_lane_workers() -> usize {
    2
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_passthrough_scheme() -> String {
    "http".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}
