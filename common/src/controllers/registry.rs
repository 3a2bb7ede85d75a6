use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::info;

use crate::{
    controllers::{
        identity::{LocalUserAuthentication, UserAuthentication},
        job_types::{JobSpecProvider, JobTypeRegistry},
        parameters::{OptionTranslator, ParameterValidator},
        resources::{HpcApiResource, LocalProcessResource, ResourceController},
    },
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::{LocalFileSystemStorage, StorageController},
    },
    utils::{
        config::{AppConfig, ResourceConfig, StorageConfig, UserAuthenticationConfig},
        template_engine::TemplateEngine,
    },
};

/// Every configured controller, built once at startup and shared by reference.
#[derive(Clone)]
pub struct ControllerRegistry {
    user_authentications: HashMap<String, Arc<dyn UserAuthentication>>,
    storages: HashMap<String, Arc<dyn StorageController>>,
    resources: HashMap<String, Arc<dyn ResourceController>>,
    job_types: JobTypeRegistry,
    parameters: Arc<ParameterValidator>,
    main_resource: String,
    main_storage: String,
    api_user_authentication: String,
}

fn lookup<T: ?Sized>(
    map: &HashMap<String, Arc<T>>,
    kind: &str,
    name: &str,
) -> Result<Arc<T>, AppError> {
    map.get(name)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("No {kind} named '{name}' is configured.")))
}

impl ControllerRegistry {
    pub fn new(
        parameters: ParameterValidator,
        main_resource: impl Into<String>,
        main_storage: impl Into<String>,
        api_user_authentication: impl Into<String>,
    ) -> Self {
        Self {
            user_authentications: HashMap::new(),
            storages: HashMap::new(),
            resources: HashMap::new(),
            job_types: JobTypeRegistry::default(),
            parameters: Arc::new(parameters),
            main_resource: main_resource.into(),
            main_storage: main_storage.into(),
            api_user_authentication: api_user_authentication.into(),
        }
    }

    pub fn from_config(config: &AppConfig, db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        let templates = TemplateEngine::embedded()?;
        let mut registry = Self::new(
            ParameterValidator::new(config.parameters.clone()),
            config.main_resource.clone(),
            config.main_storage.clone(),
            config.api_user_authentication.clone(),
        );
        registry.job_types = JobTypeRegistry::from_config(&config.available_job_types, &templates);

        for (name, auth) in &config.available_user_authentication {
            let controller: Arc<dyn UserAuthentication> = match auth {
                UserAuthenticationConfig::Local(cfg) => {
                    Arc::new(LocalUserAuthentication::new(name.clone(), cfg, db.clone()))
                }
            };
            registry.user_authentications.insert(name.clone(), controller);
        }

        for (name, storage) in &config.available_storage {
            let controller: Arc<dyn StorageController> = match storage {
                StorageConfig::LocalFileSystem(cfg) => Arc::new(LocalFileSystemStorage::new(
                    name.clone(),
                    cfg.root_dir.clone(),
                    registry.user_authentication(&cfg.user_authentication)?,
                )),
            };
            registry.storages.insert(name.clone(), controller);
        }

        let timeout = Duration::from_secs(config.scheduler.http_timeout_secs);
        for (name, resource) in &config.available_resources {
            let storage = registry.storage(resource.storage())?;
            let auth = registry.user_authentication(resource.user_authentication())?;
            let controller: Arc<dyn ResourceController> = match resource {
                ResourceConfig::Local(cfg) => Arc::new(LocalProcessResource::new(
                    name.clone(),
                    cfg.passthrough_domain.clone(),
                    storage,
                    auth,
                    OptionTranslator::new(registry.parameters.clone(), cfg.parameter_mapping.clone()),
                )),
                ResourceConfig::HpcApi(cfg) => Arc::new(HpcApiResource::new(
                    name.clone(),
                    cfg.clone(),
                    storage,
                    auth,
                    OptionTranslator::new(registry.parameters.clone(), cfg.parameter_mapping.clone()),
                    db.clone(),
                    timeout,
                )?),
            };
            registry.resources.insert(name.clone(), controller);
        }

        registry.main_resource()?;
        registry.main_storage()?;
        registry.api_user_authentication()?;

        info!(
            resources = registry.resources.len(),
            storages = registry.storages.len(),
            job_types = registry.job_types.list().len(),
            "Controller registry built"
        );
        Ok(registry)
    }

    #[must_use]
    pub fn with_user_authentication(mut self, controller: Arc<dyn UserAuthentication>) -> Self {
        self.user_authentications
            .insert(controller.name().to_string(), controller);
        self
    }

    #[must_use]
    pub fn with_storage(mut self, controller: Arc<dyn StorageController>) -> Self {
        self.storages.insert(controller.name().to_string(), controller);
        self
    }

    #[must_use]
    pub fn with_resource(mut self, controller: Arc<dyn ResourceController>) -> Self {
        self.resources.insert(controller.name().to_string(), controller);
        self
    }

    #[must_use]
    pub fn with_job_type(mut self, provider: Arc<dyn JobSpecProvider>) -> Self {
        self.job_types.insert(provider);
        self
    }

    pub fn resource(&self, name: &str) -> Result<Arc<dyn ResourceController>, AppError> {
        lookup(&self.resources, "resource", name)
    }

    pub fn storage(&self, name: &str) -> Result<Arc<dyn StorageController>, AppError> {
        lookup(&self.storages, "storage", name)
    }

    pub fn user_authentication(&self, name: &str) -> Result<Arc<dyn UserAuthentication>, AppError> {
        lookup(&self.user_authentications, "user authentication", name)
    }

    pub fn main_resource(&self) -> Result<Arc<dyn ResourceController>, AppError> {
        self.resource(&self.main_resource)
    }

    pub fn main_storage(&self) -> Result<Arc<dyn StorageController>, AppError> {
        self.storage(&self.main_storage)
    }

    pub fn api_user_authentication(&self) -> Result<Arc<dyn UserAuthentication>, AppError> {
        self.user_authentication(&self.api_user_authentication)
    }

    pub fn job_types(&self) -> &JobTypeRegistry {
        &self.job_types
    }

    pub fn parameters(&self) -> &ParameterValidator {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};
    use uuid::Uuid;

    use super::*;

    fn sample_config(root: &str, main_resource: &str) -> AppConfig {
        let json = format!(
            r#"{{
                "surrealdb_address": "mem://",
                "surrealdb_username": "root",
                "surrealdb_password": "root",
                "surrealdb_namespace": "ns",
                "surrealdb_database": "db",
                "http_port": 3000,
                "main_resource": "{main_resource}",
                "available_user_authentication": {{
                    "local": {{ "user_authentication_type": "LocalUserAuthentication" }}
                }},
                "available_storage": {{
                    "local": {{
                        "storage_type": "LocalFileSystemStorage",
                        "root_dir": "{root}",
                        "user_authentication": "local"
                    }}
                }},
                "available_resources": {{
                    "local": {{
                        "resource_type": "LocalResource",
                        "storage": "local",
                        "user_authentication": "local",
                        "passthrough_domain": "http://localhost:3000"
                    }},
                    "slurm": {{
                        "resource_type": "SlurmAPIResource",
                        "storage": "local",
                        "user_authentication": "local",
                        "connection_details": {{
                            "root_url": "http://127.0.0.1:9",
                            "api_token": "secret"
                        }},
                        "cpu_partition": "cpu"
                    }}
                }},
                "available_job_types": {{
                    "jupyter_lab": {{ "name": "JupyterLab", "job_type": "JupyterLabJob" }}
                }}
            }}"#
        );
        Config::builder()
            .add_source(File::from_str(&json, FileFormat::Json))
            .build()
            .and_then(Config::try_deserialize)
            .expect("config")
    }

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        )
    }

    #[tokio::test]
    async fn builds_every_configured_controller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sample_config(&dir.path().to_string_lossy(), "local");
        let registry = ControllerRegistry::from_config(&config, memory_db().await).expect("registry");

        assert_eq!(registry.main_resource().expect("main").name(), "local");
        assert_eq!(registry.resource("slurm").expect("slurm").name(), "slurm");
        assert_eq!(registry.main_storage().expect("storage").root_dir(), dir.path());
        assert!(registry.job_types().get("jupyter_lab").is_ok());
        assert!(matches!(
            registry.resource("missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_main_resource_fails_at_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sample_config(&dir.path().to_string_lossy(), "nowhere");
        assert!(ControllerRegistry::from_config(&config, memory_db().await).is_err());
    }
}
