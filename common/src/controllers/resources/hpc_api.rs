use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, instrument, warn};

use crate::{
    controllers::{
        identity::UserAuthentication, job_types::ScriptParams, parameters::OptionTranslator,
    },
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageController,
        types::{
            external_user_mapping::ExternalUserMapping,
            job::{CurrentJobDetails, Job, JobStatus, ResourceOptions},
            user::User,
        },
    },
    utils::config::HpcApiResourceConfig,
};

use super::{hours_from_seconds, LaunchRequest, ResourceController, ResourceJobInfo};

/// Name under which per-user scheduler tokens are cached.
pub const TOKEN_MAPPING_NAME: &str = "SlurmAPIResourceAuthentication";

const EMPTY_ERROR_MESSAGE: &str = "No error message returned from Slurm API, please contact \
     system administrator for more information.";

/// Submits, polls and cancels jobs through an HPC scheduler's REST API.
pub struct HpcApiResource {
    name: String,
    config: HpcApiResourceConfig,
    storage: Arc<dyn StorageController>,
    user_authentication: Arc<dyn UserAuthentication>,
    options: OptionTranslator,
    db: Arc<SurrealDbClient>,
    client: Client,
}

/// Headers the scheduler API needs for calls made on a user's behalf.
struct UserSession {
    username: String,
    token: String,
}

#[derive(Deserialize)]
struct TokenClaims {
    exp: Option<i64>,
}

impl HpcApiResource {
    pub fn new(
        name: impl Into<String>,
        config: HpcApiResourceConfig,
        storage: Arc<dyn StorageController>,
        user_authentication: Arc<dyn UserAuthentication>,
        options: OptionTranslator,
        db: Arc<SurrealDbClient>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            config,
            storage,
            user_authentication,
            options,
            db,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{path}",
            self.config.connection_details.root_url.trim_end_matches('/')
        )
    }

    fn api_token_header(&self) -> String {
        format!("Token {}", self.config.connection_details.api_token)
    }

    fn authorized(&self, builder: RequestBuilder, session: &UserSession) -> RequestBuilder {
        builder
            .header("Authorization", self.api_token_header())
            .header("Slurm-Token", &session.token)
            .header("Slurm-User", &session.username)
    }

    async fn request_token(&self, username: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(self.url("getSlurmToken/"))
            .header("Authorization", self.api_token_header())
            .header("Slurm-User", username)
            .header(
                "Slurm-Lifespan",
                self.config.connection_details.token_lifespan.to_string(),
            )
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(AppError::Auth(text));
        }

        let body: Value = serde_json::from_str(&text)?;
        body.get("slurm_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Auth("Token response did not contain slurm_token.".into()))
    }

    /// Returns a cached scheduler token for the user, fetching a new one when
    /// there is none or it has expired.
    async fn user_token(&self, identity: &ExternalUserMapping) -> Result<String, AppError> {
        let cached = ExternalUserMapping::find(&self.db, &identity.user_id, TOKEN_MAPPING_NAME).await?;

        match cached {
            Some(mapping) => {
                let current = mapping
                    .external_user_details
                    .get("token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(token) = current.filter(|t| !token_expired(t)) {
                    return Ok(token);
                }
                let token = self.request_token(&identity.external_username).await?;
                mapping
                    .set_details(&self.db, json!({ "token": token }))
                    .await?;
                Ok(token)
            }
            None => {
                let token = self.request_token(&identity.external_username).await?;
                ExternalUserMapping::new(
                    identity.user_id.clone(),
                    TOKEN_MAPPING_NAME.to_string(),
                    identity.user_id.clone(),
                    identity.external_username.clone(),
                    json!({ "token": token }),
                )
                .create_and_add_to_db(&self.db)
                .await?;
                Ok(token)
            }
        }
    }

    async fn session_for(&self, user: &User) -> Result<(ExternalUserMapping, UserSession), AppError> {
        let identity = self
            .user_authentication
            .has_permission(user)
            .await?
            .ok_or_else(|| {
                AppError::Auth(format!(
                    "User {} has no account on resource {}.",
                    user.username, self.name
                ))
            })?;
        let token = self.user_token(&identity).await?;
        let session = UserSession {
            username: identity.external_username.clone(),
            token,
        };
        Ok((identity, session))
    }

    async fn session_for_job(&self, job: &Job) -> Result<UserSession, AppError> {
        let user = self
            .db
            .get_item::<User>(&job.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found.", job.user_id)))?;
        Ok(self.session_for(&user).await?.1)
    }

    /// Fetches the scheduler's record for a job.
    async fn fetch_job(&self, job: &Job) -> Result<Value, AppError> {
        let session = self.session_for_job(job).await?;
        let response: Value = self
            .authorized(
                self.client
                    .get(self.url(&format!("jobControl/{}", job.resource_job_id))),
                &session,
            )
            .send()
            .await?
            .json()
            .await?;

        check_errors(&response)?;
        response
            .get("jobs")
            .and_then(|jobs| jobs.get(0))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Scheduler job {} not found.", job.resource_job_id)))
    }

    fn poll(&self, job: &Job, record: &Value) -> Result<ResourceJobInfo, AppError> {
        let state = job_state(record)
            .ok_or_else(|| AppError::UnknownStatus("missing job_state".into()))?;
        if state == "TIMEOUT" {
            error!(
                job_id = %job.id,
                resource_job_id = job.resource_job_id,
                "Scheduler job has timed out"
            );
        }
        let status = self.translate_status(state)?;

        #[allow(clippy::cast_precision_loss)]
        let time_left = number_field(record, "end_time").map(|end| {
            let now = Utc::now().timestamp_millis() as f64 / 1000.0;
            (end - now).max(0.0)
        });

        Ok(ResourceJobInfo {
            status,
            current_job_details: CurrentJobDetails {
                time_left,
                ..CurrentJobDetails::default()
            },
        })
    }
}

fn token_expired(token: &str) -> bool {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data
            .claims
            .exp
            .map_or(true, |exp| Utc::now().timestamp() > exp),
        Err(err) => {
            warn!(error = %err, "Cached scheduler token could not be decoded");
            true
        }
    }
}

fn check_errors(body: &Value) -> Result<(), AppError> {
    match body.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => Err(AppError::Launch(Value::Array(errors.clone()).to_string())),
        _ => Ok(()),
    }
}

/// `job_state` is a list in newer scheduler API versions and a string in older ones.
fn job_state(record: &Value) -> Option<&str> {
    match record.get("job_state")? {
        Value::Array(states) => states.first().and_then(Value::as_str),
        Value::String(state) => Some(state.as_str()),
        _ => None,
    }
}

/// Reads `{ "<field>": { "number": n } }`, also accepting a bare number.
fn number_field(record: &Value, field: &str) -> Option<f64> {
    let value = record.get(field)?;
    value
        .get("number")
        .unwrap_or(value)
        .as_f64()
}

fn core_hours_from_record(record: &Value) -> Decimal {
    let end = number_field(record, "end_time").unwrap_or_default();
    let start = number_field(record, "start_time").unwrap_or_default();
    let cpus = record
        .get("job_resources")
        .and_then(|r| r.get("allocated_cpus"))
        .and_then(Value::as_f64)
        .unwrap_or_default();

    let core_seconds = (end - start) * cpus;
    if core_seconds <= 0.0 {
        return Decimal::ZERO;
    }
    Decimal::try_from(core_seconds)
        .map(hours_from_seconds)
        .unwrap_or_default()
}

#[async_trait]
impl ResourceController for HpcApiResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn passthrough_domain(&self) -> &str {
        &self.config.passthrough_domain
    }

    fn storage(&self) -> &Arc<dyn StorageController> {
        &self.storage
    }

    fn options(&self) -> &OptionTranslator {
        &self.options
    }

    fn translate_status(&self, native: &str) -> Result<JobStatus, AppError> {
        match native {
            "PENDING" | "SUSPENDED" => Ok(JobStatus::Pending),
            "RUNNING" | "COMPLETING" => Ok(JobStatus::Running),
            "COMPLETED" | "CANCELLED" | "TIMEOUT" => Ok(JobStatus::Complete),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(AppError::UnknownStatus(other.to_string())),
        }
    }

    fn translate_options(&self, options: &ResourceOptions) -> ResourceOptions {
        let mut translated = self.options.translate(options);
        translated.remove("gpu_enabled");
        if options.get("gpu_enabled").and_then(Value::as_bool) == Some(true) {
            translated.insert("tres_per_job".into(), Value::from("gres/gpu=1"));
            if let Some(partition) = self.config.gpu_partition.as_ref().filter(|p| !p.is_empty()) {
                translated.insert("partition".into(), Value::from(partition.as_str()));
            }
        }
        translated
    }

    #[instrument(skip_all, fields(resource = %self.name, job_id = %request.job.id))]
    async fn launch_job(&self, request: LaunchRequest<'_>) -> Result<i64, AppError> {
        let job = request.job;
        let job_dir = self.job_dir(request.workspace, &job.id);
        let job_dir_full = self.storage.full_path(&job_dir);
        let workspace_full = self.storage.full_path(&request.workspace.file_path);

        let (identity, session) = self.session_for(request.owner).await?;

        self.storage.create_dir(&job_dir).await?;
        self.storage.set_ownership(&job_dir, &identity, false).await?;

        let script = request.job_spec.script(&ScriptParams {
            job_id: &job.id,
            resource_name: &self.name,
            workspace_full_path: &workspace_full,
            job_dir: &job_dir_full,
            request_job_details: &job.job_details.request_job_details,
        })?;

        let base_environment = json!({
            "SLURM_GET_USER_ENV": 1,
            "PATH": "/bin/:/usr/bin/:/usr/local/bin/",
            "LD_LIBRARY_PATH": "/lib/:/lib64/:/usr/local/lib",
        });
        let mut job_body: Map<String, Value> = json!({
            "name": format!("{} {}", request.workspace.name, job.id),
            "current_working_directory": job_dir_full.to_string_lossy(),
            "nodes": 1,
            "standard_output": job_dir_full.join(format!("slurm_{}.out", job.id)).to_string_lossy(),
            "standard_error": job_dir_full.join(format!("slurm_{}_error.out", job.id)).to_string_lossy(),
            "environment": base_environment.clone(),
            "time_limit": request.job_spec.time_limit(&self.name),
            "requeue": false,
            "partition": self.config.cpu_partition,
        })
        .as_object()
        .cloned()
        .unwrap_or_default();

        for (key, value) in request.resource_options {
            job_body.insert(key.clone(), value.clone());
        }
        let mut environment = match job_body.remove("environment") {
            Some(Value::Object(env)) => env,
            _ => Map::new(),
        };
        if let Value::Object(base) = base_environment {
            environment.extend(base);
        }
        job_body.insert("environment".into(), Value::Object(environment));

        let body = json!({ "script": script, "job": job_body });
        let response = self
            .authorized(self.client.post(self.url("jobControl/")), &session)
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::Launch(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| AppError::Launch(err.to_string()))?;
        if status != StatusCode::OK {
            return Err(AppError::Launch(if text.is_empty() {
                EMPTY_ERROR_MESSAGE.to_string()
            } else {
                text
            }));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| {
            AppError::Launch(format!(
                "Slurm response for {} could not be deciphered: {text}",
                job.id
            ))
        })?;
        check_errors(&parsed)?;

        let handle = parsed
            .get("job_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                AppError::Launch(format!(
                    "Slurm response for {} could not be deciphered: {text}",
                    job.id
                ))
            })?;

        info!(resource_job_id = handle, "Submitted scheduler job");
        Ok(handle)
    }

    async fn get_resource_job(&self, job: &Job) -> ResourceJobInfo {
        match self.fetch_job(job).await.and_then(|record| self.poll(job, &record)) {
            Ok(info) => info,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Scheduler poll failed, reporting complete");
                ResourceJobInfo::status(JobStatus::Complete)
            }
        }
    }

    async fn get_job_core_hours(&self, job: &Job) -> Decimal {
        match self.fetch_job(job).await {
            Ok(record) => core_hours_from_record(&record),
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Unable to read core hours");
                Decimal::ZERO
            }
        }
    }

    async fn stop_job(&self, job: &Job) -> bool {
        let result: Result<(), AppError> = async {
            let session = self.session_for_job(job).await?;
            let response: Value = self
                .authorized(
                    self.client
                        .delete(self.url(&format!("jobControl/{}", job.resource_job_id))),
                    &session,
                )
                .send()
                .await?
                .json()
                .await?;
            check_errors(&response)
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Unable to cancel scheduler job");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use axum::{
        extract::{Path as AxumPath, State},
        http::HeaderMap,
        routing::{get, post},
        Json, Router,
    };
    use jsonwebtoken::{encode, EncodingKey, Header};
    use uuid::Uuid;

    use super::*;
    use crate::{
        controllers::{
            identity::{ExternalUser, ExternalUserQuery},
            job_types::{JobSpecProvider, StatusContext},
            parameters::{ParameterSpec, ParameterValidation, ParameterValidator},
        },
        storage::{
            store::LocalFileSystemStorage,
            types::{job::JobDetailsDelta, workspace::Workspace},
        },
        utils::config::HpcConnectionDetails,
    };

    #[derive(Default)]
    struct FakeScheduler {
        token_requests: AtomicUsize,
        submitted: Mutex<Option<Value>>,
        submit_reply: Mutex<(u16, String)>,
        job_reply: Mutex<Value>,
        token_exp_offset: Mutex<i64>,
    }

    fn make_token(exp: i64) -> String {
        encode(
            &Header::default(),
            &json!({ "exp": exp, "sun": "alice" }),
            &EncodingKey::from_secret(b"scheduler-secret"),
        )
        .expect("encode token")
    }

    async fn token(State(state): State<Arc<FakeScheduler>>, headers: HeaderMap) -> Json<Value> {
        assert_eq!(headers["Authorization"], "Token api-secret");
        assert_eq!(headers["Slurm-User"], "alice");
        state.token_requests.fetch_add(1, Ordering::SeqCst);
        let offset = *state.token_exp_offset.lock().expect("lock");
        Json(json!({ "slurm_token": make_token(Utc::now().timestamp() + offset) }))
    }

    async fn submit(
        State(state): State<Arc<FakeScheduler>>,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, String) {
        *state.submitted.lock().expect("lock") = Some(body);
        let (code, text) = state.submit_reply.lock().expect("lock").clone();
        (
            axum::http::StatusCode::from_u16(code).expect("status"),
            text,
        )
    }

    async fn job(
        State(state): State<Arc<FakeScheduler>>,
        AxumPath(_id): AxumPath<String>,
    ) -> Json<Value> {
        Json(state.job_reply.lock().expect("lock").clone())
    }

    async fn cancel(AxumPath(id): AxumPath<String>) -> Json<Value> {
        if id == "404" {
            Json(json!({ "errors": [{ "error": "Invalid job id" }] }))
        } else {
            Json(json!({ "errors": [] }))
        }
    }

    async fn serve(state: Arc<FakeScheduler>) -> String {
        let app = Router::new()
            .route("/getSlurmToken/", get(token))
            .route("/jobControl/", post(submit))
            .route("/jobControl/{id}", get(job).delete(cancel))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    struct AliceAuth;

    #[async_trait]
    impl UserAuthentication for AliceAuth {
        fn name(&self) -> &str {
            "cluster"
        }

        async fn has_permission(&self, user: &User) -> Result<Option<ExternalUserMapping>, AppError> {
            Ok(Some(ExternalUserMapping::new(
                user.id.clone(),
                "cluster".into(),
                nix::unistd::getuid().as_raw().to_string(),
                "alice".into(),
                Value::Null,
            )))
        }

        async fn get_external_user(
            &self,
            _query: &ExternalUserQuery,
        ) -> Result<Option<ExternalUser>, AppError> {
            Ok(Some(ExternalUser {
                username: "alice".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            }))
        }
    }

    struct EchoJob;

    #[async_trait]
    impl JobSpecProvider for EchoJob {
        fn key(&self) -> &str {
            "echo"
        }

        fn display_name(&self) -> &str {
            "Echo"
        }

        fn script(&self, params: &ScriptParams<'_>) -> Result<String, AppError> {
            Ok(format!("#!/bin/sh\necho {}\n", params.job_id))
        }

        fn time_limit(&self, _resource_name: &str) -> String {
            "45".into()
        }

        async fn status_check(&self, _ctx: &StatusContext<'_>) -> JobDetailsDelta {
            JobDetailsDelta::default()
        }
    }

    struct Fixture {
        resource: HpcApiResource,
        scheduler: Arc<FakeScheduler>,
        db: Arc<SurrealDbClient>,
        user: User,
        workspace: Workspace,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let scheduler = Arc::new(FakeScheduler::default());
        *scheduler.submit_reply.lock().expect("lock") =
            (200, json!({ "job_id": 4242, "errors": [] }).to_string());
        *scheduler.token_exp_offset.lock().expect("lock") = 3600;
        let root_url = serve(scheduler.clone()).await;

        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        let user = User::create_new("alice".into(), "alice@example.com".into(), &db)
            .await
            .expect("user");
        let mut workspace = Workspace::new(user.id.clone(), "Analysis".into(), String::new(), Map::new());
        workspace.file_path = "alice/ws".into();

        let dir = tempfile::tempdir().expect("tempdir");
        let auth: Arc<dyn UserAuthentication> = Arc::new(AliceAuth);
        let validator = ParameterValidator::new(vec![
            ParameterSpec {
                display_name: "CPUs".into(),
                description: String::new(),
                variable_name: "num_cpus".into(),
                validation: ParameterValidation::default(),
            },
            ParameterSpec {
                display_name: "GPU".into(),
                description: String::new(),
                variable_name: "gpu_enabled".into(),
                validation: ParameterValidation::default(),
            },
        ]);
        let config = HpcApiResourceConfig {
            storage: "shared".into(),
            user_authentication: "cluster".into(),
            passthrough_domain: "https://jobs.example.org".into(),
            parameter_mapping: HashMap::new(),
            connection_details: HpcConnectionDetails {
                root_url,
                api_token: "api-secret".into(),
                token_lifespan: 3600,
            },
            cpu_partition: "cpu".into(),
            gpu_partition: Some("gpu".into()),
        };
        let resource = HpcApiResource::new(
            "slurm",
            config,
            Arc::new(LocalFileSystemStorage::new("shared", dir.path().to_path_buf(), auth.clone())),
            auth,
            OptionTranslator::new(
                Arc::new(validator),
                HashMap::from([("num_cpus".to_string(), "cpus_per_task".to_string())]),
            ),
            db.clone(),
            Duration::from_secs(5),
        )
        .expect("client");

        Fixture {
            resource,
            scheduler,
            db,
            user,
            workspace,
            _dir: dir,
        }
    }

    fn launched_job(user: &User, resource_job_id: i64) -> Job {
        let mut job = Job::new(
            user.id.clone(),
            "ws-1".into(),
            "echo".into(),
            "slurm".into(),
            Map::new(),
            Map::new(),
        );
        job.resource_job_id = resource_job_id;
        job
    }

    async fn launch(fx: &Fixture, options: &ResourceOptions) -> Result<i64, AppError> {
        let job = launched_job(&fx.user, -1);
        fx.resource
            .launch_job(LaunchRequest {
                job: &job,
                workspace: &fx.workspace,
                owner: &fx.user,
                job_spec: &EchoJob,
                resource_options: options,
            })
            .await
    }

    #[tokio::test]
    async fn launch_submits_job_description_with_translated_options() {
        let fx = fixture().await;
        let options = json!({
            "num_cpus": 4,
            "gpu_enabled": true,
            "environment": { "PATH": "/evil", "EXTRA": "1" },
        })
        .as_object()
        .cloned()
        .expect("object");
        let translated = fx.resource.translate_options(&options);
        assert_eq!(translated.get("cpus_per_task"), Some(&json!(4)));
        assert_eq!(translated.get("tres_per_job"), Some(&json!("gres/gpu=1")));
        assert_eq!(translated.get("partition"), Some(&json!("gpu")));
        assert!(!translated.contains_key("gpu_enabled"));

        let mut translated = translated;
        translated.insert("environment".into(), json!({ "PATH": "/evil", "EXTRA": "1" }));

        let handle = launch(&fx, &translated).await.expect("launch");
        assert_eq!(handle, 4242);

        let submitted = fx
            .scheduler
            .submitted
            .lock()
            .expect("lock")
            .clone()
            .expect("body");
        let body = &submitted["job"];
        assert_eq!(body["nodes"], 1);
        assert_eq!(body["time_limit"], "45");
        assert_eq!(body["partition"], "gpu");
        assert_eq!(body["cpus_per_task"], 4);
        assert_eq!(body["requeue"], false);
        assert_eq!(body["environment"]["PATH"], "/bin/:/usr/bin/:/usr/local/bin/");
        assert_eq!(body["environment"]["EXTRA"], "1");
        assert!(body["name"].as_str().expect("name").starts_with("Analysis "));
        assert!(submitted["script"].as_str().expect("script").starts_with("#!/bin/sh"));
    }

    #[tokio::test]
    async fn launch_surfaces_backend_errors() {
        let fx = fixture().await;

        *fx.scheduler.submit_reply.lock().expect("lock") = (500, String::new());
        let err = launch(&fx, &Map::new()).await.expect_err("rejected");
        assert!(matches!(err, AppError::Launch(ref msg) if msg == EMPTY_ERROR_MESSAGE));

        *fx.scheduler.submit_reply.lock().expect("lock") = (400, "bad partition".into());
        let err = launch(&fx, &Map::new()).await.expect_err("rejected");
        assert!(matches!(err, AppError::Launch(ref msg) if msg == "bad partition"));

        *fx.scheduler.submit_reply.lock().expect("lock") = (200, "<html>".into());
        let err = launch(&fx, &Map::new()).await.expect_err("rejected");
        assert!(matches!(err, AppError::Launch(ref msg) if msg.contains("could not be deciphered: <html>")));

        *fx.scheduler.submit_reply.lock().expect("lock") =
            (200, json!({ "errors": [{ "error": "Invalid account" }] }).to_string());
        let err = launch(&fx, &Map::new()).await.expect_err("rejected");
        assert!(matches!(err, AppError::Launch(ref msg) if msg.contains("Invalid account")));
    }

    #[tokio::test]
    async fn token_is_cached_until_expiry() {
        let fx = fixture().await;
        launch(&fx, &Map::new()).await.expect("first");
        launch(&fx, &Map::new()).await.expect("second");
        assert_eq!(fx.scheduler.token_requests.load(Ordering::SeqCst), 1);

        let cached = ExternalUserMapping::find(&fx.db, &fx.user.id, TOKEN_MAPPING_NAME)
            .await
            .expect("lookup")
            .expect("cached");
        let expired = make_token(Utc::now().timestamp() - 10);
        cached
            .set_details(&fx.db, json!({ "token": expired }))
            .await
            .expect("expire");

        launch(&fx, &Map::new()).await.expect("third");
        assert_eq!(fx.scheduler.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn poll_reports_state_and_time_left() {
        let fx = fixture().await;
        let job = launched_job(&fx.user, 4242);
        let end = Utc::now().timestamp() + 600;

        *fx.scheduler.job_reply.lock().expect("lock") = json!({
            "errors": [],
            "jobs": [{ "job_state": ["RUNNING"], "end_time": { "number": end } }],
        });
        let info = fx.resource.get_resource_job(&job).await;
        assert_eq!(info.status, JobStatus::Running);
        let left = info.current_job_details.time_left.expect("time left");
        assert!(left > 500.0 && left <= 600.0);

        *fx.scheduler.job_reply.lock().expect("lock") = json!({
            "errors": [],
            "jobs": [{ "job_state": ["TIMEOUT"], "end_time": { "number": 1 } }],
        });
        let info = fx.resource.get_resource_job(&job).await;
        assert_eq!(info.status, JobStatus::Complete);
        assert_eq!(info.current_job_details.time_left, Some(0.0));

        *fx.scheduler.job_reply.lock().expect("lock") = json!({
            "errors": [],
            "jobs": [{ "job_state": ["BOOT_FAIL"] }],
        });
        assert_eq!(
            fx.resource.get_resource_job(&job).await.status,
            JobStatus::Complete
        );
    }

    #[tokio::test]
    async fn core_hours_from_wall_time_and_cpus() {
        let fx = fixture().await;
        let job = launched_job(&fx.user, 4242);

        *fx.scheduler.job_reply.lock().expect("lock") = json!({
            "errors": [],
            "jobs": [{
                "start_time": { "number": 1000 },
                "end_time": { "number": 4600 },
                "job_resources": { "allocated_cpus": 4 },
            }],
        });
        assert_eq!(fx.resource.get_job_core_hours(&job).await, Decimal::from(4));

        *fx.scheduler.job_reply.lock().expect("lock") = json!({
            "errors": [],
            "jobs": [{
                "start_time": { "number": 1000 },
                "end_time": { "number": 1000 },
                "job_resources": { "allocated_cpus": 4 },
            }],
        });
        assert_eq!(fx.resource.get_job_core_hours(&job).await, Decimal::ZERO);

        *fx.scheduler.job_reply.lock().expect("lock") = json!({ "errors": ["boom"] });
        assert_eq!(fx.resource.get_job_core_hours(&job).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn scheduler_states_translate() {
        let fx = fixture().await;
        for (native, expected) in [
            ("PENDING", JobStatus::Pending),
            ("SUSPENDED", JobStatus::Pending),
            ("RUNNING", JobStatus::Running),
            ("COMPLETING", JobStatus::Running),
            ("COMPLETED", JobStatus::Complete),
            ("CANCELLED", JobStatus::Complete),
            ("TIMEOUT", JobStatus::Complete),
            ("FAILED", JobStatus::Failed),
        ] {
            assert_eq!(fx.resource.translate_status(native).ok(), Some(expected));
        }
        assert!(fx.resource.translate_status("BOOT_FAIL").is_err());
    }

    #[tokio::test]
    async fn stop_reports_backend_errors_as_false() {
        let fx = fixture().await;
        assert!(fx.resource.stop_job(&launched_job(&fx.user, 4242)).await);
        assert!(!fx.resource.stop_job(&launched_job(&fx.user, 404)).await);
    }

    #[test]
    fn token_expiry_is_read_without_the_signing_key() {
        assert!(token_expired("not-a-jwt"));
        assert!(!token_expired(&make_token(Utc::now().timestamp() + 60)));
        assert!(token_expired(&make_token(Utc::now().timestamp() - 60)));
    }
}
