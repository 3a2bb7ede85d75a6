use std::{collections::HashMap, os::unix::fs::PermissionsExt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid as NixPid,
};
use rust_decimal::Decimal;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    controllers::{
        identity::UserAuthentication,
        job_types::ScriptParams,
        parameters::OptionTranslator,
    },
    error::AppError,
    storage::{store::StorageController, types::job::{Job, JobStatus}},
};

use super::{hours_from_seconds, LaunchRequest, ResourceController, ResourceJobInfo};

/// Runs jobs as child processes of this host, under the owner's OS account.
pub struct LocalProcessResource {
    name: String,
    passthrough_domain: String,
    storage: Arc<dyn StorageController>,
    user_authentication: Arc<dyn UserAuthentication>,
    options: OptionTranslator,
}

impl LocalProcessResource {
    pub fn new(
        name: impl Into<String>,
        passthrough_domain: impl Into<String>,
        storage: Arc<dyn StorageController>,
        user_authentication: Arc<dyn UserAuthentication>,
        options: OptionTranslator,
    ) -> Self {
        Self {
            name: name.into(),
            passthrough_domain: passthrough_domain.into(),
            storage,
            user_authentication,
            options,
        }
    }

    fn pid_of(job: &Job) -> Option<u32> {
        u32::try_from(job.resource_job_id).ok()
    }
}

fn native_status(status: ProcessStatus) -> String {
    match status {
        ProcessStatus::Run => "running".to_string(),
        ProcessStatus::Sleep => "sleeping".to_string(),
        ProcessStatus::Zombie => "zombie".to_string(),
        ProcessStatus::Dead => "dead".to_string(),
        other => other.to_string().to_lowercase(),
    }
}

/// Status word for `pid`, or `None` when the process is gone.
fn observe_process(pid: u32) -> Option<String> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .map(|process| native_status(process.status()))
}

/// Every process below `root` in `parents` (pid to parent pid), closest first.
fn descendants(parents: &HashMap<u32, u32>, root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        let mut children: Vec<u32> = parents
            .iter()
            .filter(|(pid, parent)| **parent == current && **pid != current)
            .map(|(pid, _)| *pid)
            .collect();
        children.sort_unstable();
        for child in children {
            if !found.contains(&child) {
                found.push(child);
                frontier.push(child);
            }
        }
    }
    found
}

fn process_tree(root: u32) -> Option<Vec<u32>> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(root))?;

    let parents: HashMap<u32, u32> = system
        .processes()
        .iter()
        .filter_map(|(pid, process)| process.parent().map(|parent| (pid.as_u32(), parent.as_u32())))
        .collect();

    Some(descendants(&parents, root))
}

fn kill_pid(pid: u32) -> Result<(), AppError> {
    let raw = i32::try_from(pid).map_err(|_| AppError::Processing(format!("pid {pid} out of range")))?;
    kill(NixPid::from_raw(raw), Signal::SIGKILL)?;
    Ok(())
}

#[async_trait]
impl ResourceController for LocalProcessResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn passthrough_domain(&self) -> &str {
        &self.passthrough_domain
    }

    fn storage(&self) -> &Arc<dyn StorageController> {
        &self.storage
    }

    fn options(&self) -> &OptionTranslator {
        &self.options
    }

    fn translate_status(&self, native: &str) -> Result<JobStatus, AppError> {
        match native {
            "sleeping" | "running" => Ok(JobStatus::Running),
            "zombie" | "complete" => Ok(JobStatus::Complete),
            "dead" => Ok(JobStatus::Failed),
            other => Err(AppError::UnknownStatus(other.to_string())),
        }
    }

    #[instrument(skip_all, fields(resource = %self.name, job_id = %request.job.id))]
    async fn launch_job(&self, request: LaunchRequest<'_>) -> Result<i64, AppError> {
        let job = request.job;
        let mapping = self
            .user_authentication
            .has_permission(request.owner)
            .await?
            .ok_or_else(|| {
                AppError::Launch(format!(
                    "User {} has no account on resource {}.",
                    request.owner.username, self.name
                ))
            })?;
        let external = self.user_authentication.resolve_mapping(&mapping).await?;

        let job_dir = self.job_dir(request.workspace, &job.id);
        let job_dir_full = self.storage.full_path(&job_dir);
        let workspace_full = self.storage.full_path(&request.workspace.file_path);

        let script = request.job_spec.script(&ScriptParams {
            job_id: &job.id,
            resource_name: &self.name,
            workspace_full_path: &workspace_full,
            job_dir: &job_dir_full,
            request_job_details: &job.job_details.request_job_details,
        })?;
        let script_name = format!("{}.sh", Utc::now().timestamp_millis());

        self.storage.create_dir(&job_dir).await?;
        self.storage
            .create_file(&job_dir, &script_name, script.as_bytes())
            .await?;
        self.storage.set_ownership(&job_dir, &mapping, true).await?;

        let script_path = job_dir_full.join(&script_name);
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o744)).await?;

        let mut child = Command::new(&script_path)
            .current_dir(&job_dir_full)
            .uid(external.uid)
            .gid(external.gid)
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| AppError::Launch(format!("Unable to start job process: {err}")))?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Launch("Job process exited before reporting a pid.".into()))?;

        // Reap the child so a finished job does not linger as a zombie.
        let job_id = job.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(job_id = %job_id, %status, "Local job process exited"),
                Err(err) => warn!(job_id = %job_id, error = %err, "Failed waiting on local job process"),
            }
        });

        info!(pid, "Launched local job");
        Ok(i64::from(pid))
    }

    async fn get_resource_job(&self, job: &Job) -> ResourceJobInfo {
        let Some(pid) = Self::pid_of(job) else {
            return ResourceJobInfo::status(JobStatus::Complete);
        };

        let observed = match tokio::task::spawn_blocking(move || observe_process(pid)).await {
            Ok(observed) => observed,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Process lookup panicked");
                None
            }
        };

        let status = match observed {
            None => JobStatus::Complete,
            Some(native) => self.translate_status(&native).unwrap_or_else(|err| {
                warn!(job_id = %job.id, pid, error = %err, "Treating untranslatable process state as complete");
                JobStatus::Complete
            }),
        };

        ResourceJobInfo::status(status)
    }

    async fn get_job_core_hours(&self, job: &Job) -> Decimal {
        match (job.datetime_start, job.datetime_end) {
            (Some(start), Some(end)) if end > start => {
                let millis = Decimal::from((end - start).num_milliseconds());
                hours_from_seconds(millis / Decimal::from(1000))
            }
            _ => Decimal::ZERO,
        }
    }

    async fn stop_job(&self, job: &Job) -> bool {
        let Some(pid) = Self::pid_of(job) else {
            return false;
        };

        let tree = match tokio::task::spawn_blocking(move || process_tree(pid)).await {
            Ok(Some(tree)) => tree,
            Ok(None) => {
                warn!(job_id = %job.id, pid, "Process to stop was not found");
                return false;
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Process lookup panicked");
                return false;
            }
        };

        for child in tree.iter().rev() {
            if let Err(err) = kill_pid(*child) {
                warn!(job_id = %job.id, pid = child, error = %err, "Failed to kill child process");
            }
        }

        match kill_pid(pid) {
            Ok(()) => true,
            Err(err) => {
                error!(job_id = %job.id, pid, error = %err, "Failed to kill job process");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use chrono::Duration as ChronoDuration;
    use serde_json::Map;

    use super::*;
    use crate::{
        controllers::{
            identity::{ExternalUser, ExternalUserQuery},
            job_types::{JobSpecProvider, StatusContext},
            parameters::ParameterValidator,
        },
        storage::{
            store::LocalFileSystemStorage,
            types::{
                external_user_mapping::ExternalUserMapping,
                job::JobDetailsDelta,
                user::User,
                workspace::Workspace,
            },
        },
    };

    struct SelfAuth;

    #[async_trait]
    impl UserAuthentication for SelfAuth {
        fn name(&self) -> &str {
            "self"
        }

        async fn has_permission(&self, user: &User) -> Result<Option<ExternalUserMapping>, AppError> {
            Ok(Some(ExternalUserMapping::new(
                user.id.clone(),
                "self".into(),
                nix::unistd::getuid().as_raw().to_string(),
                user.username.clone(),
                serde_json::Value::Null,
            )))
        }

        async fn get_external_user(
            &self,
            _query: &ExternalUserQuery,
        ) -> Result<Option<ExternalUser>, AppError> {
            Ok(Some(ExternalUser {
                username: "me".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            }))
        }
    }

    struct SleepJob;

    #[async_trait]
    impl JobSpecProvider for SleepJob {
        fn key(&self) -> &str {
            "sleep"
        }

        fn display_name(&self) -> &str {
            "Sleep"
        }

        fn script(&self, params: &ScriptParams<'_>) -> Result<String, AppError> {
            Ok(format!(
                "#!/bin/sh\necho started > \"{}/output.log\"\nsleep 30\n",
                params.job_dir.display()
            ))
        }

        fn time_limit(&self, _resource_name: &str) -> String {
            "1".into()
        }

        async fn status_check(&self, _ctx: &StatusContext<'_>) -> JobDetailsDelta {
            JobDetailsDelta::default()
        }
    }

    fn resource(root: &Path) -> LocalProcessResource {
        let auth: Arc<dyn UserAuthentication> = Arc::new(SelfAuth);
        LocalProcessResource::new(
            "local",
            "http://localhost:8000",
            Arc::new(LocalFileSystemStorage::new("local", root.to_path_buf(), auth.clone())),
            auth,
            OptionTranslator::new(Arc::new(ParameterValidator::default()), HashMap::new()),
        )
    }

    fn sample_job() -> Job {
        Job::new(
            "user-1".into(),
            "ws-1".into(),
            "sleep".into(),
            "local".into(),
            Map::new(),
            Map::new(),
        )
    }

    #[test]
    fn translates_known_process_states_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = resource(dir.path());

        assert_eq!(resource.translate_status("sleeping").ok(), Some(JobStatus::Running));
        assert_eq!(resource.translate_status("running").ok(), Some(JobStatus::Running));
        assert_eq!(resource.translate_status("zombie").ok(), Some(JobStatus::Complete));
        assert_eq!(resource.translate_status("complete").ok(), Some(JobStatus::Complete));
        assert_eq!(resource.translate_status("dead").ok(), Some(JobStatus::Failed));
        assert!(matches!(
            resource.translate_status("disk-sleep"),
            Err(AppError::UnknownStatus(_))
        ));
    }

    #[test]
    fn descendants_walk_the_whole_subtree() {
        let parents = HashMap::from([(10, 1), (11, 10), (12, 10), (13, 11), (20, 1)]);
        let mut found = descendants(&parents, 10);
        found.sort_unstable();
        assert_eq!(found, vec![11, 12, 13]);
        assert!(descendants(&parents, 13).is_empty());
    }

    #[tokio::test]
    async fn core_hours_use_wall_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = resource(dir.path());
        let mut job = sample_job();
        assert_eq!(resource.get_job_core_hours(&job).await, Decimal::ZERO);

        let start = Utc::now();
        job.datetime_start = Some(start);
        job.datetime_end = Some(start + ChronoDuration::minutes(90));
        assert_eq!(resource.get_job_core_hours(&job).await, Decimal::new(15, 1));
    }

    #[tokio::test]
    async fn unknown_pid_reads_as_complete_and_cannot_be_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = resource(dir.path());
        let job = sample_job();

        assert_eq!(
            resource.get_resource_job(&job).await.status,
            JobStatus::Complete
        );
        assert!(!resource.stop_job(&job).await);
    }

    #[tokio::test]
    async fn launches_polls_and_stops_a_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = resource(dir.path());
        let user = User {
            id: "user-1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            username: "me".into(),
            email: "me@example.com".into(),
            api_key: None,
        };
        let mut workspace = Workspace::new(user.id.clone(), "ws".into(), String::new(), Map::new());
        workspace.file_path = "me/ws".into();
        let mut job = sample_job();

        let pid = resource
            .launch_job(LaunchRequest {
                job: &job,
                workspace: &workspace,
                owner: &user,
                job_spec: &SleepJob,
                resource_options: &Map::new(),
            })
            .await
            .expect("launch");
        assert!(pid > 0);
        job.resource_job_id = pid;

        let job_dir = resource.job_dir_full_path(&workspace, &job.id);
        assert!(job_dir.is_dir());

        let observed = resource.get_resource_job(&job).await.status;
        assert!(matches!(observed, JobStatus::Running | JobStatus::Complete));

        assert!(resource.stop_job(&job).await);

        let mut status = JobStatus::Running;
        for _ in 0..50 {
            status = resource.get_resource_job(&job).await.status;
            if status == JobStatus::Complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(status, JobStatus::Complete);
    }
}
