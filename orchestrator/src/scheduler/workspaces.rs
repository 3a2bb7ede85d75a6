use std::time::Duration;

use common::{
    error::AppError,
    storage::types::{
        job::Job,
        queued_task::{Lane, TaskPayload},
        user::User,
        workspace::{Workspace, WorkspaceStatus},
    },
};
use serde_json::{Map, Value};
use tracing::info;

use super::Orchestrator;

impl Orchestrator {
    /// Creates the workspace record and its directory `<external user>/<workspace id>`
    /// on the main storage, owned by the user's external account.
    #[tracing::instrument(skip_all, fields(user_id = %owner.id))]
    pub async fn create_workspace(
        &self,
        owner: &User,
        name: String,
        description: String,
        details: Map<String, Value>,
    ) -> Result<Workspace, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("Workspace name is required.".into()));
        }

        let storage = self.registry.main_storage()?;
        let auth = storage.user_authentication();
        let mapping = auth.has_permission(owner).await?.ok_or_else(|| {
            AppError::Auth(format!("User {} may not create workspaces.", owner.username))
        })?;
        let external = auth.resolve_mapping(&mapping).await?;

        let workspace = Workspace::new(owner.id.clone(), name, description, details);
        let file_path = format!("{}/{}", external.username, workspace.id);
        if !storage.is_valid_path(&file_path) {
            return Err(AppError::Validation("Invalid path specified".into()));
        }

        storage.create_dir(&file_path).await?;
        storage.set_ownership(&file_path, &mapping, true).await?;

        let workspace = workspace.create_and_add_to_db(&self.db).await?;
        let workspace = Workspace::set_file_path(&self.db, &workspace.id, &file_path).await?;

        self.enqueue(
            TaskPayload::UpdateWorkspace {
                workspace_id: workspace.id.clone(),
            },
            Lane::Long,
            None,
            Duration::ZERO,
        )
        .await?;

        info!(workspace_id = %workspace.id, file_path = %workspace.file_path, "Workspace created");
        Ok(workspace)
    }

    /// Marks the workspace `deleting` and queues removal of its files and record.
    #[tracing::instrument(skip_all, fields(user_id = %owner.id, workspace_id = %workspace_id))]
    pub async fn request_workspace_delete(
        &self,
        owner: &User,
        workspace_id: &str,
    ) -> Result<Workspace, AppError> {
        let workspace = Workspace::get_for_user(&self.db, &owner.id, workspace_id).await?;

        if workspace.status == WorkspaceStatus::Deleting {
            return Err(AppError::Validation(
                "Workspace is already being deleted.".into(),
            ));
        }
        if Job::count_unfinished_in_workspace(&self.db, workspace_id).await? > 0 {
            return Err(AppError::Validation(
                "Workspace has unfinished jobs.".into(),
            ));
        }
        let storage = self.registry.main_storage()?;
        if !workspace.file_path.is_empty() && !storage.is_valid_path(&workspace.file_path) {
            return Err(AppError::Validation("Cannot delete this workspace".into()));
        }

        let workspace = Workspace::set_status(&self.db, workspace_id, WorkspaceStatus::Deleting).await?;
        self.enqueue(
            TaskPayload::DeleteWorkspace {
                workspace_id: workspace.id.clone(),
            },
            Lane::Long,
            None,
            Duration::ZERO,
        )
        .await?;

        info!(workspace_id = %workspace.id, "Workspace queued for deletion");
        Ok(workspace)
    }
}
