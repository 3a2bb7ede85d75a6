use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::new_record_id;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    #[default]
    Idle,
    Active,
    Deleting,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Idle => "idle",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Deleting => "deleting",
            WorkspaceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
}

/// Files and symlinks below a workspace root, as relative names.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkspaceFiles {
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub symlinks: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkspaceDetails {
    #[serde(default)]
    pub request_workspace_details: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub current_workspace_details: WorkspaceFiles,
}

stored_object!(Workspace, "workspace", {
    user_id: String,
    name: String,
    description: String,
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    disk_space: u64,
    #[serde(default)]
    workspace_details: WorkspaceDetails,
    status: WorkspaceStatus,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    datetime_last_job_launch: Option<DateTime<Utc>>
});

impl Workspace {
    pub fn new(
        user_id: String,
        name: String,
        description: String,
        request_workspace_details: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_record_id(),
            created_at: now,
            updated_at: now,
            user_id,
            name,
            description,
            file_path: String::new(),
            disk_space: 0,
            workspace_details: WorkspaceDetails {
                request_workspace_details,
                ..WorkspaceDetails::default()
            },
            status: WorkspaceStatus::Idle,
            datetime_last_job_launch: None,
        }
    }

    pub async fn create_and_add_to_db(self, db: &SurrealDbClient) -> Result<Workspace, AppError> {
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<Workspace, AppError> {
        db.get_item::<Workspace>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workspace {id} not found.")))
    }

    pub async fn get_for_user(
        db: &SurrealDbClient,
        user_id: &str,
        id: &str,
    ) -> Result<Workspace, AppError> {
        match db.get_item::<Workspace>(id).await? {
            Some(workspace) if workspace.user_id == user_id => Ok(workspace),
            _ => Err(AppError::NotFound(format!(
                "Workspace {id} not found for user."
            ))),
        }
    }

    pub async fn list_for_user(
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Vec<Workspace>, AppError> {
        let workspaces: Vec<Workspace> = db
            .query("SELECT * FROM type::table($table) WHERE user_id = $user_id ORDER BY created_at DESC")
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(workspaces)
    }

    pub async fn total_disk_space_for_user(
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<u64, AppError> {
        let sizes: Vec<u64> = db
            .query("SELECT VALUE disk_space FROM type::table($table) WHERE user_id = $user_id")
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(sizes.into_iter().fold(0_u64, u64::saturating_add))
    }

    pub async fn set_file_path(
        db: &SurrealDbClient,
        id: &str,
        file_path: &str,
    ) -> Result<Workspace, AppError> {
        let updated: Option<Workspace> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET file_path = $file_path, updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("file_path", file_path.to_owned()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Workspace {id} not found.")))
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: WorkspaceStatus,
    ) -> Result<Workspace, AppError> {
        let updated: Option<Workspace> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $status, updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("status", status.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Workspace {id} not found.")))
    }

    /// Records a job launch and flips the workspace to `active`.
    pub async fn mark_active(db: &SurrealDbClient, id: &str) -> Result<Workspace, AppError> {
        let now = Utc::now();
        let updated: Option<Workspace> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $active, datetime_last_job_launch = $now, updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("active", WorkspaceStatus::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Workspace {id} not found.")))
    }

    /// Flips an `active` workspace to `idle`. `None` when it was not active,
    /// so concurrent finalizers flip it at most once.
    pub async fn mark_idle_if_active(
        db: &SurrealDbClient,
        id: &str,
    ) -> Result<Option<Workspace>, AppError> {
        let updated: Option<Workspace> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET status = $idle, updated_at = $now
                 WHERE status = $active
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("idle", WorkspaceStatus::Idle.as_str()))
            .bind(("active", WorkspaceStatus::Active.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        Ok(updated)
    }

    pub async fn update_snapshot(
        db: &SurrealDbClient,
        id: &str,
        files: WorkspaceFiles,
        disk_space: u64,
    ) -> Result<Workspace, AppError> {
        let updated: Option<Workspace> = db
            .query(
                "UPDATE type::thing($table, $id)
                 SET workspace_details.current_workspace_details = $files,
                     disk_space = $disk_space,
                     updated_at = $now
                 RETURN *",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("files", files))
            .bind(("disk_space", disk_space))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Workspace {id} not found.")))
    }
}
