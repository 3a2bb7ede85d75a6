use rust_decimal::Decimal;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::{job::Job, new_record_id, workspace::Workspace};

stored_object!(UserQuota, "user_quota", {
    user_id: String,
    max_disk_space: u64,
    max_core_hours: Decimal,
    #[serde(default)]
    used_disk_space: u64,
    #[serde(default)]
    used_core_hours: Decimal
});

impl UserQuota {
    pub fn new(user_id: String, max_disk_space: u64, max_core_hours: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: new_record_id(),
            created_at: now,
            updated_at: now,
            user_id,
            max_disk_space,
            max_core_hours,
            used_disk_space: 0,
            used_core_hours: Decimal::ZERO,
        }
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<UserQuota, AppError> {
        db.get_item::<UserQuota>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User quota {id} not found.")))
    }

    pub async fn find_for_user(
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Option<UserQuota>, AppError> {
        let quota: Option<UserQuota> = db
            .query("SELECT * FROM type::table($table) WHERE user_id = $user_id LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .await?
            .take(0)?;

        Ok(quota)
    }

    /// Recomputes `used_core_hours` from the user's jobs.
    pub async fn refresh_core_hours(db: &SurrealDbClient, id: &str) -> Result<UserQuota, AppError> {
        let mut quota = Self::get(db, id).await?;
        quota.used_core_hours = Job::total_core_hours_for_user(db, &quota.user_id).await?;
        quota.updated_at = Utc::now();
        db.update_item(quota)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User quota {id} not found.")))
    }

    /// Recomputes `used_disk_space` from the user's workspaces.
    pub async fn refresh_disk_space(db: &SurrealDbClient, id: &str) -> Result<UserQuota, AppError> {
        let mut quota = Self::get(db, id).await?;
        quota.used_disk_space = Workspace::total_disk_space_for_user(db, &quota.user_id).await?;
        quota.updated_at = Utc::now();
        db.update_item(quota)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User quota {id} not found.")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::workspace::{Workspace, WorkspaceFiles};
    use uuid::Uuid;

    #[tokio::test]
    async fn usage_is_aggregated_from_jobs_and_workspaces() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let quota = UserQuota::new("user-1".into(), 10_000, Decimal::from(100));
        db.store_item(quota.clone()).await.expect("store quota");

        for hours in [Decimal::new(15, 1), Decimal::new(25, 1)] {
            let mut job = Job::new(
                "user-1".into(),
                "ws-1".into(),
                "local_test".into(),
                "local".into(),
                serde_json::Map::new(),
                serde_json::Map::new(),
            );
            job.core_hours = hours;
            job.create_and_add_to_db(&db).await.expect("store job");
        }

        let workspace = Workspace::new(
            "user-1".into(),
            "ws".into(),
            String::new(),
            serde_json::Map::new(),
        )
        .create_and_add_to_db(&db)
        .await
        .expect("store workspace");
        Workspace::update_snapshot(&db, &workspace.id, WorkspaceFiles::default(), 512)
            .await
            .expect("snapshot");

        let refreshed = UserQuota::refresh_core_hours(&db, &quota.id)
            .await
            .expect("core hours");
        assert_eq!(refreshed.used_core_hours, Decimal::from(4));

        let refreshed = UserQuota::refresh_disk_space(&db, &quota.id)
            .await
            .expect("disk space");
        assert_eq!(refreshed.used_disk_space, 512);

        let found = UserQuota::find_for_user(&db, "user-1")
            .await
            .expect("lookup");
        assert_eq!(found.map(|q| q.id), Some(quota.id));
    }
}
