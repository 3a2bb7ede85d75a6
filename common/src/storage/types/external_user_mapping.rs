use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::new_record_id;

stored_object!(ExternalUserMapping, "external_user_mapping", {
    user_id: String,
    user_authentication_name: String,
    external_user_id: String,
    external_username: String,
    #[serde(default)]
    external_user_details: serde_json::Value
});

impl ExternalUserMapping {
    pub fn new(
        user_id: String,
        user_authentication_name: String,
        external_user_id: String,
        external_username: String,
        external_user_details: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_record_id(),
            created_at: now,
            updated_at: now,
            user_id,
            user_authentication_name,
            external_user_id,
            external_username,
            external_user_details,
        }
    }

    pub async fn find(
        db: &SurrealDbClient,
        user_id: &str,
        user_authentication_name: &str,
    ) -> Result<Option<ExternalUserMapping>, AppError> {
        let mapping: Option<ExternalUserMapping> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id AND user_authentication_name = $name
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_owned()))
            .bind(("name", user_authentication_name.to_owned()))
            .await?
            .take(0)?;

        Ok(mapping)
    }

    pub async fn create_and_add_to_db(
        self,
        db: &SurrealDbClient,
    ) -> Result<ExternalUserMapping, AppError> {
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    pub async fn set_details(
        mut self,
        db: &SurrealDbClient,
        external_user_details: serde_json::Value,
    ) -> Result<ExternalUserMapping, AppError> {
        self.external_user_details = external_user_details;
        self.updated_at = Utc::now();
        let id = self.id.clone();
        db.update_item(self)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("External user mapping {id} not found.")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn mappings_are_scoped_by_authentication_name() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let mapping = ExternalUserMapping::new(
            "user-1".into(),
            "local".into(),
            "1000".into(),
            "alice".into(),
            json!({}),
        )
        .create_and_add_to_db(&db)
        .await
        .expect("store mapping");

        assert!(ExternalUserMapping::find(&db, "user-1", "cluster")
            .await
            .expect("lookup")
            .is_none());

        let found = ExternalUserMapping::find(&db, "user-1", "local")
            .await
            .expect("lookup")
            .expect("mapping exists");
        assert_eq!(found.external_username, "alice");

        let updated = found
            .set_details(&db, json!({"token": "abc"}))
            .await
            .expect("update");
        assert_eq!(updated.id, mapping.id);
        assert_eq!(updated.external_user_details["token"], "abc");
    }
}
