use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::new_record_id;

stored_object!(User, "user", {
    username: String,
    email: String,
    api_key: Option<String>
});

impl User {
    pub async fn create_new(
        username: String,
        email: String,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        if Self::find_by_username(&username, db).await?.is_some() {
            return Err(AppError::Validation(format!(
                "User {username} already exists."
            )));
        }

        let now = Utc::now();
        let user = User {
            id: new_record_id(),
            created_at: now,
            updated_at: now,
            username,
            email,
            api_key: None,
        };

        db.store_item(user)
            .await?
            .ok_or(AppError::Auth("User failed to create".into()))
    }

    pub async fn find_by_username(
        username: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let user: Option<User> = db
            .client
            .query("SELECT * FROM user WHERE username = $username LIMIT 1")
            .bind(("username", username.to_string()))
            .await?
            .take(0)?;

        Ok(user)
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let user: Option<User> = db
            .client
            .query("SELECT * FROM user WHERE api_key = $api_key LIMIT 1")
            .bind(("api_key", api_key.to_string()))
            .await?
            .take(0)?;

        Ok(user)
    }

    pub async fn set_api_key(id: &str, db: &SurrealDbClient) -> Result<String, AppError> {
        let api_key = format!("sk_{}", new_record_id().replace('-', ""));

        let user: Option<User> = db
            .client
            .query(
                "UPDATE type::thing('user', $id)
                SET api_key = $api_key
                RETURN AFTER",
            )
            .bind(("id", id.to_owned()))
            .bind(("api_key", api_key.clone()))
            .await?
            .take(0)?;

        if user.is_some() {
            Ok(api_key)
        } else {
            Err(AppError::Auth("User not found".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_test_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_user_creation_rejects_duplicates() {
        let db = setup_test_db().await;

        let user = User::create_new("alice".into(), "alice@example.com".into(), &db)
            .await
            .expect("Failed to create user");
        assert_eq!(user.username, "alice");
        assert!(user.api_key.is_none());

        let duplicate = User::create_new("alice".into(), "other@example.com".into(), &db).await;
        assert!(matches!(duplicate, Err(AppError::Validation(_))));

        let found = User::find_by_username("alice", &db)
            .await
            .expect("lookup")
            .expect("user exists");
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn test_api_key_management() {
        let db = setup_test_db().await;
        let user = User::create_new("bob".into(), "bob@example.com".into(), &db)
            .await
            .expect("Failed to create user");

        let api_key = User::set_api_key(&user.id, &db)
            .await
            .expect("Failed to set API key");
        assert!(api_key.starts_with("sk_"));

        let found_user = User::find_by_api_key(&api_key, &db)
            .await
            .expect("Error searching by API key")
            .expect("user found by key");
        assert_eq!(found_user.id, user.id);

        let not_found = User::find_by_api_key("sk_unknown", &db)
            .await
            .expect("Error searching by API key");
        assert!(not_found.is_none());

        let missing = User::set_api_key("missing", &db).await;
        assert!(matches!(missing, Err(AppError::Auth(_))));
    }
}
