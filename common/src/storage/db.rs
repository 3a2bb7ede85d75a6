use crate::error::AppError;

use super::types::StoredObject;
use futures::Stream;
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        Self::build_indexes(self).await?;
        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON job FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_user ON job FIELDS user_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_workspace ON job FIELDS workspace_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_workspace_user ON workspace FIELDS user_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_user_api_key ON user FIELDS api_key")
            .await?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_queued_task_claim ON queued_task FIELDS lane, state, scheduled_at",
            )
            .await?;

        Ok(())
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Replaces the stored record with `item`. Returns `None` when no record with that id exists.
    pub async fn update_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        let id = item.get_id().to_owned();
        self.client
            .update((T::table_name(), id.as_str()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to delete
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * A stream of create/update/delete notifications for the table
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Sample, "sample", {
        label: String,
        counter: u32
    });

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_store_update_and_delete() {
        let db = memory_db().await;
        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let sample = Sample {
            id: "sample-1".to_string(),
            label: "first".to_string(),
            counter: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(sample.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let mut changed = sample.clone();
        changed.counter = 7;
        let updated = db
            .update_item(changed.clone())
            .await
            .expect("Failed to update");
        assert_eq!(updated.map(|p| p.counter), Some(7));

        let fetched = db
            .get_item::<Sample>(&sample.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(changed.clone()));

        let deleted = db
            .delete_item::<Sample>(&sample.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(changed));

        let missing = db
            .get_item::<Sample>(&sample.id)
            .await
            .expect("Failed fetch post delete");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_build_indexes_is_repeatable() {
        let db = memory_db().await;
        db.build_indexes().await.expect("first index build");
        db.build_indexes().await.expect("second index build");
    }
}
