use std::sync::Arc;

use async_trait::async_trait;
use nix::unistd::{Uid, User as OsUser};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{external_user_mapping::ExternalUserMapping, user::User},
    },
    utils::config::LocalUserAuthenticationConfig,
};

use super::{ExternalUser, ExternalUserQuery, UserAuthentication};

/// Identity provider backed by the host's own user database.
pub struct LocalUserAuthentication {
    name: String,
    db: Arc<SurrealDbClient>,
    create_external_users: bool,
}

impl LocalUserAuthentication {
    pub fn new(
        name: impl Into<String>,
        config: &LocalUserAuthenticationConfig,
        db: Arc<SurrealDbClient>,
    ) -> Self {
        Self {
            name: name.into(),
            db,
            create_external_users: config.create_external_users,
        }
    }

    async fn create_external_user(&self, username: &str) -> Result<Option<ExternalUser>, AppError> {
        let output = Command::new("useradd").arg(username).output().await?;
        if !output.status.success() {
            warn!(
                username,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "useradd failed"
            );
            return Ok(None);
        }
        info!(username, "Created OS account");
        self.get_external_user(&ExternalUserQuery::Username(username.to_string()))
            .await
    }
}

fn to_external(user: OsUser) -> ExternalUser {
    ExternalUser {
        username: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    }
}

#[async_trait]
impl UserAuthentication for LocalUserAuthentication {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has_permission(&self, user: &User) -> Result<Option<ExternalUserMapping>, AppError> {
        if let Some(mapping) = ExternalUserMapping::find(&self.db, &user.id, &self.name).await? {
            return Ok(Some(mapping));
        }

        let mut external = self
            .get_external_user(&ExternalUserQuery::Username(user.username.clone()))
            .await?;
        if external.is_none() && self.create_external_users {
            external = self.create_external_user(&user.username).await?;
        }
        let Some(external) = external else {
            return Ok(None);
        };

        let mapping = ExternalUserMapping::new(
            user.id.clone(),
            self.name.clone(),
            external.uid.to_string(),
            external.username.clone(),
            serde_json::json!({ "uid": external.uid, "gid": external.gid }),
        )
        .create_and_add_to_db(&self.db)
        .await?;

        Ok(Some(mapping))
    }

    async fn get_external_user(
        &self,
        query: &ExternalUserQuery,
    ) -> Result<Option<ExternalUser>, AppError> {
        let lookup = match query {
            ExternalUserQuery::Username(username) => OsUser::from_name(username),
            ExternalUserQuery::ExternalUserId(id) => match id.parse::<u32>() {
                Ok(uid) => OsUser::from_uid(Uid::from_raw(uid)),
                Err(_) => return Ok(None),
            },
        };

        match lookup {
            Ok(user) => Ok(user.map(to_external)),
            Err(err) => {
                error!(?query, error = %err, "OS user lookup failed");
                Ok(None)
            }
        }
    }
}
