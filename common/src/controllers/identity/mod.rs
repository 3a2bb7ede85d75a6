mod local;

use async_trait::async_trait;

pub use local::LocalUserAuthentication;

use crate::{
    error::AppError,
    storage::types::{external_user_mapping::ExternalUserMapping, user::User},
};

/// An account on the system that actually runs jobs and owns files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalUser {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalUserQuery {
    Username(String),
    ExternalUserId(String),
}

impl ExternalUserQuery {
    pub fn for_mapping(mapping: &ExternalUserMapping) -> Self {
        ExternalUserQuery::ExternalUserId(mapping.external_user_id.clone())
    }
}

/// Maps internal users onto external identities.
#[async_trait]
pub trait UserAuthentication: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the user's external mapping, creating it on first use.
    /// `None` means the user cannot act on this provider's systems.
    async fn has_permission(&self, user: &User) -> Result<Option<ExternalUserMapping>, AppError>;

    async fn get_external_user(
        &self,
        query: &ExternalUserQuery,
    ) -> Result<Option<ExternalUser>, AppError>;

    /// Resolves the external account behind an existing mapping.
    async fn resolve_mapping(&self, mapping: &ExternalUserMapping) -> Result<ExternalUser, AppError> {
        self.get_external_user(&ExternalUserQuery::for_mapping(mapping))
            .await?
            .ok_or_else(|| {
                AppError::Identity(format!(
                    "External user {} no longer exists.",
                    mapping.external_username
                ))
            })
    }
}
