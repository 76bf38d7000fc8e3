use crate::store::{CredentialRepository, StoreError, StoredCredentials};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("marketplace account is not connected or the token expired")]
    NotAuthorized,
    #[error("token lifetime of {0} seconds is out of range")]
    InvalidLifetime(i64),
    #[error("credential storage failed: {0}")]
    Storage(#[from] StoreError),
}

pub type Clock = fn() -> DateTime<Utc>;

/// True iff the access token is non-empty and expires strictly after `now`.
pub fn token_valid_at(credentials: &StoredCredentials, now: DateTime<Utc>) -> bool {
    match (&credentials.access_token, credentials.expires_at) {
        (Some(token), Some(expires_at)) => !token.trim().is_empty() && expires_at > now,
        _ => false,
    }
}

/// Per-user marketplace OAuth tokens.
///
/// Expired tokens are never refreshed here; callers send the user back
/// through the authorization flow instead.
#[derive(Clone)]
pub struct CredentialStore {
    repository: Arc<dyn CredentialRepository>,
    clock: Clock,
}

impl CredentialStore {
    pub fn new(repository: Arc<dyn CredentialRepository>) -> Self {
        Self::with_clock(repository, Utc::now)
    }

    pub fn with_clock(repository: Arc<dyn CredentialRepository>, clock: Clock) -> Self {
        Self { repository, clock }
    }

    pub async fn is_connected(&self, user_id: &str) -> Result<bool, CredentialError> {
        let now = (self.clock)();
        Ok(self
            .repository
            .load(user_id)
            .await?
            .is_some_and(|credentials| token_valid_at(&credentials, now)))
    }

    pub async fn expires_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, CredentialError> {
        Ok(self
            .repository
            .load(user_id)
            .await?
            .and_then(|credentials| credentials.expires_at))
    }

    pub async fn store(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_seconds: i64,
    ) -> Result<DateTime<Utc>, CredentialError> {
        let expires_at = Duration::try_seconds(expires_in_seconds)
            .and_then(|lifetime| (self.clock)().checked_add_signed(lifetime))
            .ok_or(CredentialError::InvalidLifetime(expires_in_seconds))?;
        let credentials = StoredCredentials {
            access_token: Some(access_token.to_string()),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(expires_at),
        };
        self.repository.save(user_id, &credentials).await?;
        info!(
            target = "inventory.credentials",
            user_id = %user_id,
            expires_at = %expires_at,
            "marketplace_credentials_stored"
        );
        Ok(expires_at)
    }

    pub async fn get_valid_token(&self, user_id: &str) -> Result<String, CredentialError> {
        let now = (self.clock)();
        match self.repository.load(user_id).await? {
            Some(credentials) if token_valid_at(&credentials, now) => {
                Ok(credentials.access_token.unwrap_or_default())
            }
            _ => Err(CredentialError::NotAuthorized),
        }
    }
}
