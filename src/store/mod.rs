pub mod memory;
pub mod supabase;

use crate::models::{Product, ProductId, ProductPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use supabase::SupabaseClient;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("row not found: {0}")]
    NotFound(String),
}

/// Marketplace OAuth artifacts stored on the user row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Apply `patch` as one row update and return the stored row.
    async fn update(&self, id: ProductId, patch: &ProductPatch) -> Result<Product, StoreError>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<StoredCredentials>, StoreError>;

    async fn save(&self, user_id: &str, credentials: &StoredCredentials)
    -> Result<(), StoreError>;
}
