use super::{CredentialRepository, ProductRepository, StoreError, StoredCredentials};
use crate::models::{Product, ProductId, ProductPatch};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Process-local store used when no database is configured, and by tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    products: Arc<Mutex<HashMap<ProductId, Product>>>,
    credentials: Arc<Mutex<HashMap<String, StoredCredentials>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_product(&self, product: Product) {
        self.products.lock().await.insert(product.id, product);
    }
}

#[async_trait]
impl ProductRepository for InMemoryStore {
    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.products.lock().await.get(&id).cloned())
    }

    async fn update(&self, id: ProductId, patch: &ProductPatch) -> Result<Product, StoreError> {
        let mut guard = self.products.lock().await;
        let product = guard
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        patch.apply(product);
        Ok(product.clone())
    }
}

#[async_trait]
impl CredentialRepository for InMemoryStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredCredentials>, StoreError> {
        Ok(self.credentials.lock().await.get(user_id).cloned())
    }

    async fn save(
        &self,
        user_id: &str,
        credentials: &StoredCredentials,
    ) -> Result<(), StoreError> {
        self.credentials
            .lock()
            .await
            .insert(user_id.to_string(), credentials.clone());
        Ok(())
    }
}
