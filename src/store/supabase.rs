use super::{CredentialRepository, ProductRepository, StoreError, StoredCredentials};
use crate::http::build_client;
use crate::models::{Analysis, Condition, Product, ProductId, ProductPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use urlencoding::encode;

/// PostgREST client for the `products` and `users` tables.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Clone, Deserialize)]
struct ProductRow {
    id: ProductId,
    user_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    purchase_price: Option<f64>,
    #[serde(default)]
    sale_price: Option<f64>,
    #[serde(default)]
    quantity: Option<i64>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    sold: Option<bool>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    analysis: Option<Value>,
    #[serde(default)]
    ebay_listing_id: Option<String>,
}

impl ProductRow {
    fn into_product(self) -> Result<Product, StoreError> {
        // Rows written before enrichment existed carry NULL or `{}`.
        let analysis = match self.analysis {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<Analysis>(value)
                    .map_err(|err| StoreError::Deserialize(format!("analysis: {err}")))?,
            ),
        };
        Ok(Product {
            id: self.id,
            owner_user_id: self.user_id,
            name: self.name,
            description: self.description.unwrap_or_default(),
            condition: self.condition.unwrap_or_default(),
            category: self.category,
            brand: self.brand,
            purchase_price: self.purchase_price,
            sale_price: self.sale_price,
            quantity: self.quantity.unwrap_or(0).max(0) as u32,
            image_url: self.image_url,
            sold: self.sold.unwrap_or(false),
            created_at: self.created_at,
            analysis,
            marketplace_listing_id: self.ebay_listing_id,
        })
    }
}

// Serialized with explicit nulls so a save overwrites every slot.
#[derive(Debug, Deserialize, Serialize)]
struct CredentialColumns {
    ebay_access_token: Option<String>,
    ebay_refresh_token: Option<String>,
    ebay_token_expiry: Option<DateTime<Utc>>,
}

fn patch_body(patch: &ProductPatch) -> Result<Value, StoreError> {
    let mut body = Map::new();
    if let Some(name) = &patch.name {
        body.insert("name".into(), Value::String(name.clone()));
    }
    if let Some(description) = &patch.description {
        body.insert("description".into(), Value::String(description.clone()));
    }
    if let Some(category) = &patch.category {
        body.insert("category".into(), Value::String(category.clone()));
    }
    if let Some(price) = patch.sale_price {
        body.insert("sale_price".into(), Value::from(price));
    }
    if let Some(analysis) = &patch.analysis {
        let value = serde_json::to_value(analysis)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        body.insert("analysis".into(), value);
    }
    if let Some(listing_id) = &patch.marketplace_listing_id {
        body.insert("ebay_listing_id".into(), Value::String(listing_id.clone()));
    }
    Ok(Value::Object(body))
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key))
    }

    pub fn new(base_url: &str, service_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn checked(response: Response) -> Result<Response, StoreError> {
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProductRepository for SupabaseClient {
    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let url = format!(
            "{}/rest/v1/products?id=eq.{}&select=*&limit=1",
            self.base_url, id
        );
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<ProductRow> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        rows.pop().map(ProductRow::into_product).transpose()
    }

    async fn update(&self, id: ProductId, patch: &ProductPatch) -> Result<Product, StoreError> {
        let url = format!("{}/rest/v1/products?id=eq.{}", self.base_url, id);
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(&patch_body(patch)?)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<ProductRow> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?
            .into_product()
    }
}

#[async_trait]
impl CredentialRepository for SupabaseClient {
    async fn load(&self, user_id: &str) -> Result<Option<StoredCredentials>, StoreError> {
        let url = format!(
            "{}/rest/v1/users?id=eq.{}&select=ebay_access_token,ebay_refresh_token,ebay_token_expiry&limit=1",
            self.base_url,
            encode(user_id)
        );
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let mut rows: Vec<CredentialColumns> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(rows.pop().map(|row| StoredCredentials {
            access_token: row.ebay_access_token,
            refresh_token: row.ebay_refresh_token,
            expires_at: row.ebay_token_expiry,
        }))
    }

    async fn save(
        &self,
        user_id: &str,
        credentials: &StoredCredentials,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/rest/v1/users?id=eq.{}&select=ebay_access_token,ebay_refresh_token,ebay_token_expiry",
            self.base_url,
            encode(user_id)
        );
        let body = CredentialColumns {
            ebay_access_token: credentials.access_token.clone(),
            ebay_refresh_token: credentials.refresh_token.clone(),
            ebay_token_expiry: credentials.expires_at,
        };
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let checked = Self::checked(response).await?;
        // A PATCH that matched no row answers 204 or `[]`.
        let text = checked
            .text()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let rows: Vec<CredentialColumns> = if text.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&text).map_err(|err| StoreError::Deserialize(err.to_string()))?
        };
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }
}
