use crate::credentials::{CredentialError, CredentialStore};
use crate::ebay::config::EbayConfig;
use crate::http::build_client_with_timeout;
use crate::models::MarketplaceData;
use crate::pricing::round_two;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Share of the mean price used as the recommended listing price.
pub const RECOMMENDED_FACTOR: f64 = 0.95;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("marketplace account must be connected")]
    AuthRequired { redirect_to: String },
    #[error("marketplace responded with HTTP {status}")]
    Upstream { status: u16, body: String },
    #[error("no priced listings found")]
    NoData,
    #[error("marketplace request timed out")]
    Timeout,
    #[error("marketplace request failed: {0}")]
    Request(String),
    #[error("credential storage failed: {0}")]
    Storage(String),
}

/// Read-only price source consulted by the listing pipeline.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn fetch_price_stats(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<MarketplaceData, MarketError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ItemSummary {
    #[serde(default)]
    pub price: Option<ItemPrice>,
}

#[derive(Debug, Deserialize)]
pub struct ItemPrice {
    // eBay sends decimal strings; tolerate bare numbers too.
    #[serde(default)]
    pub value: Option<Value>,
}

impl ItemSummary {
    fn price_value(&self) -> Option<f64> {
        let raw = self.price.as_ref()?.value.as_ref()?;
        let parsed = match raw {
            Value::String(text) => text.trim().parse::<f64>().ok()?,
            Value::Number(number) => number.as_f64()?,
            _ => return None,
        };
        (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
    }
}

/// Reduce a search response to price statistics.
pub fn aggregate(response: &SearchResponse, now: DateTime<Utc>) -> Result<MarketplaceData, MarketError> {
    let mut prices: Vec<f64> = response
        .item_summaries
        .iter()
        .filter_map(ItemSummary::price_value)
        .collect();
    if prices.is_empty() {
        return Err(MarketError::NoData);
    }
    prices.sort_by(|a, b| a.total_cmp(b));

    let count = prices.len();
    let average = prices.iter().sum::<f64>() / count as f64;
    Ok(MarketplaceData {
        // Upper middle for even counts.
        current_price: prices[count / 2],
        average_price: round_two(average),
        lowest_price: prices[0],
        highest_price: prices[count - 1],
        sold_count: response.total.unwrap_or(0),
        active_listings: count as u32,
        recommended_price: round_two(average * RECOMMENDED_FACTOR),
        last_updated: now,
    })
}

#[derive(Clone)]
pub struct MarketplaceClient {
    http: Client,
    config: EbayConfig,
    credentials: CredentialStore,
    settings_path: String,
}

impl MarketplaceClient {
    pub fn new(config: EbayConfig, credentials: CredentialStore, settings_path: &str) -> Self {
        Self {
            http: build_client_with_timeout(config.timeout),
            config,
            credentials,
            settings_path: settings_path.to_string(),
        }
    }

    fn auth_required(&self) -> MarketError {
        MarketError::AuthRequired {
            redirect_to: self.settings_path.clone(),
        }
    }

    pub async fn search(&self, token: &str, query: &str) -> Result<SearchResponse, MarketError> {
        let limit = self.config.search_limit.to_string();
        let request = self
            .http
            .get(self.config.search_url())
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.config.marketplace_id)
            .query(&[("q", query), ("limit", limit.as_str())])
            .send();

        let response = tokio::time::timeout(self.config.timeout, request)
            .await
            .map_err(|_| MarketError::Timeout)?
            .map_err(|err| {
                if err.is_timeout() {
                    MarketError::Timeout
                } else {
                    MarketError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target = "inventory.ebay", %status, body = %body, query = %query, "browse_search_rejected");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(self.auth_required());
            }
            return Err(MarketError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<SearchResponse>()
            .await
            .map_err(|err| MarketError::Request(err.to_string()))
    }
}

#[async_trait]
impl PriceOracle for MarketplaceClient {
    async fn fetch_price_stats(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<MarketplaceData, MarketError> {
        let token = match self.credentials.get_valid_token(user_id).await {
            Ok(token) => token,
            Err(CredentialError::NotAuthorized | CredentialError::InvalidLifetime(_)) => {
                return Err(self.auth_required());
            }
            Err(CredentialError::Storage(err)) => return Err(MarketError::Storage(err.to_string())),
        };
        let response = self.search(&token, query).await?;
        let data = aggregate(&response, Utc::now())?;
        info!(
            target = "inventory.ebay",
            user_id = %user_id,
            query = %query,
            active_listings = data.active_listings,
            recommended = data.recommended_price,
            "price_stats_fetched"
        );
        Ok(data)
    }
}
