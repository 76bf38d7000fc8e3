use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

pub type ProductId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    New,
    OpenBox,
    UsedLikeNew,
    UsedGood,
    UsedFair,
}

impl Condition {
    /// Multiplicative factor applied to a reference price for this condition.
    pub fn discount(&self) -> f64 {
        match self {
            Condition::New => 1.00,
            Condition::OpenBox => 0.85,
            Condition::UsedLikeNew => 0.80,
            Condition::UsedGood => 0.70,
            Condition::UsedFair => 0.60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::New => "new",
            Condition::OpenBox => "open_box",
            Condition::UsedLikeNew => "used_like_new",
            Condition::UsedGood => "used_good",
            Condition::UsedFair => "used_fair",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PriceSuggestion {
    pub min: f64,
    pub max: f64,
}

impl PriceSuggestion {
    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarketAnalysis {
    pub demand_score: u8,
    pub competition_level: CompetitionLevel,
    pub price_suggestion: PriceSuggestion,
    pub seo_keywords: Vec<String>,
    pub suggestions: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceData {
    pub current_price: f64,
    pub average_price: f64,
    pub lowest_price: f64,
    pub highest_price: f64,
    pub sold_count: u64,
    pub active_listings: u32,
    pub recommended_price: f64,
    pub last_updated: DateTime<Utc>,
}

/// Enrichment slot of a product. Both parts are optional and independent.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    #[serde(default)]
    pub market_analysis: Option<MarketAnalysis>,
    #[serde(default)]
    pub marketplace_data: Option<MarketplaceData>,
}

/// Result of image-first analysis: catalogue fields plus the market analysis.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductInsight {
    pub title: String,
    pub description: String,
    pub category: String,
    pub market_analysis: MarketAnalysis,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub owner_user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub purchase_price: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sold: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub analysis: Option<Analysis>,
    #[serde(default)]
    pub marketplace_listing_id: Option<String>,
}

/// Single-row write applied to a product. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub sale_price: Option<f64>,
    pub analysis: Option<Analysis>,
    pub marketplace_listing_id: Option<String>,
}

impl ProductPatch {
    pub fn apply(&self, product: &mut Product) {
        if let Some(name) = &self.name {
            product.name = name.clone();
        }
        if let Some(description) = &self.description {
            product.description = description.clone();
        }
        if let Some(category) = &self.category {
            product.category = Some(category.clone());
        }
        if let Some(price) = self.sale_price {
            product.sale_price = Some(price);
        }
        if let Some(analysis) = &self.analysis {
            product.analysis = Some(analysis.clone());
        }
        if let Some(listing_id) = &self.marketplace_listing_id {
            product.marketplace_listing_id = Some(listing_id.clone());
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
    pub redirect_to: Option<String>,
}

/// Image payload as sent by the browser client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImagePart {
    pub inline_data: InlineData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    pub mime_type: String,
}
