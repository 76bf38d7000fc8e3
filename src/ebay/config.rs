use std::{env, time::Duration};

pub const SCOPES: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope",
    "https://api.ebay.com/oauth/api_scope/sell.inventory",
    "https://api.ebay.com/oauth/api_scope/sell.marketing",
    "https://api.ebay.com/oauth/api_scope/sell.account",
];

pub const SEARCH_LIMIT: usize = 10;
pub const MARKETPLACE_ID: &str = "EBAY_US";
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EbayConfig {
    pub client_id: String,
    pub client_secret: String,
    /// RuName registered with eBay; it resolves to `/credentials/callback`.
    pub redirect_uri: String,
    pub api_root: String,
    pub auth_root: String,
    pub marketplace_id: String,
    pub search_limit: usize,
    pub timeout: Duration,
}

impl EbayConfig {
    pub fn from_env() -> Self {
        let production = env::var("EBAY_ENV")
            .map(|value| {
                value.eq_ignore_ascii_case("PROD") || value.eq_ignore_ascii_case("PRODUCTION")
            })
            .unwrap_or(false);
        let (api_root, auth_root) = if production {
            ("https://api.ebay.com", "https://auth.ebay.com")
        } else {
            ("https://api.sandbox.ebay.com", "https://auth.sandbox.ebay.com")
        };
        let timeout = env::var("MARKETPLACE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(MIN_TIMEOUT)
            .max(MIN_TIMEOUT);
        Self {
            client_id: env::var("EBAY_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("EBAY_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: env::var("EBAY_REDIRECT_URI").unwrap_or_default(),
            api_root: env::var("EBAY_API_ROOT").unwrap_or_else(|_| api_root.to_string()),
            auth_root: auth_root.to_string(),
            marketplace_id: MARKETPLACE_ID.to_string(),
            search_limit: SEARCH_LIMIT,
            timeout,
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/identity/v1/oauth2/token", self.api_root)
    }

    pub fn search_url(&self) -> String {
        format!("{}/buy/browse/v1/item_summary/search", self.api_root)
    }
}
