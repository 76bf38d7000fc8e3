pub mod auth;
pub mod browse;
pub mod config;

pub use auth::{EbayAuthError, UserToken, authorization_url, exchange_code};
pub use browse::{MarketError, MarketplaceClient, PriceOracle};
pub use config::EbayConfig;
