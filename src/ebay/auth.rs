use crate::ebay::config::{EbayConfig, SCOPES};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum EbayAuthError {
    #[error("missing ebay app credentials in env")]
    MissingCredentials,
    #[error("oauth request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Consent page URL the browser is sent to when linking an eBay account.
pub fn authorization_url(config: &EbayConfig, state: &str) -> Result<String, EbayAuthError> {
    if config.client_id.is_empty() || config.redirect_uri.is_empty() {
        return Err(EbayAuthError::MissingCredentials);
    }
    Ok(format!(
        "{root}/oauth2/authorize?client_id={client}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
        root = config.auth_root,
        client = encode(&config.client_id),
        redirect = encode(&config.redirect_uri),
        scope = encode(&SCOPES.join(" ")),
        state = encode(state),
    ))
}

pub async fn exchange_code(
    http: &Client,
    config: &EbayConfig,
    code: &str,
) -> Result<UserToken, EbayAuthError> {
    if config.client_id.is_empty() || config.client_secret.is_empty() {
        return Err(EbayAuthError::MissingCredentials);
    }
    let body = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", config.redirect_uri.as_str()),
    ];
    let response = http
        .post(config.token_url())
        .basic_auth(&config.client_id, Some(&config.client_secret))
        .form(&body)
        .send()
        .await
        .map_err(|err| EbayAuthError::Request(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        warn!(target = "inventory.ebay", %status, body = %detail, "oauth_code_exchange_rejected");
        return Err(EbayAuthError::Request(format!("HTTP {status}")));
    }

    response
        .json::<UserToken>()
        .await
        .map_err(|err| EbayAuthError::Request(err.to_string()))
}
