use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Caller identity resolved from an API key.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: String,
    pub api_key_id: String,
}

/// API keys from `APP_API_KEYS` (`user:key,user:key`), indexed by secret.
struct ApiKeys(HashMap<String, AuthContext>);

impl ApiKeys {
    fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        let entries = raw.split(',').map(str::trim).filter(|entry| !entry.is_empty());
        for (position, entry) in entries.enumerate() {
            let Some((user, secret)) = entry
                .split_once(':')
                .map(|(user, secret)| (user.trim(), secret.trim()))
                .filter(|(user, secret)| !user.is_empty() && !secret.is_empty())
            else {
                warn!(target = "inventory.api", entry = position + 1, "api_key_entry_ignored");
                continue;
            };
            keys.insert(
                secret.to_string(),
                AuthContext {
                    user_id: user.to_string(),
                    api_key_id: format!("key-{:02}", position + 1),
                },
            );
        }
        if keys.is_empty() {
            warn!(target = "inventory.api", "no api keys configured; protected routes answer 401");
        } else {
            info!(target = "inventory.api", key_count = keys.len(), "api_keys_loaded");
        }
        Self(keys)
    }

    fn lookup(&self, secret: &str) -> Option<AuthContext> {
        self.0.get(secret).cloned()
    }
}

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<ApiKeys>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("APP_API_KEYS").unwrap_or_else(|_| "demo-user:demo-key".to_string());
        Self::new(&raw, TokenBuckets::from_env())
    }

    pub fn new(raw_keys: &str, limiter: TokenBuckets) -> Self {
        Self {
            keys: Arc::new(ApiKeys::parse(raw_keys)),
            limiter: Arc::new(limiter),
        }
    }
}

/// Resolves the caller from `Authorization: Bearer` or `X-Api-Key` and
/// charges one token to the caller's bucket.
pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let context = match presented_key(request.headers()) {
        None => return reject(StatusCode::UNAUTHORIZED, "missing_api_key", None),
        Some(secret) => match state.keys.lookup(&secret) {
            Some(context) => context,
            None => return reject(StatusCode::UNAUTHORIZED, "invalid_api_key", None),
        },
    };

    let decision = state.limiter.take(&context.user_id).await;
    let mut response = if decision.allowed {
        request.extensions_mut().insert(context);
        next.run(request).await
    } else {
        warn!(target = "inventory.api", user_id = %context.user_id, "rate_limited");
        reject(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            Some("Too many requests"),
        )
    };
    decision.write_headers(response.headers_mut());
    response
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            raw.get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("bearer "))
                .map(|_| &raw[7..])
        });
    let api_key = headers.get("X-Api-Key").and_then(|value| value.to_str().ok());
    bearer
        .or(api_key)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, code: &str, detail: Option<&str>) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: detail.map(str::to_string),
        redirect_to: None,
    };
    (status, Json(payload)).into_response()
}

/// Per-user token buckets: `capacity` burst, refilled at `rate_per_sec`.
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate_per_sec: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(capacity);
        self.refilled_at = now;
    }
}

struct RateDecision {
    allowed: bool,
    limit: f64,
    remaining: f64,
    rate_per_sec: f64,
}

impl RateDecision {
    fn write_headers(&self, headers: &mut HeaderMap) {
        let number = |value: f64| HeaderValue::from(value.max(0.0) as u64);
        let until_full = (self.limit - self.remaining) / self.rate_per_sec;
        headers.insert("X-RateLimit-Limit", number(self.limit));
        headers.insert("X-RateLimit-Remaining", number(self.remaining.floor()));
        headers.insert("X-RateLimit-Reset", number(until_full.ceil()));
        if !self.allowed {
            let retry_after = ((1.0 - self.remaining) / self.rate_per_sec).ceil().max(1.0);
            headers.insert(header::RETRY_AFTER, number(retry_after));
        }
    }
}

fn env_f64(key: &str, min: f64, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| *value >= min)
        .unwrap_or(default)
}

impl TokenBuckets {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env_f64("RATE_LIMIT_PER_SEC", f64::MIN_POSITIVE, 5.0),
            env_f64("RATE_LIMIT_CAPACITY", 1.0, 10.0),
        )
    }

    async fn take(&self, user_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });
        bucket.refill(now, self.rate_per_sec, self.capacity);
        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        RateDecision {
            allowed,
            limit: self.capacity,
            remaining: bucket.tokens,
            rate_per_sec: self.rate_per_sec,
        }
    }
}

/// Lifetime of an OAuth `state` value.
pub const STATE_TTL_SECS: i64 = 600;
const CLOCK_SKEW_SECS: i64 = 60;

/// Signs and checks the OAuth `state` round-tripped through the provider.
///
/// Format: `base64url(user).issued_at.nonce.sha256(secret:payload)`. The
/// state binds the callback to the user who requested the authorization URL.
#[derive(Clone)]
pub struct OAuthStateSigner {
    secret: Arc<str>,
}

impl OAuthStateSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
        }
    }

    fn digest(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn sign(&self, user_id: &str) -> String {
        let nonce: u64 = rand::rng().random();
        self.sign_at(user_id, Utc::now().timestamp(), nonce)
    }

    fn sign_at(&self, user_id: &str, issued_at: i64, nonce: u64) -> String {
        let payload = format!(
            "{}.{issued_at}.{nonce:016x}",
            URL_SAFE_NO_PAD.encode(user_id)
        );
        let signature = self.digest(&payload);
        format!("{payload}.{signature}")
    }

    /// User id carried by a valid, unexpired state.
    pub fn verify(&self, state: &str) -> Option<String> {
        self.verify_at(state, Utc::now().timestamp())
    }

    fn verify_at(&self, state: &str, now: i64) -> Option<String> {
        let (payload, signature) = state.rsplit_once('.')?;
        if !constant_time_eq(self.digest(payload).as_bytes(), signature.as_bytes()) {
            return None;
        }
        let mut parts = payload.split('.');
        let (user, issued_at, _nonce) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let issued_at: i64 = issued_at.parse().ok()?;
        if issued_at > now + CLOCK_SKEW_SECS || now - issued_at > STATE_TTL_SECS {
            return None;
        }
        let user = URL_SAFE_NO_PAD.decode(user).ok()?;
        String::from_utf8(user).ok().filter(|user| !user.is_empty())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
