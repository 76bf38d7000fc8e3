use reqwest::Client;
use std::time::Duration;

fn secs_from_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

pub fn build_client() -> Client {
    build_client_with_timeout(Duration::from_secs(secs_from_env("HTTP_TIMEOUT_SECS", 15)))
}

/// Client whose request timeout is at least `timeout`; the soft per-call
/// deadlines are enforced by callers on top of it.
pub fn build_client_with_timeout(timeout: Duration) -> Client {
    let connect = secs_from_env("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
