use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is not valid: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide settings read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub frontend_url: String,
    pub settings_path: String,
    pub session_secret: String,
    pub queue_capacity: usize,
    pub metrics_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let session_secret = get("SESSION_SECRET").ok_or(ConfigError::Missing("SESSION_SECRET"))?;
        let port = match get("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw,
            })?,
            None => 8000,
        };
        let settings_path = get("SETTINGS_PATH").unwrap_or_else(|| "/settings/marketplace".into());
        if !settings_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "SETTINGS_PATH",
                value: settings_path,
            });
        }

        Ok(Self {
            port,
            body_limit: get("REQUEST_MAX_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(16 * 1024 * 1024),
            frontend_url: get("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:5173".into())
                .trim_end_matches('/')
                .to_string(),
            settings_path,
            session_secret,
            queue_capacity: get("QUEUE_CAPACITY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(64),
            metrics_key: get("METRICS_KEY"),
        })
    }

    /// Browser landing page after the OAuth callback.
    pub fn settings_redirect(&self, success: bool) -> String {
        let status = if success { "success" } else { "error" };
        format!("{}{}?status={status}", self.frontend_url, self.settings_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn session_secret_is_required() {
        assert!(matches!(
            config(&[]),
            Err(ConfigError::Missing("SESSION_SECRET"))
        ));
        assert!(config(&[("SESSION_SECRET", "   ")]).is_err());
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("SESSION_SECRET", "s")]).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.body_limit, 16 * 1024 * 1024);
        assert_eq!(cfg.settings_path, "/settings/marketplace");
        assert_eq!(cfg.queue_capacity, 64);
        assert!(cfg.metrics_key.is_none());
    }

    #[test]
    fn redirect_targets_settings_page() {
        let cfg = config(&[
            ("SESSION_SECRET", "s"),
            ("FRONTEND_URL", "https://shop.example/"),
        ])
        .unwrap();
        assert_eq!(
            cfg.settings_redirect(true),
            "https://shop.example/settings/marketplace?status=success"
        );
        assert_eq!(
            cfg.settings_redirect(false),
            "https://shop.example/settings/marketplace?status=error"
        );
    }

    #[test]
    fn bad_port_is_reported() {
        assert!(matches!(
            config(&[("SESSION_SECRET", "s"), ("PORT", "eighty")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
    }
}
