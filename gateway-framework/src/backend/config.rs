//! Backend client configuration, loadable from the environment or built
//! programmatically.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    pub max_connections: usize,
    pub max_keepalive_connections: usize,
    pub keepalive_expiry: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub verify_ssl: bool,
    pub headers: HashMap<String, String>,
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            max_connections: 100,
            max_keepalive_connections: 20,
            keepalive_expiry: Duration::from_secs(5),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            verify_ssl: true,
            headers: HashMap::new(),
            api_key: None,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Load overrides from `GRAPH_CLIENT_*` environment variables over an
    /// otherwise-default config, mirroring the source's `from_env(prefix)`.
    pub fn from_env(prefix: &str) -> Self {
        let mut config = ClientConfig::default();
        if let Ok(v) = std::env::var(format!("{prefix}BASE_URL")) {
            config.base_url = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}TIMEOUT")) {
            if let Ok(secs) = v.parse() {
                config.timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}MAX_RETRIES")) {
            if let Ok(n) = v.parse() {
                config.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}RETRY_DELAY")) {
            if let Ok(secs) = v.parse::<f64>() {
                config.retry_delay = Duration::from_secs_f64(secs);
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}RETRY_BACKOFF")) {
            if let Ok(f) = v.parse() {
                config.retry_backoff = f;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}MAX_CONNECTIONS")) {
            if let Ok(n) = v.parse() {
                config.max_connections = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}MAX_KEEPALIVE_CONNECTIONS")) {
            if let Ok(n) = v.parse() {
                config.max_keepalive_connections = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}KEEPALIVE_EXPIRY")) {
            if let Ok(secs) = v.parse::<f64>() {
                config.keepalive_expiry = Duration::from_secs_f64(secs);
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}CIRCUIT_BREAKER_THRESHOLD")) {
            if let Ok(n) = v.parse() {
                config.circuit_breaker_threshold = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}CIRCUIT_BREAKER_TIMEOUT")) {
            if let Ok(secs) = v.parse() {
                config.circuit_breaker_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var(format!("{prefix}VERIFY_SSL")) {
            config.verify_ssl = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, 2.0);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_timeout, Duration::from_secs(60));
    }
}
