//! Crate-wide configuration, loaded once from the environment at process
//! start. Mirrors the source's `env.py`/`from_env` pattern: defaults baked
//! in, environment variables override by exact name, malformed values are a
//! startup-time `Configuration` error rather than a silent fallback.

use std::time::Duration;

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
    Test,
}

impl Environment {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "staging" => Environment::Staging,
            "prod" | "production" => Environment::Prod,
            "test" => Environment::Test,
            _ => Environment::Dev,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Dev | Environment::Test)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
            Environment::Test => "test",
        }
    }
}

/// Feature flags. All default on, matching the source; each gates one
/// cross-cutting behavior rather than a whole subsystem.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    pub retry_logic_enabled: bool,
    pub health_checks_enabled: bool,
    pub circuit_breakers_enabled: bool,
    pub redis_cache_enabled: bool,
    pub subgraph_creation_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            retry_logic_enabled: true,
            health_checks_enabled: true,
            circuit_breakers_enabled: true,
            redis_cache_enabled: true,
            subgraph_creation_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub graph_api_url: String,
    pub graph_api_key: Option<String>,
    pub replica_alb_url: Option<String>,
    pub shared_replica_alb_enabled: bool,
    pub allow_shared_master_reads: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub instance_cache_ttl: Duration,
    pub alb_health_cache_ttl: Duration,
    pub graph_registry_table: String,
    pub instance_registry_table: String,
    pub features: FeatureFlags,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: Environment::Dev,
            graph_api_url: "http://localhost:8001".to_string(),
            graph_api_key: None,
            replica_alb_url: None,
            shared_replica_alb_enabled: false,
            allow_shared_master_reads: true,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            instance_cache_ttl: Duration::from_secs(300),
            alb_health_cache_ttl: Duration::from_secs(30),
            graph_registry_table: "graph-registry".to_string(),
            instance_registry_table: "instance-registry".to_string(),
            features: FeatureFlags::default(),
        }
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, Error> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(Error::Configuration(format!(
                "{name}: expected a boolean, got {other:?}"
            ))),
        },
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, Error> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::Configuration(format!("{name}: {e}"))),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, Error> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse()
            .map_err(|e| Error::Configuration(format!("{name}: {e}"))),
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// documented defaults for anything unset. A present-but-malformed
    /// value is a startup failure, never a silent fallback.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("ENVIRONMENT") {
            config.environment = Environment::parse(&v);
        }
        if let Ok(v) = std::env::var("GRAPH_API_URL") {
            config.graph_api_url = v;
        }
        config.graph_api_key = std::env::var("GRAPH_API_KEY").ok();
        config.replica_alb_url = std::env::var("GRAPH_REPLICA_ALB_URL").ok();

        config.shared_replica_alb_enabled =
            env_bool("SHARED_REPLICA_ALB_ENABLED", config.shared_replica_alb_enabled)?;
        config.allow_shared_master_reads =
            env_bool("ALLOW_SHARED_MASTER_READS", config.allow_shared_master_reads)?;

        config.connect_timeout = env_secs("GRAPH_CONNECT_TIMEOUT", config.connect_timeout)?;
        config.read_timeout = env_secs("GRAPH_READ_TIMEOUT", config.read_timeout)?;
        config.circuit_breaker_threshold =
            env_u32("GRAPH_CIRCUIT_BREAKER_THRESHOLD", config.circuit_breaker_threshold)?;
        config.circuit_breaker_timeout =
            env_secs("GRAPH_CIRCUIT_BREAKER_TIMEOUT", config.circuit_breaker_timeout)?;
        config.instance_cache_ttl = env_secs("GRAPH_INSTANCE_CACHE_TTL", config.instance_cache_ttl)?;
        config.alb_health_cache_ttl =
            env_secs("GRAPH_ALB_HEALTH_CACHE_TTL", config.alb_health_cache_ttl)?;

        if let Ok(v) = std::env::var("GRAPH_REGISTRY_TABLE") {
            config.graph_registry_table = v;
        }
        if let Ok(v) = std::env::var("INSTANCE_REGISTRY_TABLE") {
            config.instance_registry_table = v;
        }

        config.features.retry_logic_enabled =
            env_bool("GRAPH_RETRY_LOGIC_ENABLED", config.features.retry_logic_enabled)?;
        config.features.health_checks_enabled =
            env_bool("GRAPH_HEALTH_CHECKS_ENABLED", config.features.health_checks_enabled)?;
        config.features.circuit_breakers_enabled = env_bool(
            "GRAPH_CIRCUIT_BREAKERS_ENABLED",
            config.features.circuit_breakers_enabled,
        )?;
        config.features.redis_cache_enabled =
            env_bool("GRAPH_REDIS_CACHE_ENABLED", config.features.redis_cache_enabled)?;
        config.features.subgraph_creation_enabled = env_bool(
            "SUBGRAPH_CREATION_ENABLED",
            config.features.subgraph_creation_enabled,
        )?;

        if config.graph_api_key.is_none() && !config.environment.is_development() {
            tracing::warn!("starting without GRAPH_API_KEY outside dev/test");
        }

        Ok(config)
    }

    /// Programmatic overrides layered on top of an already-loaded config,
    /// for tests that want one or two fields different from the process
    /// environment without re-reading it.
    pub fn with_overrides(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_permissive() {
        let config = Config::default();
        assert_eq!(config.environment, Environment::Dev);
        assert!(config.allow_shared_master_reads);
        assert!(config.features.subgraph_creation_enabled);
    }

    #[test]
    fn environment_parses_known_aliases() {
        assert_eq!(Environment::parse("PROD"), Environment::Prod);
        assert_eq!(Environment::parse("production"), Environment::Prod);
        assert_eq!(Environment::parse("unknown"), Environment::Dev);
    }
}
