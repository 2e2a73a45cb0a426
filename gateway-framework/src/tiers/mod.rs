//! Writer tier catalog, loaded from a YAML manifest and cached in process.
//!
//! Tiers are modeled as a tagged enum rather than dispatched by string: known
//! tiers get their own variant, and anything the manifest names that this
//! binary doesn't recognize yet falls into `Tier::Other`, carrying the raw
//! string. `TierConfig` accessors apply documented defaults whenever the
//! manifest omits a field, the same way `GraphTierConfig`'s getters do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tier {
    KuzuStandard,
    KuzuLarge,
    KuzuXlarge,
    KuzuShared,
    Neo4jCommunityLarge,
    Neo4jEnterpriseXlarge,
    Other(String),
}

impl Tier {
    pub fn as_str(&self) -> &str {
        match self {
            Tier::KuzuStandard => "kuzu-standard",
            Tier::KuzuLarge => "kuzu-large",
            Tier::KuzuXlarge => "kuzu-xlarge",
            Tier::KuzuShared => "kuzu-shared",
            Tier::Neo4jCommunityLarge => "neo4j-community-large",
            Tier::Neo4jEnterpriseXlarge => "neo4j-enterprise-xlarge",
            Tier::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "kuzu-standard" => Tier::KuzuStandard,
            "kuzu-large" => Tier::KuzuLarge,
            "kuzu-xlarge" => Tier::KuzuXlarge,
            "kuzu-shared" => Tier::KuzuShared,
            "neo4j-community-large" => Tier::Neo4jCommunityLarge,
            "neo4j-enterprise-xlarge" => Tier::Neo4jEnterpriseXlarge,
            other => Tier::Other(other.to_string()),
        }
    }

    /// The baseline multi-tenant tier; the only one autoscaling applies to.
    pub fn is_standard(&self) -> bool {
        matches!(self, Tier::KuzuStandard)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(rename = "type")]
    pub instance_type: Option<String>,
    #[serde(default = "default_databases_per_instance")]
    pub databases_per_instance: u32,
    #[serde(default = "default_memory_per_db_mb")]
    pub memory_per_db_mb: u32,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u32,
}

fn default_databases_per_instance() -> u32 {
    1
}
fn default_memory_per_db_mb() -> u32 {
    2048
}
fn default_max_memory_mb() -> u32 {
    2048
}
fn default_chunk_size() -> u32 {
    1000
}
fn default_query_timeout() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub always_enabled: bool,
    #[serde(default)]
    pub enabled_default: bool,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CopyOperationLimits {
    pub max_file_size_gb: Option<f64>,
    pub timeout_seconds: Option<u32>,
    pub concurrent_operations: Option<u32>,
    pub max_files_per_operation: Option<u32>,
    pub daily_copy_operations: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupLimits {
    pub max_backup_size_gb: Option<u32>,
    pub backup_retention_days: Option<u32>,
    pub max_backups_per_day: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub tier: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub backend: Option<String>,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    pub max_subgraphs: Option<u32>,
    pub storage_limit_gb: Option<u64>,
    pub monthly_credits: Option<u64>,
    #[serde(default = "default_rate_multiplier")]
    pub api_rate_multiplier: f64,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub copy_operations: CopyOperationLimits,
    #[serde(default)]
    pub backup_limits: BackupLimits,
}

fn default_rate_multiplier() -> f64 {
    1.0
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            instance_type: None,
            databases_per_instance: default_databases_per_instance(),
            memory_per_db_mb: default_memory_per_db_mb(),
            max_memory_mb: default_max_memory_mb(),
            chunk_size: default_chunk_size(),
            query_timeout: default_query_timeout(),
        }
    }
}

impl TierConfig {
    pub fn is_enabled(&self) -> bool {
        self.deployment.always_enabled || self.deployment.enabled_default
    }

    pub fn is_multitenant(&self) -> bool {
        self.instance.databases_per_instance > 1
    }

    /// Human-readable feature list, purely derived from already-loaded
    /// config (no extra state), matching the source's display rendering.
    pub fn describe(&self) -> Vec<String> {
        let mut features = Vec::new();

        if let Some(gb) = self.storage_limit_gb {
            if gb >= 1000 {
                features.push(format!("{:.0}TB storage limit", gb as f64 / 1000.0));
            } else {
                features.push(format!("{gb}GB storage limit"));
            }
        }
        if let Some(credits) = self.monthly_credits {
            if credits > 0 {
                features.push(format!("{credits} AI credits per month"));
            }
        }
        match self.max_subgraphs {
            None => features.push("No subgraph support".to_string()),
            Some(0) => features.push("Single database only".to_string()),
            Some(n) if n >= 25 => features.push("Unlimited subgraphs".to_string()),
            Some(n) => features.push(format!("Up to {n} subgraphs")),
        }
        if self.is_multitenant() {
            features.push("Shared infrastructure".to_string());
            if self.instance.memory_per_db_mb >= 1024 {
                features.push(format!(
                    "{:.1}GB RAM per graph",
                    self.instance.memory_per_db_mb as f64 / 1024.0
                ));
            } else {
                features.push(format!("{}MB RAM per graph", self.instance.memory_per_db_mb));
            }
        } else if let Some(instance_type) = &self.instance.instance_type {
            let upper = instance_type.to_uppercase();
            if upper.contains("XLARGE") {
                features.push("Dedicated extra-large instance".to_string());
            } else if upper.contains("LARGE") {
                features.push("Dedicated large instance".to_string());
            } else if upper.contains("MEDIUM") {
                features.push("Dedicated medium instance".to_string());
            }
            if self.instance.max_memory_mb > 0 {
                features.push(format!("{:.0}GB RAM", self.instance.max_memory_mb as f64 / 1024.0));
            }
        }
        if self.api_rate_multiplier > 1.0 {
            features.push(format!("{}x API rate limits", self.api_rate_multiplier));
        }
        if let Some(days) = self.backup_limits.backup_retention_days {
            if days > 0 {
                features.push(format!("{days}-day backup retention"));
            }
        }

        features
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EnvironmentConfig {
    #[serde(default)]
    writers: Vec<TierConfig>,
}

type Manifest = HashMap<String, EnvironmentConfig>;

/// The whole manifest is small and loaded once per process, matching the
/// source's class-level cache. `clear_cache` exists purely for tests that
/// want to swap manifests between cases.
static CACHE: RwLock<Option<Manifest>> = RwLock::new(None);

pub struct TierCatalog {
    manifest_path: PathBuf,
}

impl TierCatalog {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        TierCatalog {
            manifest_path: manifest_path.into(),
        }
    }

    /// Development-path fallback: `.github/configs/graph.yml` relative to
    /// the crate, versus a container path of `/app/configs/graph.yml`, as
    /// the source resolves it.
    pub fn default_path() -> PathBuf {
        let container_path = PathBuf::from("/app/configs/graph.yml");
        if container_path.exists() {
            container_path
        } else {
            PathBuf::from(".github/configs/graph.yml")
        }
    }

    fn load(&self) -> Result<Manifest, crate::errors::Error> {
        if let Some(manifest) = CACHE.read().clone() {
            return Ok(manifest);
        }
        let manifest = Self::load_from(&self.manifest_path)?;
        *CACHE.write() = Some(manifest.clone());
        Ok(manifest)
    }

    fn load_from(path: &Path) -> Result<Manifest, crate::errors::Error> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "tier manifest not found, using empty catalog");
            return Ok(Manifest::new());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::errors::Error::Configuration(format!("reading {path:?}: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| crate::errors::Error::Configuration(format!("parsing {path:?}: {e}")))
    }

    /// Clear the process-wide manifest cache. Tests call this between cases
    /// that load different manifests.
    pub fn clear_cache() {
        *CACHE.write() = None;
    }

    pub fn get_tier_config(&self, tier: &Tier, environment: &str) -> Result<Option<TierConfig>, crate::errors::Error> {
        let manifest = self.load()?;
        Ok(manifest
            .get(environment)
            .and_then(|env| env.writers.iter().find(|w| w.tier == tier.as_str()))
            .cloned())
    }

    pub fn get_max_subgraphs(&self, tier: &Tier, environment: &str) -> Result<Option<u32>, crate::errors::Error> {
        Ok(self
            .get_tier_config(tier, environment)?
            .and_then(|c| c.max_subgraphs))
    }

    pub fn get_available_tiers(
        &self,
        environment: &str,
        include_disabled: bool,
    ) -> Result<Vec<TierConfig>, crate::errors::Error> {
        let manifest = self.load()?;
        let writers = manifest
            .get(environment)
            .map(|env| env.writers.clone())
            .unwrap_or_default();
        Ok(writers
            .into_iter()
            .filter(|w| include_disabled || w.is_enabled())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("graph.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
staging:
  writers:
    - tier: kuzu-standard
      name: Standard
      deployment:
        always_enabled: true
      max_subgraphs: 5
      storage_limit_gb: 10
      instance:
        databases_per_instance: 20
        memory_per_db_mb: 512
    - tier: kuzu-xlarge
      name: Enterprise
      deployment:
        optional: true
        enabled_default: false
      max_subgraphs: 0
"#
        )
        .unwrap();
        path
    }

    // The manifest cache is a process-wide static, same as the source's
    // class-level cache; serialize the tests that touch it so they don't
    // race each other under cargo's parallel test runner.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn loads_tier_and_applies_defaults() {
        let _guard = TEST_LOCK.lock().unwrap();
        TierCatalog::clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path());
        let catalog = TierCatalog::new(path);

        let cfg = catalog
            .get_tier_config(&Tier::KuzuStandard, "staging")
            .unwrap()
            .expect("tier present");
        assert_eq!(cfg.max_subgraphs, Some(5));
        assert_eq!(cfg.instance.query_timeout, 30); // default, absent from manifest
        TierCatalog::clear_cache();
    }

    #[test]
    fn get_available_tiers_filters_disabled() {
        let _guard = TEST_LOCK.lock().unwrap();
        TierCatalog::clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path());
        let catalog = TierCatalog::new(path);

        let tiers = catalog.get_available_tiers("staging", false).unwrap();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].tier, "kuzu-standard");

        let all = catalog.get_available_tiers("staging", true).unwrap();
        assert_eq!(all.len(), 2);
        TierCatalog::clear_cache();
    }
}
