//! Routing: decide which backend instance should serve a given graph id and
//! operation, and hand back a pooled [`BackendClient`] for it.
//!
//! Grounded on `graph_api/client/factory.py`'s `GraphClientFactory`. The
//! source layers three caches over Redis (shared-master URL, ALB health,
//! per-graph instance location); this crate has no Redis dependency (see
//! DESIGN.md), so the same caches are kept in-process with the same TTLs,
//! which is sufficient since a `ClientFactory` is meant to be constructed
//! once per process and shared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::allocation::registry::{DatabaseLocation, GraphRegistry, InstanceStatus, NodeType};
use crate::allocation::AllocationManager;
use crate::backend::{BackendClient, CircuitBreaker, ClientConfig};
use crate::config::Config;
use crate::errors::Error;
use crate::identity::{self, GraphId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    UserGraph,
    SharedMaster,
    SharedReplicaAlb,
}

pub struct RoutedClient {
    pub client: Arc<BackendClient>,
    pub target: RouteTarget,
    pub database_name: String,
}

#[derive(Default, Clone, Copy)]
struct PoolStats {
    requests: u64,
    failures: u64,
}

pub struct ClientFactory {
    config: Config,
    registry: Arc<dyn GraphRegistry>,
    allocation: Arc<AllocationManager>,
    pool: DashMap<String, Arc<BackendClient>>,
    pool_stats: DashMap<String, PoolStats>,
    location_cache: DashMap<String, (DatabaseLocation, Instant)>,
    shared_master_cache: RwLock<Option<(String, Instant)>>,
    alb_health_cache: RwLock<Option<(bool, Instant)>>,
    master_circuit_breaker: CircuitBreaker,
    alb_circuit_breaker: CircuitBreaker,
}

impl ClientFactory {
    pub fn new(
        config: Config,
        registry: Arc<dyn GraphRegistry>,
        allocation: Arc<AllocationManager>,
    ) -> Self {
        let master_circuit_breaker =
            CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout);
        let alb_circuit_breaker =
            CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout);
        ClientFactory {
            config,
            registry,
            allocation,
            pool: DashMap::new(),
            pool_stats: DashMap::new(),
            location_cache: DashMap::new(),
            shared_master_cache: RwLock::new(None),
            alb_health_cache: RwLock::new(None),
            master_circuit_breaker,
            alb_circuit_breaker,
        }
    }

    fn client_for(&self, base_url: &str) -> Result<Arc<BackendClient>, Error> {
        if let Some(existing) = self.pool.get(base_url) {
            return Ok(existing.clone());
        }

        let mut client_config = ClientConfig::new(base_url);
        if let Some(api_key) = &self.config.graph_api_key {
            client_config = client_config.with_api_key(api_key.clone());
        }
        client_config.timeout = self.config.read_timeout;
        client_config.circuit_breaker_threshold = self.config.circuit_breaker_threshold;
        client_config.circuit_breaker_timeout = self.config.circuit_breaker_timeout;

        let client = Arc::new(BackendClient::new(client_config)?);
        self.pool.insert(base_url.to_string(), client.clone());
        self.pool_stats.insert(base_url.to_string(), PoolStats::default());
        Ok(client)
    }

    fn record_pool_request(&self, base_url: &str, failed: bool) {
        let mut stats = self.pool_stats.entry(base_url.to_string()).or_default();
        stats.requests += 1;
        if failed {
            stats.failures += 1;
        }
    }

    /// Per-base-url request/failure counters, for an operator dashboard.
    pub fn pool_statistics(&self) -> Vec<(String, u64, u64)> {
        self.pool_stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().requests, entry.value().failures))
            .collect()
    }

    pub async fn create_client(&self, graph_id: &str, operation: Operation) -> Result<RoutedClient, Error> {
        tracing::info!(graph_id, ?operation, "routing graph client");
        if identity::parse(graph_id).is_shared() {
            self.create_shared_repository_client(graph_id, operation).await
        } else {
            self.create_user_graph_client(graph_id).await
        }
    }

    async fn create_shared_repository_client(
        &self,
        graph_id: &str,
        operation: Operation,
    ) -> Result<RoutedClient, Error> {
        if self.config.environment.is_development() {
            let client = self.client_for(&self.config.graph_api_url)?;
            tracing::info!(graph_id, url = %self.config.graph_api_url, "dev environment: routing shared repository locally");
            return Ok(RoutedClient {
                client,
                target: RouteTarget::SharedMaster,
                database_name: graph_id.to_string(),
            });
        }

        let (target, base_url) = if operation == Operation::Write {
            (RouteTarget::SharedMaster, self.shared_master_url().await?)
        } else {
            self.determine_read_target(graph_id).await?
        };

        let client = self.client_for(&base_url)?;
        Ok(RoutedClient { client, target, database_name: graph_id.to_string() })
    }

    async fn determine_read_target(&self, graph_id: &str) -> Result<(RouteTarget, String), Error> {
        if self.config.shared_replica_alb_enabled {
            if let Some(alb_url) = self.config.replica_alb_url.clone() {
                let healthy = if self.config.features.health_checks_enabled {
                    self.check_alb_health(&alb_url).await
                } else {
                    true
                };

                if healthy {
                    tracing::info!(graph_id, "routing READ to replica ALB");
                    return Ok((RouteTarget::SharedReplicaAlb, alb_url));
                }

                tracing::warn!(graph_id, "replica ALB unhealthy");
                if self.config.allow_shared_master_reads {
                    tracing::warn!(graph_id, "falling back to shared master for READ");
                    return Ok((RouteTarget::SharedMaster, self.shared_master_url().await?));
                }
                return Err(Error::Routing(format!(
                    "replica ALB unavailable and master reads disallowed for {graph_id}"
                )));
            }
        }

        if self.config.allow_shared_master_reads {
            return Ok((RouteTarget::SharedMaster, self.shared_master_url().await?));
        }
        Err(Error::Routing(format!("no read target configured for {graph_id}")))
    }

    /// Discover the shared master's URL from the instance registry, cached
    /// for `instance_cache_ttl` (5 minutes by default). Falls back to
    /// `graph_api_url` in dev, or if the circuit breaker has tripped.
    async fn shared_master_url(&self) -> Result<String, Error> {
        if self.config.features.circuit_breakers_enabled && !self.master_circuit_breaker.allow_request() {
            tracing::warn!("shared master circuit breaker open, using fallback");
            if !self.config.graph_api_url.is_empty() {
                return Ok(self.config.graph_api_url.clone());
            }
            return Err(Error::Routing("shared master unavailable (circuit breaker open)".to_string()));
        }

        let cached = self.shared_master_cache.read().clone();
        if let Some((url, cached_at)) = cached {
            if cached_at.elapsed() < self.config.instance_cache_ttl {
                return Ok(url);
            }
        }

        let instances = self.registry.list_instances().await?;

        if let Some(instance) = instances
            .iter()
            .find(|i| i.node_type == NodeType::SharedMaster && i.status == InstanceStatus::Healthy)
        {
            let url = format!("http://{}:8001", instance.private_ip);
            tracing::info!(instance_id = %instance.instance_id, url, "discovered shared master");
            *self.shared_master_cache.write() = Some((url.clone(), Instant::now()));
            if self.config.features.circuit_breakers_enabled {
                self.master_circuit_breaker.on_success();
            }
            return Ok(url);
        }

        tracing::warn!("no healthy shared master found, checking for instances mid-ingestion");
        if let Some(instance) = instances.iter().find(|i| i.node_type == NodeType::SharedMaster) {
            let url = format!("http://{}:8001", instance.private_ip);
            tracing::warn!(
                instance_id = %instance.instance_id,
                "using shared master despite unhealthy status (likely mid-ingestion)"
            );
            // Cached with a shorter remaining window than a healthy discovery,
            // matching the source's 1-minute vs. 5-minute cache split.
            let backdated = Instant::now()
                .checked_sub(self.config.instance_cache_ttl.saturating_sub(Duration::from_secs(60)))
                .unwrap_or_else(Instant::now);
            *self.shared_master_cache.write() = Some((url.clone(), backdated));
            if self.config.features.circuit_breakers_enabled {
                self.master_circuit_breaker.on_success();
            }
            return Ok(url);
        }

        if self.config.features.circuit_breakers_enabled {
            self.master_circuit_breaker.on_failure();
        }

        if self.config.environment.is_development() && !self.config.graph_api_url.is_empty() {
            return Ok(self.config.graph_api_url.clone());
        }

        Err(Error::Routing(format!(
            "cannot find shared master in {} environment; ensure it is running and registered",
            self.config.environment.as_str()
        )))
    }

    async fn check_alb_health(&self, alb_url: &str) -> bool {
        if self.config.features.circuit_breakers_enabled && !self.alb_circuit_breaker.allow_request() {
            tracing::debug!("ALB circuit breaker is open, returning unhealthy");
            return false;
        }

        let cached = *self.alb_health_cache.read();
        if let Some((healthy, checked_at)) = cached {
            if checked_at.elapsed() < self.config.alb_health_cache_ttl {
                return healthy;
            }
        }

        let Ok(client) = self.client_for(alb_url) else {
            return false;
        };
        let healthy = client.health_check().await.is_ok();
        self.record_pool_request(alb_url, !healthy);
        *self.alb_health_cache.write() = Some((healthy, Instant::now()));

        if self.config.features.circuit_breakers_enabled {
            if healthy {
                self.alb_circuit_breaker.on_success();
            } else {
                self.alb_circuit_breaker.on_failure();
            }
        }
        if !healthy {
            tracing::warn!(alb_url, "ALB health check failed");
        }
        healthy
    }

    async fn create_user_graph_client(&self, graph_id: &str) -> Result<RoutedClient, Error> {
        let lookup_id = match identity::parse(graph_id) {
            GraphId::Subgraph { parent, .. } => parent,
            _ => graph_id.to_string(),
        };

        if self.config.environment.is_development() {
            let client = self.client_for(&self.config.graph_api_url)?;
            tracing::info!(graph_id, url = %self.config.graph_api_url, "dev environment: routing user graph locally");
            return Ok(RoutedClient {
                client,
                target: RouteTarget::UserGraph,
                database_name: graph_id.to_string(),
            });
        }

        if let Some(cached) = self.location_cache.get(&lookup_id) {
            let (location, cached_at) = cached.value().clone();
            if cached_at.elapsed() < self.config.instance_cache_ttl {
                let client = self.client_for(&format!("http://{}:8001", location.private_ip))?;
                return Ok(RoutedClient {
                    client,
                    target: RouteTarget::UserGraph,
                    database_name: graph_id.to_string(),
                });
            }
        }

        let location = self
            .allocation
            .find_database_location(&lookup_id)
            .await?
            .ok_or_else(|| {
                Error::Routing(format!(
                    "database {lookup_id} not found in any instance; it may need to be created first"
                ))
            })?;
        self.location_cache.insert(lookup_id.clone(), (location.clone(), Instant::now()));

        let client = self.client_for(&format!("http://{}:8001", location.private_ip))?;
        Ok(RoutedClient { client, target: RouteTarget::UserGraph, database_name: graph_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::registry::{InMemoryRegistry, InstanceRecord};
    use crate::allocation::{AllocationManager, NoopAutoscaling, NoopProtection};

    fn dev_config() -> Config {
        Config::default().with_overrides(|c| {
            c.graph_api_url = "http://localhost:8001".to_string();
        })
    }

    fn factory(config: Config, registry: Arc<InMemoryRegistry>) -> ClientFactory {
        let allocation = Arc::new(AllocationManager::new(
            registry.clone(),
            Arc::new(NoopAutoscaling),
            Arc::new(NoopProtection),
            config.environment.as_str(),
        ));
        ClientFactory::new(config, registry, allocation)
    }

    #[tokio::test]
    async fn dev_environment_routes_shared_repo_to_local_instance() {
        let registry = Arc::new(InMemoryRegistry::new());
        let f = factory(dev_config(), registry);

        let routed = f.create_client("sec", Operation::Write).await.unwrap();
        assert_eq!(routed.target, RouteTarget::SharedMaster);
    }

    #[tokio::test]
    async fn dev_environment_routes_user_graph_to_local_instance() {
        let registry = Arc::new(InMemoryRegistry::new());
        let f = factory(dev_config(), registry);

        let routed = f.create_client("kg0123456789abcdef", Operation::Read).await.unwrap();
        assert_eq!(routed.target, RouteTarget::UserGraph);
    }

    #[tokio::test]
    async fn user_graph_without_allocation_is_a_routing_error() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut config = dev_config();
        config.environment = crate::config::Environment::Prod;
        let f = factory(config, registry);

        let err = f.create_client("kg0123456789abcdef", Operation::Read).await.unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[tokio::test]
    async fn shared_repository_write_in_prod_discovers_master_from_registry() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.seed_instance(InstanceRecord {
            instance_id: "shared-0".to_string(),
            private_ip: "10.0.1.5".to_string(),
            availability_zone: "us-east-1a".to_string(),
            status: InstanceStatus::Healthy,
            database_count: 0,
            max_databases: 1,
            cluster_tier: "shared".to_string(),
            node_type: NodeType::SharedMaster,
            stack_name: None,
            created_at: 0,
            last_allocation: None,
            last_deallocation: None,
        });

        let mut config = dev_config();
        config.environment = crate::config::Environment::Prod;
        let f = factory(config, registry);

        let routed = f.create_client("sec", Operation::Write).await.unwrap();
        assert_eq!(routed.target, RouteTarget::SharedMaster);
    }
}
