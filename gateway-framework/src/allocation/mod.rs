//! Atomic placement of user-graph databases onto worker instances.
//!
//! Grounded on `middleware/graph/allocation_manager.py`'s
//! `KuzuAllocationManager`: the DynamoDB conditional-write dance is
//! expressed here against the `GraphRegistry` trait instead, so the same
//! two-step commit (insert-if-absent, then increment-if-under-capacity,
//! with rollback on a losing race) is preserved without this crate
//! depending on DynamoDB directly.

pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

use crate::errors::Error;
use crate::identity::{self, GraphId};
use crate::metrics::Metrics;
use registry::{
    now_unix, CountUpdateOutcome, DatabaseLocation, DatabaseRecord, DatabaseStatus, GraphRegistry,
    GraphType, InsertOutcome, InstanceRecord, InstanceStatus,
};

/// Signals the tier's autoscaling group to add capacity. An external
/// collaborator (AWS Auto Scaling in the source); expressed narrowly so the
/// manager never depends on a cloud SDK directly.
#[async_trait::async_trait]
pub trait AutoscalingSignal: Send + Sync {
    async fn signal_scale_up(&self, tier: &str) -> Result<(), Error>;
}

/// Toggles scale-in protection on an instance. Best-effort by contract:
/// the manager never fails an allocation because this failed.
#[async_trait::async_trait]
pub trait InstanceProtection: Send + Sync {
    async fn set_protected(&self, instance_id: &str, protected: bool) -> Result<(), Error>;
}

/// No-op implementations for environments (dev/test) or embeddings that
/// don't wire a real autoscaling/protection backend.
pub struct NoopAutoscaling;

#[async_trait::async_trait]
impl AutoscalingSignal for NoopAutoscaling {
    async fn signal_scale_up(&self, tier: &str) -> Result<(), Error> {
        tracing::info!(tier, "autoscaling signal is a no-op in this deployment");
        Ok(())
    }
}

pub struct NoopProtection;

#[async_trait::async_trait]
impl InstanceProtection for NoopProtection {
    async fn set_protected(&self, _instance_id: &str, _protected: bool) -> Result<(), Error> {
        Ok(())
    }
}

const BASELINE_TIER: &str = "kuzu-standard";
const MAX_COMMIT_RETRIES: u32 = 3;
const SCALE_UP_RATE_LIMIT: Duration = Duration::from_secs(300);

pub struct AllocationManager {
    registry: Arc<dyn GraphRegistry>,
    autoscaling: Arc<dyn AutoscalingSignal>,
    protection: Arc<dyn InstanceProtection>,
    metrics: Option<Arc<Metrics>>,
    environment: String,
    scale_up_last_signal: DashMap<String, Instant>,
}

impl AllocationManager {
    pub fn new(
        registry: Arc<dyn GraphRegistry>,
        autoscaling: Arc<dyn AutoscalingSignal>,
        protection: Arc<dyn InstanceProtection>,
        environment: impl Into<String>,
    ) -> Self {
        AllocationManager {
            registry,
            autoscaling,
            protection,
            metrics: None,
            environment: environment.into(),
            scale_up_last_signal: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Allocate a database for `tenant_id`, optionally pinning `graph_id`
    /// (else a fresh `kg`-prefixed id is generated) and `tier` (else the
    /// baseline standard tier). Subgraph ids short-circuit to the parent's
    /// location: subgraph databases are created by the subgraph service,
    /// not allocated here.
    pub async fn allocate(
        &self,
        tenant_id: &str,
        graph_id: Option<String>,
        tier: Option<&str>,
    ) -> Result<DatabaseLocation, Error> {
        validate_tenant_id(tenant_id)?;

        let tier = tier.unwrap_or(BASELINE_TIER).to_string();

        let graph_id = match graph_id {
            Some(id) => id,
            None => generate_graph_id(),
        };

        if let GraphId::Subgraph { parent, .. } = identity::parse(&graph_id) {
            let parent_location = self.find_database_location(&parent).await?.ok_or_else(|| {
                Error::Allocation(format!("subgraph parent {parent} has no allocation"))
            })?;
            return Ok(DatabaseLocation {
                graph_id,
                ..parent_location
            });
        }

        let mut excluded = Vec::new();
        let mut attempt = 0;

        loop {
            let Some(instance) = self.select_instance(&tier, &excluded).await? else {
                return Err(self.no_capacity_error(&tier).await);
            };

            let lock = format!("allocated_by_{}", now_unix_nanos());
            let record = DatabaseRecord {
                graph_id: graph_id.clone(),
                tenant_id: tenant_id.to_string(),
                graph_type: GraphType::Entity,
                backend_type: "kuzu".to_string(),
                instance_id: instance.instance_id.clone(),
                private_ip: instance.private_ip.clone(),
                availability_zone: instance.availability_zone.clone(),
                created_at: now_unix(),
                last_accessed: now_unix(),
                status: DatabaseStatus::Active,
                allocation_lock: lock.clone(),
            };

            match self.registry.insert_database_if_absent(record).await? {
                InsertOutcome::AlreadyExists(existing) => {
                    tracing::info!(graph_id, "database already allocated (concurrent allocation)");
                    return Ok(DatabaseLocation::from(&existing));
                }
                InsertOutcome::Inserted => {}
            }

            match self.registry.increment_database_count(&instance.instance_id).await? {
                CountUpdateOutcome::Updated => {
                    self.on_committed(&instance, &tier).await;
                    return Ok(DatabaseLocation {
                        graph_id: graph_id.clone(),
                        instance_id: instance.instance_id.clone(),
                        private_ip: instance.private_ip.clone(),
                        availability_zone: instance.availability_zone.clone(),
                        status: DatabaseStatus::Active,
                        backend_type: "kuzu".to_string(),
                    });
                }
                CountUpdateOutcome::AtCapacity => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        "instance reached capacity during allocation, rolling back"
                    );
                    let _ = self.registry.delete_if_lock_matches(&graph_id, &lock).await?;
                    excluded.push(instance.instance_id.clone());
                    attempt += 1;
                    if attempt >= MAX_COMMIT_RETRIES {
                        return Err(Error::Allocation(format!(
                            "failed to allocate database after {MAX_COMMIT_RETRIES} attempts due to capacity conflicts"
                        )));
                    }
                }
            }
        }
    }

    async fn select_instance(
        &self,
        tier: &str,
        excluded: &[String],
    ) -> Result<Option<InstanceRecord>, Error> {
        let instances = self.registry.list_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|i| {
                i.status == InstanceStatus::Healthy
                    && i.cluster_tier == tier
                    && i.database_count < i.max_databases
                    && !excluded.contains(&i.instance_id)
            })
            .max_by_key(|i| i.available_capacity()))
    }

    async fn no_capacity_error(&self, tier: &str) -> Error {
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation_failure(tier, "no_capacity");
        }

        if tier != BASELINE_TIER {
            return Error::Allocation(format!(
                "dedicated tier '{tier}' requires manual provisioning; no capacity available"
            ));
        }

        if self.should_signal_scale_up(tier) {
            if let Err(e) = self.autoscaling.signal_scale_up(tier).await {
                tracing::warn!(tier, error = %e, "autoscaling signal failed");
            }
        }
        Error::Allocation(
            "no capacity available for kuzu-standard tier; scaling up, retry in 3-5 minutes"
                .to_string(),
        )
    }

    fn should_signal_scale_up(&self, tier: &str) -> bool {
        let now = Instant::now();
        let allow = match self.scale_up_last_signal.get(tier) {
            Some(last) => now.duration_since(*last) >= SCALE_UP_RATE_LIMIT,
            None => true,
        };
        if allow {
            self.scale_up_last_signal.insert(tier.to_string(), now);
        }
        allow
    }

    async fn on_committed(&self, instance: &InstanceRecord, tier: &str) {
        tracing::info!(
            graph_id_instance = %instance.instance_id,
            private_ip = %instance.private_ip,
            tier,
            "allocated database"
        );

        if instance.database_count == 0 {
            if let Err(e) = self.protection.set_protected(&instance.instance_id, true).await {
                tracing::warn!(
                    instance_id = %instance.instance_id,
                    error = %e,
                    "failed to enable scale-in protection (best-effort)"
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            if !matches!(self.environment.as_str(), "dev" | "test") {
                if let Ok(instances) = self.registry.list_instances().await {
                    let (count, max): (u32, u32) = instances
                        .iter()
                        .filter(|i| i.cluster_tier == tier)
                        .fold((0, 0), |(c, m), i| (c + i.database_count, m + i.max_databases));
                    let utilization = if max > 0 { (count as i64 * 100) / max as i64 } else { 0 };
                    metrics.record_tier_capacity(tier, count as i64, utilization);
                }
            }
        }
    }

    /// Locate the instance hosting `graph_id`. Subgraph ids resolve to
    /// their parent's location, with the original subgraph id attached to
    /// the returned value.
    pub async fn find_database_location(
        &self,
        graph_id: &str,
    ) -> Result<Option<DatabaseLocation>, Error> {
        let lookup_id = match identity::parse(graph_id) {
            GraphId::Subgraph { parent, .. } => parent,
            _ => graph_id.to_string(),
        };

        let Some(record) = self.registry.get_database(&lookup_id).await? else {
            return Ok(None);
        };
        self.registry.touch_last_accessed(&lookup_id).await;

        let mut location = DatabaseLocation::from(&record);
        location.graph_id = graph_id.to_string();
        Ok(Some(location))
    }

    /// Tombstone `graph_id` and release its slot on the hosting instance.
    pub async fn deallocate(&self, graph_id: &str) -> Result<(), Error> {
        let Some(record) = self.registry.get_database(graph_id).await? else {
            return Err(Error::Allocation(format!("database {graph_id} not found")));
        };

        let marked = self.registry.mark_deleted_if_not_already(graph_id).await?;
        if !marked {
            tracing::info!(graph_id, "deallocate called on an already-deleted database");
            return Ok(());
        }

        let decremented = match self.registry.decrement_database_count(&record.instance_id).await {
            Ok(decremented) => decremented,
            Err(err) => {
                tracing::error!(
                    graph_id,
                    instance_id = %record.instance_id,
                    error = %err,
                    "decrement_database_count failed unexpectedly; rolling back tombstone"
                );
                if let Err(restore_err) = self.registry.restore_status(graph_id, record.status).await {
                    tracing::error!(graph_id, error = %restore_err, "failed to roll back database status after decrement failure");
                }
                return Err(err);
            }
        };
        if !decremented {
            tracing::error!(
                instance_id = %record.instance_id,
                "database_count integrity violation: decrement on zero-count instance"
            );
        }

        if let Some(instance) = self.registry.get_instance(&record.instance_id).await? {
            if instance.database_count == 0 {
                if let Err(e) = self.protection.set_protected(&instance.instance_id, false).await {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "failed to remove scale-in protection (best-effort)"
                    );
                }
            }
        }

        Ok(())
    }
}

fn validate_tenant_id(tenant_id: &str) -> Result<(), Error> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= 128
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::client(
            format!("invalid tenant id: {tenant_id}"),
            None,
        ))
    }
}

fn generate_graph_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16).map(|_| HEX[rng.gen_range(0..16)] as char).collect();
    format!("kg{suffix}")
}

fn now_unix_nanos() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::registry::InMemoryRegistry;
    use super::*;

    fn healthy_instance(id: &str, count: u32, max: u32, tier: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            private_ip: format!("10.0.0.{id}", id = id.len()),
            availability_zone: "us-east-1a".to_string(),
            status: InstanceStatus::Healthy,
            database_count: count,
            max_databases: max,
            cluster_tier: tier.to_string(),
            node_type: registry::NodeType::Writer,
            stack_name: None,
            created_at: 0,
            last_allocation: None,
            last_deallocation: None,
        }
    }

    fn manager(registry: Arc<InMemoryRegistry>) -> AllocationManager {
        AllocationManager::new(registry, Arc::new(NoopAutoscaling), Arc::new(NoopProtection), "test")
    }

    #[tokio::test]
    async fn places_on_instance_with_greatest_residual_capacity() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.seed_instance(healthy_instance("a", 49, 50, BASELINE_TIER));
        registry.seed_instance(healthy_instance("b", 10, 50, BASELINE_TIER));
        let manager = manager(registry.clone());

        let location = manager
            .allocate("acme", Some("kg0000000000000001".to_string()), None)
            .await
            .unwrap();

        assert_eq!(location.instance_id, "b");
        assert_eq!(registry.instance_snapshot("b").unwrap().database_count, 11);
    }

    #[tokio::test]
    async fn no_capacity_raises_allocation_error_and_does_not_autoscale_dedicated_tier() {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = manager(registry);

        let err = manager
            .allocate("acme", Some("kg0000000000000002".to_string()), Some("kuzu-xlarge"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Allocation(_)));
        assert!(err.to_string().contains("manual provisioning"));
    }

    #[tokio::test]
    async fn deallocate_is_idempotent() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.seed_instance(healthy_instance("a", 0, 1, BASELINE_TIER));
        let manager = manager(registry.clone());

        let location = manager
            .allocate("acme", Some("kg0000000000000003".to_string()), None)
            .await
            .unwrap();
        assert_eq!(registry.instance_snapshot(&location.instance_id).unwrap().database_count, 1);

        manager.deallocate(&location.graph_id).await.unwrap();
        assert_eq!(registry.instance_snapshot(&location.instance_id).unwrap().database_count, 0);

        // Second deallocate: already tombstoned, succeeds without touching counts.
        manager.deallocate(&location.graph_id).await.unwrap();
        assert_eq!(registry.instance_snapshot(&location.instance_id).unwrap().database_count, 0);
    }

    #[tokio::test]
    async fn subgraph_allocation_routes_to_parent_location() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.seed_instance(healthy_instance("a", 0, 1, BASELINE_TIER));
        let manager = manager(registry.clone());

        let parent = manager
            .allocate("acme", Some("kg0000000000000004".to_string()), None)
            .await
            .unwrap();

        let subgraph_location = manager
            .allocate("acme", Some("kg0000000000000004_dev".to_string()), None)
            .await
            .unwrap();

        assert_eq!(subgraph_location.instance_id, parent.instance_id);
        assert_eq!(subgraph_location.graph_id, "kg0000000000000004_dev");
    }
}
