//! The registry trait and its data model: the key-value store the
//! allocation manager treats as ground truth for placement and capacity.
//!
//! The source backs this with DynamoDB (`graph_table`/`instance_table`,
//! `attribute_not_exists`/numeric conditional updates). This crate expresses
//! the same operations as a narrow trait (`GraphRegistry`) so a production
//! implementation can target any conditional-write key-value store without
//! this crate depending on its SDK; an in-memory implementation backs the
//! test suite.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    Creating,
    Active,
    Migrating,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Writer,
    SharedMaster,
    SharedReplica,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphType {
    Entity,
    Generic,
}

#[derive(Debug, Clone)]
pub struct DatabaseRecord {
    pub graph_id: String,
    pub tenant_id: String,
    pub graph_type: GraphType,
    pub backend_type: String,
    pub instance_id: String,
    pub private_ip: String,
    pub availability_zone: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub status: DatabaseStatus,
    /// Opaque marker minted by the allocator attempting the write; used to
    /// safely roll back a just-inserted record if the paired instance-count
    /// increment fails (see `AllocationManager::allocate`).
    pub allocation_lock: String,
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub private_ip: String,
    pub availability_zone: String,
    pub status: InstanceStatus,
    pub database_count: u32,
    pub max_databases: u32,
    pub cluster_tier: String,
    pub node_type: NodeType,
    pub stack_name: Option<String>,
    pub created_at: u64,
    pub last_allocation: Option<u64>,
    pub last_deallocation: Option<u64>,
}

impl InstanceRecord {
    pub fn available_capacity(&self) -> u32 {
        self.max_databases.saturating_sub(self.database_count)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.max_databases == 0 {
            0.0
        } else {
            self.database_count as f64 / self.max_databases as f64 * 100.0
        }
    }
}

/// Returned to callers: a resolved instance for a `graph_id`, carrying just
/// enough to build a `BackendClient` against it.
#[derive(Debug, Clone)]
pub struct DatabaseLocation {
    pub graph_id: String,
    pub instance_id: String,
    pub private_ip: String,
    pub availability_zone: String,
    pub status: DatabaseStatus,
    pub backend_type: String,
}

impl From<&DatabaseRecord> for DatabaseLocation {
    fn from(record: &DatabaseRecord) -> Self {
        DatabaseLocation {
            graph_id: record.graph_id.clone(),
            instance_id: record.instance_id.clone(),
            private_ip: record.private_ip.clone(),
            availability_zone: record.availability_zone.clone(),
            status: record.status,
            backend_type: record.backend_type.clone(),
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Result of the conditional database-record insert in step A of the
/// placement protocol.
pub enum InsertOutcome {
    Inserted,
    AlreadyExists(DatabaseRecord),
}

/// Result of the conditional instance-count increment in step B.
pub enum CountUpdateOutcome {
    Updated,
    AtCapacity,
}

/// The narrow collaborator interface the allocation manager and client
/// factory depend on. All mutating operations are conditional, matching the
/// source's DynamoDB `ConditionExpression`s; no implementation may perform
/// a read-then-write without the equivalent compare-and-swap guard.
#[async_trait]
pub trait GraphRegistry: Send + Sync {
    async fn get_database(&self, graph_id: &str) -> Result<Option<DatabaseRecord>, Error>;

    /// Insert iff `graph_id` is not already present (`attribute_not_exists`).
    async fn insert_database_if_absent(
        &self,
        record: DatabaseRecord,
    ) -> Result<InsertOutcome, Error>;

    /// Tombstone iff the record's current status is not already `Deleted`.
    async fn mark_deleted_if_not_already(&self, graph_id: &str) -> Result<bool, Error>;

    /// Unconditionally set a database's status. Used to roll back a
    /// tombstone when a paired conditional update (the instance
    /// `database_count` decrement) fails unexpectedly after the status
    /// change already committed.
    async fn restore_status(&self, graph_id: &str, status: DatabaseStatus) -> Result<(), Error>;

    /// Best-effort timestamp bump; never fails the caller's operation.
    async fn touch_last_accessed(&self, graph_id: &str);

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, Error>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, Error>;

    /// Increment `database_count` iff it is currently below `max_databases`.
    async fn increment_database_count(&self, instance_id: &str) -> Result<CountUpdateOutcome, Error>;

    /// Decrement `database_count` iff it is currently above zero. Returns
    /// `false` (not an error) if the count was already zero, matching the
    /// source's "integrity event, succeeds anyway" behavior.
    async fn decrement_database_count(&self, instance_id: &str) -> Result<bool, Error>;

    /// Undo a just-inserted record, conditioned on the allocation lock
    /// still matching this attempt's marker (so a concurrent allocator that
    /// already adopted the record is never clobbered).
    async fn delete_if_lock_matches(&self, graph_id: &str, lock: &str) -> Result<bool, Error>;
}

/// In-memory `GraphRegistry`, backing the test suite. Conditional
/// operations are modeled with a single process-wide lock per table rather
/// than per-row CAS, which is sufficient to exercise the allocation
/// manager's races under `tokio::test` without a real store.
pub struct InMemoryRegistry {
    databases: RwLock<HashMap<String, DatabaseRecord>>,
    instances: RwLock<HashMap<String, InstanceRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry {
            databases: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn seed_instance(&self, instance: InstanceRecord) {
        self.instances.write().insert(instance.instance_id.clone(), instance);
    }

    pub fn instance_snapshot(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.instances.read().get(instance_id).cloned()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        InMemoryRegistry::new()
    }
}

#[async_trait]
impl GraphRegistry for InMemoryRegistry {
    async fn get_database(&self, graph_id: &str) -> Result<Option<DatabaseRecord>, Error> {
        Ok(self.databases.read().get(graph_id).cloned())
    }

    async fn insert_database_if_absent(
        &self,
        record: DatabaseRecord,
    ) -> Result<InsertOutcome, Error> {
        let mut databases = self.databases.write();
        if let Some(existing) = databases.get(&record.graph_id) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        let graph_id = record.graph_id.clone();
        databases.insert(graph_id, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_deleted_if_not_already(&self, graph_id: &str) -> Result<bool, Error> {
        let mut databases = self.databases.write();
        match databases.get_mut(graph_id) {
            Some(record) if record.status != DatabaseStatus::Deleted => {
                record.status = DatabaseStatus::Deleted;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn restore_status(&self, graph_id: &str, status: DatabaseStatus) -> Result<(), Error> {
        if let Some(record) = self.databases.write().get_mut(graph_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn touch_last_accessed(&self, graph_id: &str) {
        if let Some(record) = self.databases.write().get_mut(graph_id) {
            record.last_accessed = now_unix();
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, Error> {
        Ok(self.instances.read().get(instance_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, Error> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn increment_database_count(&self, instance_id: &str) -> Result<CountUpdateOutcome, Error> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::Allocation(format!("unknown instance {instance_id}")))?;
        if instance.database_count >= instance.max_databases {
            return Ok(CountUpdateOutcome::AtCapacity);
        }
        instance.database_count += 1;
        instance.last_allocation = Some(now_unix());
        Ok(CountUpdateOutcome::Updated)
    }

    async fn decrement_database_count(&self, instance_id: &str) -> Result<bool, Error> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::Allocation(format!("unknown instance {instance_id}")))?;
        if instance.database_count == 0 {
            return Ok(false);
        }
        instance.database_count -= 1;
        instance.last_deallocation = Some(now_unix());
        Ok(true)
    }

    async fn delete_if_lock_matches(&self, graph_id: &str, lock: &str) -> Result<bool, Error> {
        let mut databases = self.databases.write();
        match databases.get(graph_id) {
            Some(record) if record.allocation_lock == lock => {
                databases.remove(graph_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, count: u32, max: u32) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            private_ip: "10.0.0.1".to_string(),
            availability_zone: "us-east-1a".to_string(),
            status: InstanceStatus::Healthy,
            database_count: count,
            max_databases: max,
            cluster_tier: "kuzu-standard".to_string(),
            node_type: NodeType::Writer,
            stack_name: None,
            created_at: 0,
            last_allocation: None,
            last_deallocation: None,
        }
    }

    #[tokio::test]
    async fn increment_respects_capacity() {
        let registry = InMemoryRegistry::new();
        registry.seed_instance(instance("i-1", 1, 1));
        let outcome = registry.increment_database_count("i-1").await.unwrap();
        assert!(matches!(outcome, CountUpdateOutcome::AtCapacity));
    }

    #[tokio::test]
    async fn decrement_floors_at_zero_without_erroring() {
        let registry = InMemoryRegistry::new();
        registry.seed_instance(instance("i-1", 0, 10));
        let decremented = registry.decrement_database_count("i-1").await.unwrap();
        assert!(!decremented);
    }

    #[tokio::test]
    async fn insert_is_idempotent_under_conflict() {
        let registry = InMemoryRegistry::new();
        let record = DatabaseRecord {
            graph_id: "kg0123456789abcdef".to_string(),
            tenant_id: "acme".to_string(),
            graph_type: GraphType::Entity,
            backend_type: "kuzu".to_string(),
            instance_id: "i-1".to_string(),
            private_ip: "10.0.0.1".to_string(),
            availability_zone: "us-east-1a".to_string(),
            created_at: 0,
            last_accessed: 0,
            status: DatabaseStatus::Active,
            allocation_lock: "lock-a".to_string(),
        };
        let first = registry.insert_database_if_absent(record.clone()).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted));
        let second = registry.insert_database_if_absent(record).await.unwrap();
        assert!(matches!(second, InsertOutcome::AlreadyExists(_)));
    }
}
