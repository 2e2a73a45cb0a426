//! Subgraph lifecycle: create/delete/list/info/fork.
//!
//! Grounded on `operations/graph/subgraph_service.py`'s `SubgraphService`.
//! The source looks up the parent's tier via a Postgres `Graph` model this
//! crate has no equivalent of; here the caller supplies the parent's tier
//! directly (see DESIGN.md). Subgraphs are never recorded in
//! [`GraphRegistry`] (only their parent is); the existing-subgraph count
//! comes from [`SubgraphService::list`], which lists the parent instance's
//! databases over the backend client and keeps the `<parent>_`-prefixed
//! ones, matching `subgraph_service.py`'s `list_subgraph_databases`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::allocation::registry::GraphRegistry;
use crate::allocation::AllocationManager;
use crate::errors::Error;
use crate::factory::{ClientFactory, Operation};
use crate::identity::{self, GraphId};
use crate::tiers::{Tier, TierCatalog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgraphCreationStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubgraphInfo {
    pub graph_id: String,
    pub parent_graph_id: String,
    pub status: SubgraphCreationStatus,
    pub instance_id: Option<String>,
    pub private_ip: Option<String>,
    /// Position of this subgraph among its parent's subgraphs, 1-based.
    /// `None` when the database already existed and no metadata record
    /// could be consulted to recover it.
    pub subgraph_index: Option<u32>,
    /// Result of a fork requested during creation, if any.
    pub fork_result: Option<Value>,
}

/// Schema installation path for a new subgraph database: either a named
/// base schema plus inherited extensions, or a raw DDL payload. Mutually
/// exclusive, matching [`crate::backend::BackendClient::install_schema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaSpec {
    pub base_schema: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub custom_ddl: Option<String>,
}

/// Options governing subgraph creation beyond parent/name/tier.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub schema_type: Option<String>,
    pub repository_name: Option<String>,
    pub schema: SchemaSpec,
    /// When present, `create` forks these tables (or all, if empty) from
    /// the parent's staging store into the new subgraph right after the
    /// database and schema are in place.
    pub fork_tables: Option<Vec<String>>,
    pub fork_ignore_errors: bool,
}

/// Parallel metadata record tracking (parent, index, name) for a subgraph.
/// The source keeps this in its own Postgres table; here it is a narrow
/// external collaborator so the service can roll it back on partial
/// creation failure without owning a storage engine of its own.
#[async_trait]
pub trait SubgraphMetadataStore: Send + Sync {
    async fn record(
        &self,
        subgraph_id: &str,
        parent_graph_id: &str,
        subgraph_index: u32,
        name: &str,
    ) -> Result<(), Error>;

    async fn remove(&self, subgraph_id: &str) -> Result<(), Error>;
}

/// No-op store for deployments that haven't wired a real metadata table
/// yet: records are accepted and discarded, removal always succeeds.
pub struct NoopMetadataStore;

#[async_trait]
impl SubgraphMetadataStore for NoopMetadataStore {
    async fn record(&self, _subgraph_id: &str, _parent_graph_id: &str, _subgraph_index: u32, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn remove(&self, _subgraph_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubgraphDetails {
    pub graph_id: String,
    pub parent_graph_id: String,
    pub instance_id: String,
    pub private_ip: String,
    /// `None` when the count query itself failed; the record is still
    /// returned rather than treated as a hard error.
    pub node_count: Option<u64>,
    pub edge_count: Option<u64>,
}

/// Pulls the first numeric column out of a query result row, tolerating
/// either `[N]` or `{"count": N}` row shapes depending on worker version.
fn first_count(row: &Value) -> Option<u64> {
    if let Some(array) = row.as_array() {
        return array.first().and_then(Value::as_u64);
    }
    row.as_object().and_then(|obj| obj.values().next()).and_then(Value::as_u64)
}

pub struct SubgraphService {
    registry: Arc<dyn GraphRegistry>,
    allocation: Arc<AllocationManager>,
    factory: Arc<ClientFactory>,
    tier_catalog: Arc<TierCatalog>,
    metadata: Arc<dyn SubgraphMetadataStore>,
    environment: String,
    creation_enabled: bool,
}

impl SubgraphService {
    pub fn new(
        registry: Arc<dyn GraphRegistry>,
        allocation: Arc<AllocationManager>,
        factory: Arc<ClientFactory>,
        tier_catalog: Arc<TierCatalog>,
        metadata: Arc<dyn SubgraphMetadataStore>,
        environment: impl Into<String>,
        creation_enabled: bool,
    ) -> Self {
        SubgraphService {
            registry,
            allocation,
            factory,
            tier_catalog,
            metadata,
            environment: environment.into(),
            creation_enabled,
        }
    }

    /// Create a subgraph database on the parent's instance. `parent_tier`
    /// governs the subgraph-count limit (`None` max means unlimited, `Some(0)`
    /// means the tier doesn't support subgraphs at all).
    pub async fn create(
        &self,
        parent_graph_id: &str,
        subgraph_name: &str,
        parent_tier: &Tier,
        options: CreateOptions,
    ) -> Result<SubgraphInfo, Error> {
        if !self.creation_enabled {
            return Err(Error::client("subgraph creation is disabled", None));
        }
        if !identity::validate_parent_graph_id(parent_graph_id) {
            return Err(Error::client(format!("invalid parent graph id: {parent_graph_id}"), None));
        }
        if identity::is_shared(parent_graph_id) {
            return Err(Error::Subgraph(format!(
                "shared repository '{parent_graph_id}' cannot have subgraphs; subgraphs are only available for user-owned graphs"
            )));
        }
        if !identity::validate_subgraph_name(subgraph_name) {
            return Err(Error::client(
                format!("invalid subgraph name: {subgraph_name} (must be alphanumeric, 1-20 characters)"),
                None,
            ));
        }

        let max_subgraphs = self.tier_catalog.get_max_subgraphs(parent_tier, &self.environment)?;
        let mut existing_count = None;
        if let Some(max) = max_subgraphs {
            if max == 0 {
                return Err(Error::Subgraph(format!(
                    "tier '{}' does not support subgraphs",
                    parent_tier.as_str()
                )));
            }
            let existing = self.list(parent_graph_id).await?;
            if existing.len() as u32 >= max {
                return Err(Error::Subgraph(format!(
                    "maximum subgraph limit ({max}) reached for tier '{}': currently have {}",
                    parent_tier.as_str(),
                    existing.len()
                )));
            }
            existing_count = Some(existing.len() as u32);
        }

        let subgraph_id = identity::construct_subgraph(parent_graph_id, subgraph_name)?;

        if let Some(existing) = self.registry.get_database(&subgraph_id).await? {
            return Ok(SubgraphInfo {
                graph_id: subgraph_id,
                parent_graph_id: parent_graph_id.to_string(),
                status: SubgraphCreationStatus::AlreadyExists,
                instance_id: Some(existing.instance_id),
                private_ip: Some(existing.private_ip),
                subgraph_index: None,
                fork_result: None,
            });
        }

        let location = self
            .allocation
            .find_database_location(parent_graph_id)
            .await?
            .ok_or_else(|| {
                Error::Subgraph(format!(
                    "parent graph {parent_graph_id} not found; it must exist before creating subgraphs"
                ))
            })?;

        let routed = self.factory.create_client(parent_graph_id, Operation::Write).await?;

        let schema_type = options.schema_type.as_deref().unwrap_or("knowledge_graph");
        routed
            .client
            .create_database(
                &subgraph_id,
                schema_type,
                options.repository_name.as_deref(),
                options.schema.custom_ddl.as_deref(),
                true,
            )
            .await?;

        if let Err(schema_err) = routed
            .client
            .install_schema(
                &subgraph_id,
                options.schema.base_schema.as_deref(),
                options.schema.extensions.as_deref(),
                options.schema.custom_ddl.as_deref(),
            )
            .await
        {
            if let Err(cleanup_err) = routed.client.delete_database(&subgraph_id).await {
                tracing::error!(subgraph_id, %cleanup_err, "failed to clean up subgraph database after schema installation failure");
            }
            return Err(schema_err);
        }

        // 1-based: the new subgraph takes the next slot after however many
        // already existed under the same tier-limit count.
        let subgraph_index = existing_count.map(|n| n + 1);

        if let Some(index) = subgraph_index {
            if let Err(metadata_err) = self.metadata.record(&subgraph_id, parent_graph_id, index, subgraph_name).await {
                tracing::warn!(subgraph_id, %metadata_err, "subgraph metadata persistence failed; rolling back database");
                if let Err(cleanup_err) = routed.client.delete_database(&subgraph_id).await {
                    tracing::error!(subgraph_id, %cleanup_err, "failed to clean up subgraph database after metadata failure");
                }
                return Err(metadata_err);
            }
        }

        let fork_result = if let Some(tables) = options.fork_tables {
            let tables = if tables.is_empty() { None } else { Some(tables) };
            match routed
                .client
                .fork_from_parent(parent_graph_id, &subgraph_id, tables, options.fork_ignore_errors)
                .await
            {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(subgraph_id, parent_graph_id, error = %e, "fork during subgraph creation failed");
                    Some(json!({ "status": "failed", "error": e.to_string() }))
                }
            }
        } else {
            None
        };

        tracing::info!(subgraph_id, parent_graph_id, subgraph_index, "created subgraph database");

        Ok(SubgraphInfo {
            graph_id: subgraph_id,
            parent_graph_id: parent_graph_id.to_string(),
            status: SubgraphCreationStatus::Created,
            instance_id: Some(location.instance_id),
            private_ip: Some(location.private_ip),
            subgraph_index,
            fork_result,
        })
    }

    /// Deletes a subgraph database. Refuses (unless `force`) when the
    /// database still holds data; optionally takes a best-effort backup
    /// first.
    pub async fn delete(&self, subgraph_id: &str, force: bool, create_backup: bool) -> Result<(), Error> {
        let GraphId::Subgraph { parent, .. } = identity::parse(subgraph_id) else {
            return Err(Error::client(format!("{subgraph_id} is not a subgraph id"), None));
        };

        let routed = self.factory.create_client(&parent, Operation::Write).await?;

        if !force {
            let has_data = routed
                .client
                .query(subgraph_id, "MATCH (n) RETURN count(n) LIMIT 1", None)
                .await?
                .data
                .first()
                .and_then(first_count)
                .map(|count| count > 0)
                .unwrap_or(false);

            if has_data {
                return Err(Error::Subgraph(format!(
                    "subgraph {subgraph_id} still holds data; pass force=true to delete anyway"
                )));
            }
        }

        if create_backup {
            if let Err(backup_err) = routed.client.create_backup(subgraph_id, json!({ "format": "tar" })).await {
                tracing::warn!(subgraph_id, %backup_err, "pre-delete backup failed; proceeding with delete");
            }
        }

        routed.client.delete_database(subgraph_id).await?;
        self.registry.mark_deleted_if_not_already(subgraph_id).await?;
        if let Err(metadata_err) = self.metadata.remove(subgraph_id).await {
            tracing::warn!(subgraph_id, %metadata_err, "failed to remove subgraph metadata record");
        }
        tracing::info!(subgraph_id, parent, "deleted subgraph database");
        Ok(())
    }

    /// All subgraph ids known under `parent_graph_id`: lists every database
    /// on the parent's instance and keeps the ones named `<parent>_...`.
    /// Subgraphs live only on the worker, never in the registry, so this
    /// cannot be answered from `GraphRegistry` the way a top-level graph
    /// lookup can.
    pub async fn list(&self, parent_graph_id: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{parent_graph_id}_");
        let routed = self.factory.create_client(parent_graph_id, Operation::Read).await?;
        let response = routed.client.list_databases().await?;
        let databases = response.get("databases").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(databases
            .into_iter()
            .filter_map(|entry| entry.get("graph_id").and_then(Value::as_str).map(str::to_string))
            .filter(|id| id.starts_with(&prefix))
            .collect())
    }

    /// Backend existence check combined with node/edge counts. Count
    /// failures yield `null` counts rather than failing the whole call.
    pub async fn info(&self, subgraph_id: &str) -> Result<Option<SubgraphDetails>, Error> {
        let Some(record) = self.registry.get_database(subgraph_id).await? else {
            return Ok(None);
        };

        let GraphId::Subgraph { parent, .. } = identity::parse(subgraph_id) else {
            return Err(Error::client(format!("{subgraph_id} is not a subgraph id"), None));
        };

        let routed = self.factory.create_client(&parent, Operation::Read).await?;
        let node_count = routed
            .client
            .query(subgraph_id, "MATCH (n) RETURN count(n) AS count", None)
            .await
            .ok()
            .and_then(|r| r.data.first().and_then(first_count));
        let edge_count = routed
            .client
            .query(subgraph_id, "MATCH ()-[r]->() RETURN count(r) AS count", None)
            .await
            .ok()
            .and_then(|r| r.data.first().and_then(first_count));

        Ok(Some(SubgraphDetails {
            graph_id: record.graph_id,
            parent_graph_id: parent,
            instance_id: record.instance_id,
            private_ip: record.private_ip,
            node_count,
            edge_count,
        }))
    }

    /// Copy selected tables from the parent into a freshly named subgraph.
    pub async fn fork(
        &self,
        parent_graph_id: &str,
        subgraph_name: &str,
        tables: Option<Vec<String>>,
        ignore_errors: bool,
    ) -> Result<Value, Error> {
        let subgraph_id = identity::construct_subgraph(parent_graph_id, subgraph_name)?;
        let routed = self.factory.create_client(parent_graph_id, Operation::Write).await?;
        routed
            .client
            .fork_from_parent(parent_graph_id, &subgraph_id, tables, ignore_errors)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use crate::allocation::registry::InMemoryRegistry;
    use crate::allocation::{AllocationManager, NoopAutoscaling, NoopProtection};
    use crate::config::Config;

    struct InMemoryMetadataStore {
        records: Mutex<HashMap<String, (String, u32, String)>>,
    }

    impl InMemoryMetadataStore {
        fn new() -> Self {
            InMemoryMetadataStore { records: Mutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl SubgraphMetadataStore for InMemoryMetadataStore {
        async fn record(&self, subgraph_id: &str, parent_graph_id: &str, subgraph_index: u32, name: &str) -> Result<(), Error> {
            self.records.lock().insert(
                subgraph_id.to_string(),
                (parent_graph_id.to_string(), subgraph_index, name.to_string()),
            );
            Ok(())
        }

        async fn remove(&self, subgraph_id: &str) -> Result<(), Error> {
            self.records.lock().remove(subgraph_id);
            Ok(())
        }
    }

    fn service(registry: Arc<InMemoryRegistry>, creation_enabled: bool) -> SubgraphService {
        service_with_config(registry, Config::default(), creation_enabled)
    }

    fn service_with_config(registry: Arc<InMemoryRegistry>, config: Config, creation_enabled: bool) -> SubgraphService {
        let allocation = Arc::new(AllocationManager::new(
            registry.clone(),
            Arc::new(NoopAutoscaling),
            Arc::new(NoopProtection),
            "test",
        ));
        let factory = Arc::new(ClientFactory::new(config, registry.clone(), allocation.clone()));
        let tier_catalog = Arc::new(TierCatalog::new("/nonexistent/graph.yml"));
        let metadata = Arc::new(InMemoryMetadataStore::new());
        SubgraphService::new(registry, allocation, factory, tier_catalog, metadata, "test", creation_enabled)
    }

    #[tokio::test]
    async fn create_rejects_when_disabled() {
        let registry = Arc::new(InMemoryRegistry::new());
        let svc = service(registry, false);
        let err = svc
            .create("kg0123456789abcdef", "dev", &Tier::KuzuStandard, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Client { .. }));
    }

    #[tokio::test]
    async fn create_rejects_shared_repository_parent() {
        let registry = Arc::new(InMemoryRegistry::new());
        let svc = service(registry, true);
        let err = svc
            .create("sec", "dev", &Tier::KuzuStandard, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Subgraph(_)));
    }

    #[tokio::test]
    async fn create_rejects_invalid_subgraph_name() {
        let registry = Arc::new(InMemoryRegistry::new());
        let svc = service(registry, true);
        let err = svc
            .create("kg0123456789abcdef", "not valid!", &Tier::KuzuStandard, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Client { .. }));
    }

    #[tokio::test]
    async fn delete_rejects_non_subgraph_id() {
        let registry = Arc::new(InMemoryRegistry::new());
        let svc = service(registry, true);
        let err = svc.delete("kg0123456789abcdef", true, false).await.unwrap_err();
        assert!(matches!(err, Error::Client { .. }));
    }

    #[tokio::test]
    async fn list_filters_parent_instance_databases_by_prefix() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/databases"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "databases": [
                    { "graph_id": "kg0123456789abcdef_sub1" },
                    { "graph_id": "kg0123456789abcdef_sub2" },
                    { "graph_id": "kgfedcba987654321_other" },
                ]
            })))
            .mount(&mock_server)
            .await;

        let registry = Arc::new(InMemoryRegistry::new());
        let mut config = Config::default();
        config.graph_api_url = mock_server.uri();
        let svc = service_with_config(registry, config, true);

        let mut found = svc.list("kg0123456789abcdef").await.unwrap();
        found.sort();
        assert_eq!(found, vec!["kg0123456789abcdef_sub1".to_string(), "kg0123456789abcdef_sub2".to_string()]);
    }

    #[tokio::test]
    async fn create_fails_when_parent_not_allocated() {
        // Parent passes every local validation but was never allocated, so
        // the allocation manager has no location to route to.
        let registry = Arc::new(InMemoryRegistry::new());
        let svc = service(registry, true);
        let err = svc
            .create("kg0123456789abcdef", "analytics", &Tier::KuzuStandard, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Subgraph(_)));
    }
}
