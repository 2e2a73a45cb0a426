use std::sync::Arc;

use gateway_framework::{AllocationManager, ClientFactory, CreditRouter, Metrics, PermissionResolver, SubgraphService};

/// Everything a request handler needs, built once at startup and shared
/// across the axum router via `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub subgraphs: Arc<SubgraphService>,
    pub credit: Arc<CreditRouter>,
    pub permission: Arc<PermissionResolver>,
    pub allocation: Arc<AllocationManager>,
    pub factory: Arc<ClientFactory>,
    pub metrics: Arc<Metrics>,
}
