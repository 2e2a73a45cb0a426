//! The graph-database control plane: given a logical graph id, route any
//! read/write/administrative operation to the backend process that owns
//! that database's files, while enforcing tenant isolation, capacity
//! limits, credit accounting, and failure containment.
//!
//! Mirrors the source's layering: [`identity`] and [`tiers`] are pure
//! lookups, [`allocation`] and [`factory`] own placement and routing,
//! [`backend`] is the transport to a single instance, and [`subgraph`],
//! [`credit`], [`permission`] are the cross-cutting rules layered on top of
//! the identifier grammar.

pub mod allocation;
pub mod backend;
pub mod config;
pub mod credit;
pub mod errors;
pub mod factory;
pub mod identity;
pub mod metrics;
pub mod permission;
pub mod subgraph;
pub mod tiers;

pub use allocation::{AllocationManager, AutoscalingSignal, InstanceProtection};
pub use backend::{BackendClient, CircuitBreaker, CircuitState, ClientConfig};
pub use config::Config;
pub use credit::CreditRouter;
pub use errors::Error;
pub use factory::{ClientFactory, Operation, RoutedClient};
pub use identity::{GraphCategory, GraphId, GraphIdentity};
pub use metrics::Metrics;
pub use permission::PermissionResolver;
pub use subgraph::{CreateOptions, NoopMetadataStore, SchemaSpec, SubgraphDetails, SubgraphInfo, SubgraphMetadataStore, SubgraphService};
pub use tiers::{Tier, TierCatalog};
