mod error;
mod handlers;
mod opt;
mod state;
mod tracing_init;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser as _;
use gateway_framework::allocation::registry::InMemoryRegistry;
use gateway_framework::allocation::{AllocationManager, NoopAutoscaling, NoopProtection};
use gateway_framework::credit::{CreditRouter, NoopCreditPool};
use gateway_framework::permission::{AllowAllAuthority, PermissionResolver};
use gateway_framework::subgraph::NoopMetadataStore;
use gateway_framework::{ClientFactory, Config, Metrics, SubgraphService};

use crate::opt::Opt;
use crate::state::AppState;
use crate::tracing_init::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    init_tracing(opt.log_json);
    tracing::info!("graph gateway starting");

    let config = Config::from_env()?;
    tracing::debug!(?config.environment, graph_api_url = %config.graph_api_url, "loaded configuration");

    // The registry is an external collaborator in production (DynamoDB or
    // similar, per SPEC_FULL.md §6); this binary wires the in-memory test
    // double until a production-grade implementation lands.
    let registry = Arc::new(InMemoryRegistry::new());
    let metrics = Arc::new(Metrics::new());

    let allocation = Arc::new(
        AllocationManager::new(
            registry.clone(),
            Arc::new(NoopAutoscaling),
            Arc::new(NoopProtection),
            config.environment.as_str(),
        )
        .with_metrics(metrics.clone()),
    );

    let factory = Arc::new(ClientFactory::new(config.clone(), registry.clone(), allocation.clone()));

    let tier_catalog = Arc::new(gateway_framework::TierCatalog::new(opt.tier_manifest.clone()));

    let subgraphs = Arc::new(SubgraphService::new(
        registry.clone(),
        allocation.clone(),
        factory.clone(),
        tier_catalog,
        Arc::new(NoopMetadataStore),
        config.environment.as_str(),
        config.features.subgraph_creation_enabled,
    ));

    let credit = Arc::new(CreditRouter::new(Arc::new(NoopCreditPool)));
    let permission = Arc::new(PermissionResolver::new(Arc::new(AllowAllAuthority)));

    let state = AppState {
        subgraphs,
        credit,
        permission,
        allocation,
        factory,
        metrics: metrics.clone(),
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route(
            "/graphs/:parent_graph_id/subgraphs",
            post(handlers::create_subgraph).get(handlers::list_subgraphs),
        )
        .route(
            "/subgraphs/:subgraph_id",
            get(handlers::subgraph_info).delete(handlers::delete_subgraph),
        )
        .route("/graphs/:graph_id/permissions/check", post(handlers::check_permission))
        .route("/graphs/:graph_id/credit/consume", post(handlers::consume_credit))
        .with_state(state);

    // Hosted on its own port, unreachable from the public API surface.
    let metrics_app = Router::new().route("/metrics", get(handlers::metrics)).with_state(metrics);

    let api_listener = tokio::net::TcpListener::bind(("0.0.0.0", opt.port)).await?;
    let metrics_listener = tokio::net::TcpListener::bind(("0.0.0.0", opt.metrics_port)).await?;

    tracing::info!(port = opt.port, metrics_port = opt.metrics_port, "listening");

    let api_server = axum::serve(api_listener, app);
    let metrics_server = axum::serve(metrics_listener, metrics_app);

    tokio::select! {
        result = api_server => result.map_err(anyhow::Error::from),
        result = metrics_server => result.map_err(anyhow::Error::from),
    }
}
