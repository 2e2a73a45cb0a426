//! HTTP surface for the control plane: thin axum handlers that validate
//! request shape, delegate to `gateway-framework` services, and translate
//! results back to JSON. All policy (tier limits, permission inheritance,
//! credit accounting) lives in the framework crate; nothing here re-derives
//! it.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use gateway_framework::subgraph::CreateOptions;
use gateway_framework::tiers::Tier;
use gateway_framework::Metrics;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let pools = state.factory.pool_statistics();
    Json(json!({ "status": "ready", "pools": pools.len() }))
}

pub async fn metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(%err, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics".to_string());
    }
    (axum::http::StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

#[derive(Debug, Deserialize)]
pub struct CreateSubgraphRequest {
    pub name: String,
    pub tier: String,
    #[serde(default)]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub repository_name: Option<String>,
    #[serde(default)]
    pub base_schema: Option<String>,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub custom_schema_ddl: Option<String>,
    #[serde(default)]
    pub fork_tables: Option<Vec<String>>,
    #[serde(default)]
    pub fork_ignore_errors: bool,
}

pub async fn create_subgraph(
    State(state): State<AppState>,
    Path(parent_graph_id): Path<String>,
    Json(request): Json<CreateSubgraphRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tier = Tier::parse(&request.tier);
    let options = CreateOptions {
        schema_type: request.schema_type,
        repository_name: request.repository_name,
        schema: gateway_framework::subgraph::SchemaSpec {
            base_schema: request.base_schema,
            extensions: request.extensions,
            custom_ddl: request.custom_schema_ddl,
        },
        fork_tables: request.fork_tables,
        fork_ignore_errors: request.fork_ignore_errors,
    };

    let info = state.subgraphs.create(&parent_graph_id, &request.name, &tier, options).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct DeleteSubgraphQuery {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub create_backup: bool,
}

pub async fn delete_subgraph(
    State(state): State<AppState>,
    Path(subgraph_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeleteSubgraphQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.subgraphs.delete(&subgraph_id, query.force, query.create_backup).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

pub async fn list_subgraphs(
    State(state): State<AppState>,
    Path(parent_graph_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let subgraphs = state.subgraphs.list(&parent_graph_id).await?;
    Ok(Json(json!({ "subgraphs": subgraphs })))
}

pub async fn subgraph_info(
    State(state): State<AppState>,
    Path(subgraph_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.subgraphs.info(&subgraph_id).await? {
        Some(details) => Ok(Json(json!(details))),
        None => Err(ApiError(gateway_framework::Error::client(
            format!("subgraph {subgraph_id} not found"),
            Some(404),
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PermissionCheckRequest {
    pub user_id: String,
    pub role: String,
}

pub async fn check_permission(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
    Json(request): Json<PermissionCheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let granted = state.permission.check(&request.user_id, &graph_id, &request.role).await?;
    Ok(Json(json!({ "granted": granted })))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeCreditRequest {
    pub op_type: String,
    pub cost: f64,
}

pub async fn consume_credit(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
    Json(request): Json<ConsumeCreditRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.credit.consume(&graph_id, &request.op_type, request.cost).await?;
    Ok(Json(json!({
        "success": outcome.success,
        "error": outcome.error,
        "remaining_balance": outcome.remaining_balance,
    })))
}
