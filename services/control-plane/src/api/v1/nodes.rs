//! Node API endpoints.
//!
//! Operator-facing: node registration, drain, per-node telemetry history
//! and an on-demand agent health probe. Not owner-scoped.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kiln_id::NodeId;
use kiln_protocol::{AgentHealth, TelemetrySample};
use serde::Serialize;
use tracing::info;

use super::{domain_error, parse_id};
use crate::agent::AgentTarget;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::ControlPlaneError;
use crate::registry::{NewNode, NodeRecord};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register_node).get(list_nodes))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/drain", post(drain_node))
        .route("/{node_id}/telemetry", get(node_telemetry))
        .route("/{node_id}/agent-health", get(agent_health))
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeRecord>,
}

#[derive(Debug, Serialize)]
pub struct NodeTelemetryResponse {
    pub node_id: NodeId,
    /// Oldest first.
    pub samples: Vec<TelemetrySample>,
}

async fn register_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<NewNode>,
) -> Result<impl IntoResponse, ApiError> {
    if req.capacity.is_zero() {
        return Err(ApiError::bad_request(
            "invalid_capacity",
            "node capacity must be non-zero",
        )
        .with_request_id(ctx.request_id));
    }

    let node = state.registry().register_node(req).await;
    info!(
        node_id = %node.id,
        address = %node.address,
        request_id = %ctx.request_id,
        "Node registered"
    );
    Ok((StatusCode::CREATED, Json(node)))
}

async fn list_nodes(State(state): State<AppState>) -> Json<ListNodesResponse> {
    Json(ListNodesResponse {
        items: state.registry().list_nodes().await,
    })
}

async fn load_node(
    state: &AppState,
    ctx: &RequestContext,
    raw: &str,
) -> Result<NodeRecord, ApiError> {
    let node_id: NodeId = parse_id(raw, "invalid_node_id", ctx)?;
    state
        .registry()
        .node(&node_id)
        .await
        .ok_or_else(|| domain_error(ctx)(ControlPlaneError::node_not_found(&node_id)))
}

async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<Json<NodeRecord>, ApiError> {
    Ok(Json(load_node(&state, &ctx, &node_id).await?))
}

async fn drain_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<Json<NodeRecord>, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "invalid_node_id", &ctx)?;
    let node = state
        .registry()
        .drain_node(&node_id)
        .await
        .map_err(domain_error(&ctx))?;
    info!(node_id = %node_id, request_id = %ctx.request_id, "Node draining");
    Ok(Json(node))
}

async fn node_telemetry(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<Json<NodeTelemetryResponse>, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "invalid_node_id", &ctx)?;
    Ok(Json(NodeTelemetryResponse {
        node_id,
        samples: state.telemetry().history(&node_id),
    }))
}

async fn agent_health(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<Json<AgentHealth>, ApiError> {
    let node = load_node(&state, &ctx, &node_id).await?;
    let target = AgentTarget {
        node_id: node.id,
        address: node.address,
    };
    let health = state.orchestrator().agents().health(&target).await.map_err(|e| {
        domain_error(&ctx)(ControlPlaneError::AgentUnreachable {
            node_id: node.id,
            message: e.to_string(),
        })
    })?;
    Ok(Json(health))
}
