//! Liveness and readiness probes.
//!
//! `/readyz` also carries a fleet summary (online nodes, servers, console
//! bridges) so an operator can see whether placement has anywhere to go.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::registry::NodeStatus;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet: Option<FleetHealth>,
}

/// Node and server counts reported by `/readyz`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct FleetHealth {
    pub nodes_online: usize,
    pub nodes_total: usize,
    pub servers: usize,
    pub console_bridges: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, fleet: Option<FleetHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        fleet,
    }
}

/// Liveness: the process is up.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Readiness: always serving, but degraded while no node can take servers.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry().list_nodes().await;
    let fleet = FleetHealth {
        nodes_online: nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Online)
            .count(),
        nodes_total: nodes.len(),
        servers: state.registry().list_servers().await.len(),
        console_bridges: state.console().active_bridges(),
    };
    let status = if fleet.nodes_online > 0 { "ok" } else { "degraded" };
    (StatusCode::OK, Json(response(status, Some(fleet))))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
