//! Command API served to the control plane.
//!
//! - GET    /health
//! - POST   /containers               create (idempotent per server)
//! - POST   /containers/{ref}/start
//! - POST   /containers/{ref}/stop
//! - GET    /containers/{ref}         `missing` state when absent
//! - DELETE /containers/{ref}
//!
//! Runtime failures answer 500 so the control plane treats them as
//! transient; refusals (bad input, unknown container) answer 4xx.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use kiln_id::NodeId;
use kiln_protocol::{AgentHealth, ContainerRef, ContainerSpec, ContainerStatus, StopRequest};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::runtime::{ContainerRuntime, RuntimeError};

#[derive(Clone)]
pub struct AgentState {
    node_id: NodeId,
    runtime: Arc<dyn ContainerRuntime>,
}

impl AgentState {
    pub fn new(node_id: NodeId, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { node_id, runtime }
    }
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/containers", post(create_container))
        .route(
            "/containers/{container_ref}",
            get(inspect_container).delete(remove_container),
        )
        .route("/containers/{container_ref}/start", post(start_container))
        .route("/containers/{container_ref}/stop", post(stop_container))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

pub struct CommandError(RuntimeError);

impl From<RuntimeError> for CommandError {
    fn from(err: RuntimeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            RuntimeError::NotFound(_) => (StatusCode::NOT_FOUND, "container_not_found"),
            RuntimeError::NotRunning(_) => (StatusCode::CONFLICT, "container_not_running"),
            RuntimeError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            RuntimeError::Failed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "runtime_failed"),
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Container command failed");
        }
        let body = ErrorBody {
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AgentState>) -> Json<AgentHealth> {
    Json(AgentHealth {
        status: "ok".to_string(),
        node: state.node_id.to_string(),
        time: Utc::now(),
    })
}

async fn create_container(
    State(state): State<AgentState>,
    Json(spec): Json<ContainerSpec>,
) -> Result<Json<ContainerStatus>, CommandError> {
    Ok(Json(state.runtime.create(&spec).await?))
}

async fn start_container(
    State(state): State<AgentState>,
    Path(container_ref): Path<String>,
) -> Result<Json<ContainerStatus>, CommandError> {
    let container = ContainerRef::new(container_ref);
    Ok(Json(state.runtime.start(&container).await?))
}

async fn stop_container(
    State(state): State<AgentState>,
    Path(container_ref): Path<String>,
    Json(request): Json<StopRequest>,
) -> Result<Json<ContainerStatus>, CommandError> {
    let container = ContainerRef::new(container_ref);
    let grace = Duration::from_secs(request.timeout_secs);
    Ok(Json(state.runtime.stop(&container, grace).await?))
}

async fn inspect_container(
    State(state): State<AgentState>,
    Path(container_ref): Path<String>,
) -> Result<Json<ContainerStatus>, CommandError> {
    let container = ContainerRef::new(container_ref);
    let state = state.runtime.inspect(&container).await?;
    Ok(Json(ContainerStatus {
        container_ref: container,
        state,
    }))
}

async fn remove_container(
    State(state): State<AgentState>,
    Path(container_ref): Path<String>,
) -> Result<StatusCode, CommandError> {
    let container = ContainerRef::new(container_ref);
    state.runtime.remove(&container).await?;
    Ok(StatusCode::NO_CONTENT)
}
