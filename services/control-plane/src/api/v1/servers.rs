//! Server lifecycle endpoints.
//!
//! Lifecycle calls answer as soon as the transition is recorded and the
//! agent command is dispatched (202). Clients poll `GET /v1/servers/{id}`
//! for the settled state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kiln_id::ServerId;
use serde::Serialize;

use super::{domain_error, parse_id};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::orchestrator::{CreateServer, Operation};
use crate::registry::ServerInstance;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_server).get(list_servers))
        .route("/{server_id}", get(get_server).delete(delete_server))
        .route("/{server_id}/start", post(start_server))
        .route("/{server_id}/stop", post(stop_server))
        .route("/{server_id}/restart", post(restart_server))
}

#[derive(Debug, Serialize)]
pub struct ListServersResponse {
    pub items: Vec<ServerInstance>,
}

async fn create_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateServer>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = ctx.require_owner()?;
    let server = state
        .orchestrator()
        .create(owner, req)
        .await
        .map_err(domain_error(&ctx))?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn list_servers(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListServersResponse>, ApiError> {
    let owner = ctx.require_owner()?;
    let items = state.orchestrator().list(&owner).await;
    Ok(Json(ListServersResponse { items }))
}

async fn get_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<Json<ServerInstance>, ApiError> {
    let owner = ctx.require_owner()?;
    let server_id: ServerId = parse_id(&server_id, "invalid_server_id", &ctx)?;
    let server = state
        .orchestrator()
        .get(&owner, &server_id)
        .await
        .map_err(domain_error(&ctx))?;
    Ok(Json(server))
}

async fn lifecycle(
    state: AppState,
    ctx: RequestContext,
    server_id: String,
    op: Operation,
) -> Result<(StatusCode, Json<ServerInstance>), ApiError> {
    let owner = ctx.require_owner()?;
    let server_id: ServerId = parse_id(&server_id, "invalid_server_id", &ctx)?;
    let orchestrator = state.orchestrator();
    let result = match op {
        Operation::Start => orchestrator.start(&owner, &server_id).await,
        Operation::Stop => orchestrator.stop(&owner, &server_id).await,
        Operation::Restart => orchestrator.restart(&owner, &server_id).await,
        Operation::Delete => orchestrator.delete(&owner, &server_id).await,
    };
    let server = result.map_err(domain_error(&ctx))?;
    Ok((StatusCode::ACCEPTED, Json(server)))
}

async fn start_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle(state, ctx, server_id, Operation::Start).await
}

async fn stop_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle(state, ctx, server_id, Operation::Stop).await
}

async fn restart_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle(state, ctx, server_id, Operation::Restart).await
}

async fn delete_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle(state, ctx, server_id, Operation::Delete).await
}
