//! Node-facing endpoints.

use axum::{extract::State, routing::post, Json, Router};
use kiln_protocol::StatsPush;
use serde::Serialize;

use super::domain_error;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", post(push_stats))
}

#[derive(Debug, Serialize)]
pub struct StatsAck {
    pub status: &'static str,
}

/// Fire-and-forget stats push. Unknown but well-formed node ids are
/// accepted; only a malformed id is refused.
async fn push_stats(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(push): Json<StatsPush>,
) -> Result<Json<StatsAck>, ApiError> {
    state
        .telemetry()
        .ingest(push)
        .await
        .map_err(domain_error(&ctx))?;
    Ok(Json(StatsAck { status: "ok" }))
}
