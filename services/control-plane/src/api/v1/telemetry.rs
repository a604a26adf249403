//! Telemetry subscription endpoint.
//!
//! - GET /v1/telemetry/subscribe (WebSocket)
//!
//! The viewer receives the current `{nodeId: sample}` snapshot as a JSON
//! text message right away, then one message per update. Updates that land
//! while a viewer is still sending the previous one are coalesced.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::telemetry::{Snapshot, TelemetrySubscription};

pub fn routes() -> Router<AppState> {
    Router::new().route("/subscribe", get(subscribe))
}

async fn subscribe(
    State(state): State<AppState>,
    ctx: RequestContext,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_owner()?;
    let subscription = state.telemetry().subscribe();
    let request_id = ctx.request_id;
    Ok(ws.on_upgrade(move |socket| handle_subscriber(socket, subscription, request_id)))
}

fn snapshot_message(snapshot: &Snapshot) -> Option<Message> {
    match serde_json::to_string(snapshot) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(error = %e, "Failed to encode telemetry snapshot");
            None
        }
    }
}

async fn handle_subscriber(
    socket: WebSocket,
    mut subscription: TelemetrySubscription,
    request_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let initial = subscription.current();
    if let Some(msg) = snapshot_message(&initial) {
        if sender.send(msg).await.is_err() {
            return;
        }
    }
    debug!(request_id = %request_id, nodes = initial.len(), "Telemetry viewer attached");

    loop {
        tokio::select! {
            update = subscription.next() => {
                let Some(snapshot) = update else { break };
                let Some(msg) = snapshot_message(&snapshot) else { continue };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(request_id = %request_id, "Telemetry viewer detached");
}
