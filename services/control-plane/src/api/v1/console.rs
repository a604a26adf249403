//! Console attach endpoint.
//!
//! - GET /v1/servers/{id}/console (WebSocket)
//!
//! The attach stream is opened before the upgrade, so a node that cannot be
//! reached fails this request with a 502 instead of an empty socket. Only
//! starting and running servers can be attached.
//! Output is sent as binary messages. Text messages are written to stdin
//! with a trailing newline, binary messages are written as-is.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use kiln_id::ServerId;
use tracing::{debug, info, warn};

use super::{domain_error, parse_id};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::console::{ConsoleSession, ConsoleTarget};
use crate::error::ControlPlaneError;
use crate::registry::ServerStatus;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{server_id}/console", get(attach_console))
}

async fn attach_console(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let owner = ctx.require_owner()?;
    let server_id: ServerId = parse_id(&server_id, "invalid_server_id", &ctx)?;

    let server = state
        .orchestrator()
        .get(&owner, &server_id)
        .await
        .map_err(domain_error(&ctx))?;

    let not_attachable = || ControlPlaneError::InvalidTransition {
        server_id,
        from: server.status,
        operation: "attach",
    };
    let (Some(node_id), Some(container_ref)) = (server.node_id, server.container_ref.clone())
    else {
        return Err(domain_error(&ctx)(not_attachable()));
    };
    if !matches!(server.status, ServerStatus::Running | ServerStatus::Starting) {
        return Err(domain_error(&ctx)(not_attachable()));
    }

    let node = state
        .registry()
        .node(&node_id)
        .await
        .ok_or_else(|| domain_error(&ctx)(ControlPlaneError::node_not_found(&node_id)))?;

    let session = state
        .console()
        .attach(ConsoleTarget {
            node_id,
            console_addr: node.console_addr(),
            container_ref,
        })
        .await
        .map_err(domain_error(&ctx))?;

    info!(
        server_id = %server_id,
        viewer_id = %session.viewer_id(),
        request_id = %ctx.request_id,
        "Console attached"
    );

    Ok(ws.on_upgrade(move |socket| handle_console_socket(socket, session)))
}

/// Input as it should reach the container's stdin.
fn stdin_bytes(msg: Message) -> Option<Bytes> {
    match msg {
        Message::Text(text) => {
            let mut buf = BytesMut::with_capacity(text.len() + 1);
            buf.put_slice(text.as_str().as_bytes());
            buf.put_u8(b'\n');
            Some(buf.freeze())
        }
        Message::Binary(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

async fn handle_console_socket(socket: WebSocket, mut session: ConsoleSession) {
    let (mut client_sender, mut client_receiver) = socket.split();
    let viewer_id = session.viewer_id();

    loop {
        tokio::select! {
            output = session.recv() => {
                let Some(chunk) = output else {
                    debug!(viewer_id = %viewer_id, "Console stream ended");
                    let _ = client_sender.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = client_sender.send(Message::Binary(chunk)).await {
                    debug!(error = %e, viewer_id = %viewer_id, "Viewer socket closed");
                    break;
                }
            }
            msg = client_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        let Some(data) = stdin_bytes(msg) else { continue };
                        if let Err(e) = session.send_input(data).await {
                            warn!(error = %e, viewer_id = %viewer_id, "Failed to forward console input");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, viewer_id = %viewer_id, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    info!(viewer_id = %viewer_id, container = %session.container_ref(), "Console detached");
}
