//! Domain error taxonomy for the control plane.
//!
//! Every lifecycle call returns either the resulting state or one of these
//! errors synchronously. Failures of asynchronous work (agent commands that
//! run after the call returned) never surface here; they show up as the
//! server's `error` status on the next read.

use kiln_id::{NodeId, ServerId};
use kiln_protocol::{ContainerRef, Resources};
use thiserror::Error;

use crate::registry::ServerStatus;

/// Result type for control plane operations.
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Bad input from the caller. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No node has enough spare capacity. Surfaced, not auto-retried.
    #[error("no node can host cpu={} ram_mb={} disk_gb={}", .requested.cpu, .requested.ram_mb, .requested.disk_gb)]
    Placement { requested: Resources },

    /// The lifecycle call is illegal from the server's current state.
    #[error("cannot {operation} server {server_id} while it is {from}")]
    InvalidTransition {
        server_id: ServerId,
        from: ServerStatus,
        operation: &'static str,
    },

    /// The node agent did not answer (or answered with a transport failure).
    #[error("agent on node {node_id} unreachable: {message}")]
    AgentUnreachable { node_id: NodeId, message: String },

    /// Opening or using a console attach stream failed.
    #[error("console stream for container {container_ref} failed: {message}")]
    UpstreamStream {
        container_ref: ContainerRef,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The caller is not allowed to act on this resource.
    #[error("{0}")]
    Forbidden(String),
}

impl ControlPlaneError {
    pub fn server_not_found(id: &ServerId) -> Self {
        Self::NotFound {
            kind: "server",
            id: id.to_string(),
        }
    }

    pub fn node_not_found(id: &NodeId) -> Self {
        Self::NotFound {
            kind: "node",
            id: id.to_string(),
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AgentUnreachable { .. } | Self::UpstreamStream { .. }
        )
    }
}
