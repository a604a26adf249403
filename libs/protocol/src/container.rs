//! Container lifecycle commands exchanged with node agents.
//!
//! Every command is idempotent on the agent: re-issuing `create` for a
//! server that already has a container returns the existing reference, and
//! starting a running container (or stopping a stopped one) succeeds
//! without side effects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kiln_id::ServerId;
use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Opaque, agent-assigned handle to a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an agent needs to create a container for a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub server_id: ServerId,
    pub image: String,
    pub resources: Resources,
    /// Port published on the node.
    pub host_port: u16,
    /// Port the game listens on inside the container.
    pub container_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Deterministic container name, so repeated creates resolve to the
    /// same container.
    pub fn container_name(&self) -> String {
        format!("kiln-{}", self.server_id)
    }
}

/// Observed state of a container on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    /// The agent has no container under this reference.
    Missing,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Result of a lifecycle command or an inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_ref: ContainerRef,
    pub state: ContainerState,
}

/// Body of a stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    /// Grace period before the container is killed.
    pub timeout_secs: u64,
}

impl Default for StopRequest {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// Agent liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub status: String,
    pub node: String,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_ref_is_plain_string_on_the_wire() {
        let status = ContainerStatus {
            container_ref: ContainerRef::new("abc123"),
            state: ContainerState::Running,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"container_ref": "abc123", "state": "running"})
        );
    }

    #[test]
    fn test_container_name_is_stable() {
        let spec = ContainerSpec {
            server_id: ServerId::new(),
            image: "itzg/minecraft-server".to_string(),
            resources: Resources::new(100, 2048, 10),
            host_port: 25565,
            container_port: 25565,
            env: BTreeMap::new(),
        };
        assert_eq!(spec.container_name(), spec.clone().container_name());
        assert!(spec.container_name().starts_with("kiln-srv_"));
    }
}
