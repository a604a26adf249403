//! Server instances and their lifecycle state machine.
//!
//! ```text
//! provisioning -> starting -> running -> stopping -> stopped -> starting | deleting
//! provisioning -> stopped                running -> deleting
//! ```
//!
//! `error` is reachable on command failure from every state except
//! `deleting`, and is left only through `starting` or `deleting`.
//! `deleting` is terminal: the instance is purged once it finishes.

use chrono::{DateTime, Utc};
use kiln_id::{NodeId, OwnerId, ServerId};
use kiln_protocol::{ContainerRef, Resources};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Provisioning,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Error,
}

impl ServerStatus {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;

        if next == Error {
            return self != Deleting && self != Error;
        }

        matches!(
            (self, next),
            (Provisioning, Stopped)
                | (Provisioning, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Running, Deleting)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Stopped, Deleting)
                | (Error, Starting)
                | (Error, Deleting)
        )
    }

    /// States in which an agent command is outstanding.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Starting | Self::Stopping | Self::Deleting
        )
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the owner last asked the container to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInstance {
    pub id: ServerId,
    pub owner: OwnerId,
    pub name: String,
    pub game_type: String,
    /// Set at placement; `None` only before a node has been chosen.
    pub node_id: Option<NodeId>,
    pub plan: Resources,
    pub status: ServerStatus,
    pub desired: DesiredState,
    pub container_ref: Option<ContainerRef>,
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Bumped whenever a command is dispatched; async work only applies
    /// its result while this still matches.
    #[serde(skip)]
    pub(crate) op_seq: u64,

    /// True while an agent command is outstanding.
    #[serde(skip)]
    pub(crate) in_flight: bool,
}

impl ServerInstance {
    pub fn new(
        id: ServerId,
        owner: OwnerId,
        name: String,
        game_type: String,
        plan: Resources,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner,
            name,
            game_type,
            node_id: None,
            plan,
            status: ServerStatus::Provisioning,
            desired: DesiredState::Stopped,
            container_ref: None,
            port: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            op_seq: 0,
            in_flight: false,
        }
    }

    /// Move along a state machine edge. Returns false (and changes nothing)
    /// if the edge does not exist.
    pub(crate) fn transition(&mut self, next: ServerStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next != ServerStatus::Error {
            self.last_error = None;
        }
        true
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        if self.transition(ServerStatus::Error) {
            self.last_error = Some(message.into());
        }
        self.in_flight = false;
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }
}
