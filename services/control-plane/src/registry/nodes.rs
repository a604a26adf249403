//! Node inventory records and the placement query.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use kiln_id::NodeId;
use kiln_protocol::Resources;
use serde::{Deserialize, Serialize};

/// First host port handed out on a node.
pub const FIRST_HOST_PORT: u16 = 25565;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    /// Hosts its existing servers but takes no new placements.
    Draining,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Admin input for registering a node.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    /// Agent command API address.
    pub address: SocketAddr,
    /// Agent console gateway port (same host as `address`).
    #[serde(default = "default_console_port")]
    pub console_port: u16,
    pub capacity: Resources,
}

fn default_console_port() -> u16 {
    5002
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: SocketAddr,
    pub console_port: u16,
    pub capacity: Resources,
    /// Sum of the plans of every server placed here.
    pub committed: Resources,
    pub status: NodeStatus,
    /// Set by an admin drain and never cleared by heartbeats. A draining
    /// node that goes offline comes back as draining.
    pub draining: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) ports: BTreeSet<u16>,
}

impl NodeRecord {
    pub fn new(id: NodeId, input: NewNode, now: DateTime<Utc>) -> Self {
        Self {
            id,
            address: input.address,
            console_port: input.console_port,
            capacity: input.capacity,
            committed: Resources::ZERO,
            status: NodeStatus::Online,
            draining: false,
            last_heartbeat: None,
            registered_at: now,
            ports: BTreeSet::new(),
        }
    }

    pub fn spare(&self) -> Resources {
        self.capacity.saturating_sub(&self.committed)
    }

    pub fn console_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.console_port)
    }

    /// Whether the node may receive a new server with this request.
    pub fn can_host(&self, request: &Resources) -> bool {
        self.status == NodeStatus::Online && !self.draining && request.fits_within(&self.spare())
    }

    /// Lowest free host port, if any remain.
    pub(crate) fn next_free_port(&self) -> Option<u16> {
        (FIRST_HOST_PORT..=u16::MAX).find(|p| !self.ports.contains(p))
    }

    /// Status a node returns to once it is heard from again.
    pub(crate) fn reachable_status(&self) -> NodeStatus {
        if self.draining {
            NodeStatus::Draining
        } else {
            NodeStatus::Online
        }
    }

    /// Time heartbeat staleness is measured from.
    pub(crate) fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.registered_at)
    }
}

/// Least-loaded-first placement.
///
/// Among online nodes whose spare capacity covers `request`, pick the one
/// with the most spare capacity (RAM, then CPU, then disk), breaking ties by
/// the smallest node id.
pub fn select_node<'a, I>(nodes: I, request: &Resources) -> Option<&'a NodeRecord>
where
    I: IntoIterator<Item = &'a NodeRecord>,
{
    nodes
        .into_iter()
        .filter(|n| n.can_host(request))
        .min_by(|a, b| {
            let (sa, sb) = (a.spare(), b.spare());
            (sb.ram_mb, sb.cpu, sb.disk_gb)
                .cmp(&(sa.ram_mb, sa.cpu, sa.disk_gb))
                .then_with(|| a.id.cmp(&b.id))
        })
}
