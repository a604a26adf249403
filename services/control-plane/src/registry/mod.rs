//! In-memory registry of nodes and servers.
//!
//! The registry is an explicit object injected into the orchestrator, the
//! telemetry broadcaster and the API; nothing reaches it through globals.
//!
//! Locking:
//! - the node table sits behind one `RwLock`, so placement re-checks and
//!   commits capacity atomically even when creates race for the same node
//! - each server sits behind its own `Mutex`, which serializes lifecycle
//!   commands per instance
//!
//! Lock order is servers map, then a single server, then the node table.

mod nodes;
mod servers;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_id::{NodeId, OwnerId, ServerId};
use kiln_protocol::Resources;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub use nodes::{select_node, NewNode, NodeRecord, NodeStatus, FIRST_HOST_PORT};
pub use servers::{DesiredState, ServerInstance, ServerStatus};

use crate::error::{ControlPlaneError, ControlPlaneResult};

/// Shared handle to a single server's guarded state.
pub type ServerHandle = Arc<Mutex<ServerInstance>>;

/// Where a new server landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub host_port: u16,
}

#[derive(Default)]
pub struct Registry {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    servers: RwLock<HashMap<ServerId, ServerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn register_node(&self, input: NewNode) -> NodeRecord {
        let record = NodeRecord::new(NodeId::new(), input, Utc::now());
        info!(
            node_id = %record.id,
            address = %record.address,
            cpu = record.capacity.cpu,
            ram_mb = record.capacity.ram_mb,
            disk_gb = record.capacity.disk_gb,
            "Node registered"
        );
        self.nodes.write().await.insert(record.id, record.clone());
        record
    }

    pub async fn node(&self, id: &NodeId) -> Option<NodeRecord> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    pub async fn list_nodes(&self) -> Vec<NodeRecord> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Stop placing new servers on a node.
    pub async fn drain_node(&self, id: &NodeId) -> ControlPlaneResult<NodeRecord> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| ControlPlaneError::node_not_found(id))?;
        if !node.draining {
            info!(node_id = %id, "Node draining");
            node.draining = true;
        }
        if node.status == NodeStatus::Online {
            node.status = NodeStatus::Draining;
        }
        Ok(node.clone())
    }

    /// Record a heartbeat. Returns false if the node is unknown.
    ///
    /// An offline node comes back online, or draining if it was drained.
    pub async fn record_heartbeat(&self, id: &NodeId, at: DateTime<Utc>) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            return false;
        };
        node.last_heartbeat = Some(at);
        if node.status == NodeStatus::Offline {
            node.status = node.reachable_status();
            info!(node_id = %id, status = %node.status, "Node reachable again");
        }
        true
    }

    /// Mark every node whose last heartbeat is older than `timeout` offline.
    /// Returns the nodes that changed.
    pub async fn mark_stale_nodes_offline(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<NodeId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut changed = Vec::new();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Offline {
                continue;
            }
            if now.signed_duration_since(node.last_seen()) > timeout {
                warn!(
                    node_id = %node.id,
                    last_heartbeat = ?node.last_heartbeat,
                    "Node missed heartbeat deadline, marking offline"
                );
                node.status = NodeStatus::Offline;
                changed.push(node.id);
            }
        }
        changed
    }

    /// Pick a node for `request` and commit the capacity and a host port in
    /// the same critical section.
    pub async fn reserve(&self, request: &Resources) -> ControlPlaneResult<Placement> {
        let mut nodes = self.nodes.write().await;

        let node_id = select_node(nodes.values(), request)
            .map(|n| n.id)
            .ok_or(ControlPlaneError::Placement {
                requested: *request,
            })?;

        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| ControlPlaneError::node_not_found(&node_id))?;
        let host_port = node.next_free_port().ok_or(ControlPlaneError::Placement {
            requested: *request,
        })?;

        node.committed = node.committed.saturating_add(request);
        node.ports.insert(host_port);

        Ok(Placement {
            node_id,
            address: node.address,
            host_port,
        })
    }

    /// Give back capacity and the host port committed by [`Registry::reserve`].
    pub async fn release(&self, node_id: &NodeId, request: &Resources, host_port: Option<u16>) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.committed = node.committed.saturating_sub(request);
            if let Some(port) = host_port {
                node.ports.remove(&port);
            }
        }
    }

    // =========================================================================
    // Servers
    // =========================================================================

    pub async fn insert_server(&self, server: ServerInstance) -> ServerHandle {
        let id = server.id;
        let handle = Arc::new(Mutex::new(server));
        self.servers.write().await.insert(id, Arc::clone(&handle));
        handle
    }

    pub async fn server(&self, id: &ServerId) -> Option<ServerHandle> {
        self.servers.read().await.get(id).cloned()
    }

    /// Point-in-time copy of a server.
    pub async fn get_server(&self, id: &ServerId) -> Option<ServerInstance> {
        let handle = self.server(id).await?;
        let server = handle.lock().await;
        Some(server.clone())
    }

    pub async fn list_servers(&self) -> Vec<ServerInstance> {
        let handles: Vec<ServerHandle> = self.servers.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn servers_for_owner(&self, owner: &OwnerId) -> Vec<ServerInstance> {
        self.list_servers()
            .await
            .into_iter()
            .filter(|s| &s.owner == owner)
            .collect()
    }

    /// Remove a server and release everything it held on its node.
    pub async fn purge_server(&self, id: &ServerId) -> Option<ServerInstance> {
        let handle = self.servers.write().await.remove(id)?;
        let server = handle.lock().await.clone();
        if let Some(node_id) = server.node_id {
            self.release(&node_id, &server.plan, server.port).await;
        }
        info!(server_id = %id, "Server purged from registry");
        Some(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(cpu: u64, ram_mb: u64) -> NewNode {
        NewNode {
            address: "10.0.0.1:5001".parse().unwrap(),
            console_port: 5002,
            capacity: Resources::new(cpu, ram_mb, 0),
        }
    }

    #[tokio::test]
    async fn test_reserve_commits_capacity() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;

        let placement = registry.reserve(&Resources::new(50, 50, 0)).await.unwrap();
        assert_eq!(placement.node_id, node.id);
        assert_eq!(placement.host_port, FIRST_HOST_PORT);

        let node = registry.node(&node.id).await.unwrap();
        assert_eq!(node.committed, Resources::new(50, 50, 0));
    }

    #[tokio::test]
    async fn test_reserve_rejects_overcommit_without_mutation() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        registry.reserve(&Resources::new(50, 50, 0)).await.unwrap();

        let err = registry
            .reserve(&Resources::new(60, 60, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Placement { .. }));

        let node = registry.node(&node.id).await.unwrap();
        assert_eq!(node.committed, Resources::new(50, 50, 0));
        assert_eq!(node.ports.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_overcommit() {
        let registry = Arc::new(Registry::new());
        let node = registry.register_node(new_node(100, 100)).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.reserve(&Resources::new(30, 30, 0)).await.is_ok()
            }));
        }
        let mut ok = 0;
        for t in tasks {
            if t.await.unwrap() {
                ok += 1;
            }
        }

        assert_eq!(ok, 3);
        let node = registry.node(&node.id).await.unwrap();
        assert_eq!(node.committed, Resources::new(90, 90, 0));
    }

    #[tokio::test]
    async fn test_release_frees_port_and_capacity() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        let plan = Resources::new(40, 40, 0);
        let p = registry.reserve(&plan).await.unwrap();

        registry.release(&p.node_id, &plan, Some(p.host_port)).await;

        let node = registry.node(&node.id).await.unwrap();
        assert_eq!(node.committed, Resources::ZERO);
        assert!(node.ports.is_empty());
    }

    #[tokio::test]
    async fn test_stale_nodes_go_offline_and_heartbeat_revives() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        let later = Utc::now() + chrono::Duration::seconds(60);

        let changed = registry
            .mark_stale_nodes_offline(Duration::from_secs(30), later)
            .await;
        assert_eq!(changed, vec![node.id]);
        assert_eq!(
            registry.node(&node.id).await.unwrap().status,
            NodeStatus::Offline
        );

        assert!(registry.record_heartbeat(&node.id, later).await);
        assert_eq!(
            registry.node(&node.id).await.unwrap().status,
            NodeStatus::Online
        );
        assert!(!registry.record_heartbeat(&NodeId::new(), later).await);
    }

    #[tokio::test]
    async fn test_draining_is_sticky_across_heartbeats() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        registry.drain_node(&node.id).await.unwrap();
        registry.record_heartbeat(&node.id, Utc::now()).await;

        assert_eq!(
            registry.node(&node.id).await.unwrap().status,
            NodeStatus::Draining
        );
        assert!(registry.reserve(&Resources::new(1, 1, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_survives_offline_blip() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        registry.drain_node(&node.id).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        let changed = registry
            .mark_stale_nodes_offline(Duration::from_secs(30), later)
            .await;
        assert_eq!(changed, vec![node.id]);
        assert_eq!(
            registry.node(&node.id).await.unwrap().status,
            NodeStatus::Offline
        );

        assert!(registry.record_heartbeat(&node.id, later).await);
        let node = registry.node(&node.id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Draining);
        assert!(node.draining);
        assert!(registry.reserve(&Resources::new(1, 1, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_draining_offline_node_stays_drained() {
        let registry = Registry::new();
        let node = registry.register_node(new_node(100, 100)).await;
        let later = Utc::now() + chrono::Duration::seconds(60);
        registry
            .mark_stale_nodes_offline(Duration::from_secs(30), later)
            .await;

        let drained = registry.drain_node(&node.id).await.unwrap();
        assert_eq!(drained.status, NodeStatus::Offline);

        registry.record_heartbeat(&node.id, later).await;
        assert_eq!(
            registry.node(&node.id).await.unwrap().status,
            NodeStatus::Draining
        );
    }
}
