//! Telemetry broadcaster.
//!
//! Agents push one reading per tick. The broadcaster keeps the latest sample
//! per node plus a bounded history, and publishes the whole latest snapshot
//! to every subscriber on each push.
//!
//! Delivery is latest-state only: a `watch` channel holds one snapshot, so a
//! slow viewer skips intermediate updates instead of queueing them, and a
//! fresh subscriber starts from the current snapshot.
//!
//! Pushes from ids no registered node carries are kept for at most
//! [`MAX_UNREGISTERED_NODES`] ids; past that the oldest such id is forgotten.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use kiln_id::NodeId;
use kiln_protocol::{StatsPush, TelemetrySample};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::registry::Registry;

pub const DEFAULT_HISTORY_LEN: usize = 720;

/// Unregistered node ids tracked at once.
pub const MAX_UNREGISTERED_NODES: usize = 64;

/// `{nodeId: latest sample}` as sent to viewers.
pub type Snapshot = BTreeMap<NodeId, TelemetrySample>;

/// How a push was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Well-formed id that no registered node carries. Kept, but flagged.
    Unregistered,
}

#[derive(Default)]
struct Buffers {
    history: HashMap<NodeId, VecDeque<TelemetrySample>>,
    /// Unregistered ids in first-seen order.
    unregistered: VecDeque<NodeId>,
}

pub struct TelemetryBroadcaster {
    registry: Arc<Registry>,
    history_len: usize,
    buffers: Mutex<Buffers>,
    latest: watch::Sender<Arc<Snapshot>>,
}

impl TelemetryBroadcaster {
    pub fn new(registry: Arc<Registry>, history_len: usize) -> Self {
        Self {
            registry,
            history_len: history_len.max(1),
            buffers: Mutex::new(Buffers::default()),
            latest: watch::Sender::new(Arc::new(Snapshot::new())),
        }
    }

    /// Take one push from an agent.
    ///
    /// Registered nodes also get their heartbeat refreshed.
    pub async fn ingest(&self, push: StatsPush) -> ControlPlaneResult<IngestOutcome> {
        let node_id: NodeId = push
            .node_id
            .parse()
            .map_err(|e| ControlPlaneError::Validation(format!("invalid nodeId: {e}")))?;
        let now = Utc::now();
        let sample = TelemetrySample::from_stats(node_id, &push.stats, now);

        let outcome = if self.registry.record_heartbeat(&node_id, now).await {
            IngestOutcome::Accepted
        } else {
            warn!(node_id = %node_id, "Stats push from unregistered node");
            IngestOutcome::Unregistered
        };

        self.record(sample, outcome == IngestOutcome::Accepted);
        Ok(outcome)
    }

    fn record(&self, sample: TelemetrySample, registered: bool) {
        let node_id = sample.node_id;
        let mut buffers = self.buffers.lock().unwrap_or_else(|p| p.into_inner());

        let mut evicted = None;
        if registered {
            buffers.unregistered.retain(|id| *id != node_id);
        } else if !buffers.unregistered.contains(&node_id) {
            buffers.unregistered.push_back(node_id);
            if buffers.unregistered.len() > MAX_UNREGISTERED_NODES {
                evicted = buffers.unregistered.pop_front();
            }
        }
        if let Some(old) = evicted {
            buffers.history.remove(&old);
            warn!(node_id = %old, "Dropping telemetry of unregistered node");
        }

        let ring = buffers
            .history
            .entry(node_id)
            .or_insert_with(|| VecDeque::with_capacity(self.history_len));
        if ring.len() == self.history_len {
            ring.pop_front();
        }
        ring.push_back(sample);

        // Published under the lock so history and snapshot evict together.
        self.latest.send_modify(|snapshot| {
            let snapshot = Arc::make_mut(snapshot);
            if let Some(old) = evicted {
                snapshot.remove(&old);
            }
            snapshot.insert(node_id, sample);
        });
        drop(buffers);

        debug!(
            node_id = %sample.node_id,
            cpu_pct = sample.cpu_pct,
            ram_pct = sample.ram_pct,
            viewers = self.latest.receiver_count(),
            "Telemetry published"
        );
    }

    /// Current latest-per-node snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.latest.borrow().clone()
    }

    /// Buffered samples for one node, oldest first.
    pub fn history(&self, node_id: &NodeId) -> Vec<TelemetrySample> {
        let buffers = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        buffers
            .history
            .get(node_id)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> TelemetrySubscription {
        TelemetrySubscription {
            rx: self.latest.subscribe(),
        }
    }
}

/// One viewer's view of the snapshot stream.
pub struct TelemetrySubscription {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl TelemetrySubscription {
    /// Snapshot to send right after attaching.
    pub fn current(&mut self) -> Arc<Snapshot> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next publish. `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use kiln_protocol::{NodeStats, Resources};

    use crate::registry::{NewNode, NodeStatus};

    fn push(node_id: &NodeId, cpu: f64) -> StatsPush {
        StatsPush {
            node_id: node_id.to_string(),
            stats: NodeStats {
                cpu_pct: cpu,
                ram_pct: 40.0,
                disk_pct: 10.0,
                network_rate: 0.0,
                observed_at: None,
            },
        }
    }

    async fn registered(registry: &Registry) -> NodeId {
        registry
            .register_node(NewNode {
                address: "10.0.0.1:5001".parse().unwrap(),
                console_port: 5002,
                capacity: Resources::new(400, 8192, 100),
            })
            .await
            .id
    }

    #[tokio::test]
    async fn test_new_subscriber_sees_latest_per_node() {
        let registry = Arc::new(Registry::new());
        let a = registered(&registry).await;
        let b = registered(&registry).await;
        let telemetry = TelemetryBroadcaster::new(registry, 10);

        telemetry.ingest(push(&a, 10.0)).await.unwrap();
        telemetry.ingest(push(&a, 20.0)).await.unwrap();
        telemetry.ingest(push(&b, 30.0)).await.unwrap();

        let mut sub = telemetry.subscribe();
        let first = sub.current();
        assert_eq!(first.len(), 2);
        assert_eq!(first[&a].cpu_pct, 20.0);
        assert_eq!(first[&b].cpu_pct, 30.0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_updates() {
        let registry = Arc::new(Registry::new());
        let a = registered(&registry).await;
        let telemetry = Arc::new(TelemetryBroadcaster::new(registry, 10));

        let mut sub = telemetry.subscribe();
        assert!(sub.current().is_empty());

        telemetry.ingest(push(&a, 55.0)).await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update[&a].cpu_pct, 55.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded_oldest_first() {
        let registry = Arc::new(Registry::new());
        let a = registered(&registry).await;
        let telemetry = TelemetryBroadcaster::new(registry, 3);

        for cpu in [1.0, 2.0, 3.0, 4.0, 5.0] {
            telemetry.ingest(push(&a, cpu)).await.unwrap();
        }

        let cpus: Vec<f64> = telemetry.history(&a).iter().map(|s| s.cpu_pct).collect();
        assert_eq!(cpus, vec![3.0, 4.0, 5.0]);
        assert!(telemetry.history(&NodeId::new()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_is_flagged_but_kept() {
        let registry = Arc::new(Registry::new());
        let telemetry = TelemetryBroadcaster::new(registry, 10);
        let stranger = NodeId::new();

        let outcome = telemetry.ingest(push(&stranger, 5.0)).await.unwrap();

        assert_eq!(outcome, IngestOutcome::Unregistered);
        assert!(telemetry.snapshot().contains_key(&stranger));
    }

    #[tokio::test]
    async fn test_unregistered_ids_are_capped_oldest_first() {
        let registry = Arc::new(Registry::new());
        let known = registered(&registry).await;
        let telemetry = TelemetryBroadcaster::new(registry, 10);
        telemetry.ingest(push(&known, 1.0)).await.unwrap();

        let strangers: Vec<NodeId> = (0..=MAX_UNREGISTERED_NODES).map(|_| NodeId::new()).collect();
        for stranger in &strangers {
            telemetry.ingest(push(stranger, 5.0)).await.unwrap();
        }

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.len(), MAX_UNREGISTERED_NODES + 1);
        assert!(snapshot.contains_key(&known));
        assert!(!snapshot.contains_key(&strangers[0]));
        assert!(telemetry.history(&strangers[0]).is_empty());
        assert!(snapshot.contains_key(&strangers[MAX_UNREGISTERED_NODES]));

        // A repeat push from a tracked id does not evict anyone.
        telemetry.ingest(push(&strangers[1], 6.0)).await.unwrap();
        assert_eq!(telemetry.snapshot().len(), MAX_UNREGISTERED_NODES + 1);
        assert_eq!(telemetry.history(&strangers[1]).len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_node_id_is_rejected() {
        let telemetry = TelemetryBroadcaster::new(Arc::new(Registry::new()), 10);
        let mut bad = push(&NodeId::new(), 5.0);
        bad.node_id = "node-1".into();

        assert!(matches!(
            telemetry.ingest(bad).await,
            Err(ControlPlaneError::Validation(_))
        ));
        assert!(telemetry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_push_revives_offline_node() {
        let registry = Arc::new(Registry::new());
        let a = registered(&registry).await;
        registry
            .mark_stale_nodes_offline(Duration::ZERO, Utc::now() + chrono::Duration::seconds(5))
            .await;
        let telemetry = TelemetryBroadcaster::new(Arc::clone(&registry), 10);

        telemetry.ingest(push(&a, 5.0)).await.unwrap();

        assert_eq!(registry.node(&a).await.unwrap().status, NodeStatus::Online);
    }
}
