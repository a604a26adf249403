//! Marks nodes offline when their stats pushes stop arriving.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::registry::Registry;

pub struct NodeMonitor {
    registry: Arc<Registry>,
    heartbeat_timeout: Duration,
    interval: Duration,
}

impl NodeMonitor {
    pub fn new(registry: Arc<Registry>, heartbeat_timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            heartbeat_timeout,
            interval,
        }
    }

    /// One sweep. Returns how many nodes went offline.
    pub async fn sweep(&self) -> usize {
        let changed = self
            .registry
            .mark_stale_nodes_offline(self.heartbeat_timeout, Utc::now())
            .await;
        if !changed.is_empty() {
            warn!(count = changed.len(), "Nodes went offline");
        }
        changed.len()
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.heartbeat_timeout.as_secs(),
            "Starting node monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Node monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_protocol::Resources;

    use super::*;
    use crate::registry::{NewNode, NodeStatus};

    #[tokio::test]
    async fn test_sweep_only_flags_silent_nodes() {
        let registry = Arc::new(Registry::new());
        let new_node = || NewNode {
            address: "10.0.0.1:5001".parse().unwrap(),
            console_port: 5002,
            capacity: Resources::new(100, 100, 0),
        };
        let silent = registry.register_node(new_node()).await;
        let chatty = registry.register_node(new_node()).await;

        let monitor = NodeMonitor::new(
            Arc::clone(&registry),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.record_heartbeat(&chatty.id, Utc::now()).await;

        assert_eq!(monitor.sweep().await, 1);
        assert_eq!(
            registry.node(&silent.id).await.unwrap().status,
            NodeStatus::Offline
        );
        assert_eq!(
            registry.node(&chatty.id).await.unwrap().status,
            NodeStatus::Online
        );
        assert_eq!(monitor.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let monitor = NodeMonitor::new(
            Arc::new(Registry::new()),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { monitor.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
