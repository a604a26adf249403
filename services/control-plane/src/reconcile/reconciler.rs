//! Drift detection between registry state and what agents report.
//!
//! One pass inspects every settled server (running or stopped, nothing in
//! flight) on a reachable node:
//! - observed matches the recorded state: nothing to do
//! - the container is gone: the server goes to `error`
//! - otherwise an idempotent start/stop is issued to restore it
//!
//! A server whose drift keeps returning is escalated to `error` once the
//! retry tracker gives up. A converged pass issues no commands.

use std::sync::Mutex;

use kiln_id::ServerId;
use kiln_protocol::ContainerState;
use kiln_reconcile::{ConvergenceStatus, RetryTracker, DEFAULT_RETRY_WINDOW};
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentTarget;
use crate::orchestrator::{Correction, Orchestrator};
use crate::registry::{NodeStatus, ServerHandle, ServerStatus};

/// Counters from one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub checked: usize,
    pub converged: usize,
    pub corrected: usize,
    pub failed: usize,
    pub unknown: usize,
    pub skipped: usize,
}

pub struct ServerReconciler {
    orchestrator: Orchestrator,
    retries: Mutex<RetryTracker<ServerId>>,
}

impl ServerReconciler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let max_retries = orchestrator.settings().backoff.max_retries;
        Self {
            orchestrator,
            retries: Mutex::new(RetryTracker::new(max_retries, DEFAULT_RETRY_WINDOW)),
        }
    }

    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let registry = self.orchestrator.registry();

        for server in registry.list_servers().await {
            let Some(handle) = registry.server(&server.id).await else {
                continue;
            };
            match self.reconcile_one(handle).await {
                None => stats.skipped += 1,
                Some(status) => {
                    stats.checked += 1;
                    match status {
                        ConvergenceStatus::Converged => stats.converged += 1,
                        ConvergenceStatus::Converging => stats.corrected += 1,
                        ConvergenceStatus::Diverged => stats.failed += 1,
                        ConvergenceStatus::Unknown => stats.unknown += 1,
                    }
                }
            }
        }

        self.retries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .prune();
        stats
    }

    /// Check one server. `None` means it was not eligible this pass.
    pub async fn reconcile_one(&self, handle: ServerHandle) -> Option<ConvergenceStatus> {
        let (server_id, seq, container, node_id) = {
            let server = handle.lock().await;
            if server.is_busy()
                || !matches!(server.status, ServerStatus::Running | ServerStatus::Stopped)
            {
                return None;
            }
            (
                server.id,
                server.op_seq,
                server.container_ref.clone()?,
                server.node_id?,
            )
        };

        let node = self.orchestrator.registry().node(&node_id).await?;
        if node.status == NodeStatus::Offline {
            return None;
        }
        let target = AgentTarget {
            node_id,
            address: node.address,
        };

        let timeout = self.orchestrator.settings().command_timeout;
        let inspect = self.orchestrator.agents().inspect(&target, &container);
        let observed = match tokio::time::timeout(timeout, inspect).await {
            Ok(Ok(status)) => status.state,
            Ok(Err(e)) => {
                debug!(server_id = %server_id, error = %e, "Inspect failed");
                return Some(ConvergenceStatus::Unknown);
            }
            Err(_) => {
                debug!(server_id = %server_id, "Inspect timed out");
                return Some(ConvergenceStatus::Unknown);
            }
        };

        let mut server = handle.lock().await;
        if server.op_seq != seq || server.is_busy() {
            return None;
        }

        let expect_running = server.status == ServerStatus::Running;

        if observed == ContainerState::Missing {
            warn!(server_id = %server_id, node_id = %node_id, "Container missing on node");
            server.fail("container missing on node");
            self.tracker().clear(&server_id);
            return Some(ConvergenceStatus::Diverged);
        }

        if observed.is_running() == expect_running {
            self.tracker().clear(&server_id);
            return Some(ConvergenceStatus::Converged);
        }

        if self.tracker().record_failure(&server_id) {
            warn!(
                server_id = %server_id,
                observed = ?observed,
                expected = %server.status,
                "Drift keeps returning, giving up"
            );
            server.fail(format!("container keeps drifting to {observed:?}"));
            self.tracker().clear(&server_id);
            return Some(ConvergenceStatus::Diverged);
        }

        info!(
            server_id = %server_id,
            observed = ?observed,
            expected = %server.status,
            "Drift detected"
        );
        let correction = if expect_running {
            Correction::Start
        } else {
            Correction::Stop
        };
        self.orchestrator
            .correct(handle.clone(), &mut server, target, correction);
        Some(ConvergenceStatus::Converging)
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, RetryTracker<ServerId>> {
        self.retries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
