//! Periodic reconciliation worker.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument};

use super::reconciler::ServerReconciler;
use crate::orchestrator::Orchestrator;

pub struct ReconcileWorker {
    reconciler: ServerReconciler,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            reconciler: ServerReconciler::new(orchestrator),
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // First tick completes immediately; give agents a chance to report.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.reconciler.reconcile_all().await;
                    if stats.corrected > 0 || stats.failed > 0 {
                        info!(
                            checked = stats.checked,
                            corrected = stats.corrected,
                            failed = stats.failed,
                            unknown = stats.unknown,
                            "Reconcile pass found drift"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
