//! Stats sampling loop.
//!
//! Samples the host every interval and pushes the reading to the control
//! plane. Each push runs on its own task, so a slow or failing control plane
//! never delays the next tick; a failed push is logged and dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;
use crate::resources::HostSampler;

pub struct StatsLoop {
    client: ControlPlaneClient,
    sampler: HostSampler,
    interval: Duration,
    consecutive_failures: Arc<AtomicU32>,
}

impl StatsLoop {
    pub fn new(client: ControlPlaneClient, sampler: HostSampler, interval: Duration) -> Self {
        Self {
            client,
            sampler,
            interval,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node_id = %self.client.node_id(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting stats sampler"
        );

        let mut interval_timer = tokio::time::interval(self.interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let stats = self.sampler.sample();
                    let client = self.client.clone();
                    let failures = Arc::clone(&self.consecutive_failures);
                    tokio::spawn(async move {
                        match client.push_stats(stats).await {
                            Ok(()) => {
                                failures.store(0, Ordering::Relaxed);
                            }
                            Err(e) => {
                                let consecutive_failures = failures.fetch_add(1, Ordering::Relaxed) + 1;
                                if consecutive_failures <= 3 {
                                    warn!(error = %e, consecutive_failures, "Stats push failed");
                                } else {
                                    error!(error = %e, consecutive_failures, "Stats push failed repeatedly");
                                }
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stats sampler shutting down");
                        break;
                    }
                }
            }
        }
        debug!("Stats sampler stopped");
    }
}
