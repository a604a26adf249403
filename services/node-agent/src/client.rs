//! Control plane API client for the node agent.

use std::time::Duration;

use anyhow::Result;
use kiln_protocol::{NodeStats, StatsPush};
use tracing::debug;

/// Control plane API client.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client. `timeout` bounds a whole push.
    pub fn new(base_url: &str, node_id: impl ToString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_id: node_id.to_string(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Push one stats reading. The control plane answers 200 or nothing.
    pub async fn push_stats(&self, stats: NodeStats) -> Result<()> {
        let url = format!("{}/v1/agent/stats", self.base_url);
        let body = StatsPush {
            node_id: self.node_id.clone(),
            stats,
        };

        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("stats push failed: {} - {}", status, body);
        }

        debug!(cpu_pct = stats.cpu_pct, ram_pct = stats.ram_pct, "Stats pushed");
        Ok(())
    }
}
