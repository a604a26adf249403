//! Node telemetry payloads.
//!
//! Agents push a [`StatsPush`] every sampling tick; the control plane turns
//! it into a [`TelemetrySample`] and fans a `{nodeId: sample}` snapshot out
//! to viewers. These types are viewer-facing, so they use camelCase keys.

use chrono::{DateTime, Utc};
use kiln_id::NodeId;
use serde::{Deserialize, Serialize};

/// One host resource reading as measured by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_pct: f64,
    /// Combined rx+tx throughput in bytes per second.
    #[serde(default)]
    pub network_rate: f64,
    /// When the agent took the reading. Filled in on ingest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Body of the fire-and-forget stats push endpoint.
///
/// `node_id` stays a raw string so the control plane can reject malformed
/// ids itself and accept (but flag) well-formed ids it does not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPush {
    pub node_id: String,
    pub stats: NodeStats,
}

/// A point-in-time resource reading attributed to a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub node_id: NodeId,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_pct: f64,
    pub network_rate: f64,
    pub observed_at: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn from_stats(node_id: NodeId, stats: &NodeStats, received_at: DateTime<Utc>) -> Self {
        Self {
            node_id,
            cpu_pct: clamp_pct(stats.cpu_pct),
            ram_pct: clamp_pct(stats.ram_pct),
            disk_pct: clamp_pct(stats.disk_pct),
            network_rate: stats.network_rate.max(0.0),
            observed_at: stats.observed_at.unwrap_or(received_at),
        }
    }
}

fn clamp_pct(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
