//! Configuration for the node agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_id::NodeId;

/// Which container runtime executes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// The `docker` CLI on this host.
    Docker,
    /// In-memory containers with an echo console, for development.
    Mock,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown runtime '{other}' (expected docker or mock)"),
        }
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Id the control plane assigned when this node was registered
    /// (`KILN_NODE_ID`). A fresh id is generated when unset, and the control
    /// plane will then drop this agent's stats as coming from an unknown node.
    pub node_id: NodeId,

    /// Whether `node_id` was generated because `KILN_NODE_ID` was unset.
    pub node_id_generated: bool,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Where the command API listens.
    pub agent_listen_addr: SocketAddr,

    /// Where the console gateway listens.
    pub console_listen_addr: SocketAddr,

    /// Stats sampling interval.
    pub sample_interval: Duration,

    pub runtime: RuntimeKind,

    /// Mount point whose usage is reported as disk usage.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let (node_id, node_id_generated) = resolve_node_id(std::env::var("KILN_NODE_ID").ok())?;

        let control_plane_url = std::env::var("KILN_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let agent_listen_addr = std::env::var("KILN_AGENT_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5001".to_string())
            .parse()
            .context("KILN_AGENT_LISTEN_ADDR")?;

        let console_listen_addr = std::env::var("KILN_CONSOLE_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5002".to_string())
            .parse()
            .context("KILN_CONSOLE_LISTEN_ADDR")?;

        let sample_interval_secs: u64 = std::env::var("KILN_SAMPLE_INTERVAL")
            .ok()
            .map(|s| s.trim().parse())
            .transpose()
            .context("KILN_SAMPLE_INTERVAL")?
            .unwrap_or(5);
        if sample_interval_secs == 0 {
            anyhow::bail!("KILN_SAMPLE_INTERVAL must be at least 1 second");
        }

        let runtime = std::env::var("KILN_RUNTIME")
            .unwrap_or_else(|_| "docker".to_string())
            .parse()
            .context("KILN_RUNTIME")?;

        let data_dir = std::env::var("KILN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/kiln"));

        let log_level = std::env::var("KILN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_id,
            node_id_generated,
            control_plane_url,
            agent_listen_addr,
            console_listen_addr,
            sample_interval: Duration::from_secs(sample_interval_secs),
            runtime,
            data_dir,
            log_level,
        })
    }
}

/// Parse the configured node id, or generate one when none is set.
fn resolve_node_id(raw: Option<String>) -> Result<(NodeId, bool)> {
    match raw.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Ok((raw.parse().context("KILN_NODE_ID")?, false)),
        _ => Ok((NodeId::new(), true)),
    }
}
