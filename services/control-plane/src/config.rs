//! Control plane configuration, read from `KILN_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_reconcile::BackoffPolicy;

use crate::catalog::{GameCatalog, DEFAULT_GAME_IMAGES};
use crate::orchestrator::OrchestratorSettings;
use crate::telemetry::DEFAULT_HISTORY_LEN;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub reconcile_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub node_monitor_interval: Duration,
    pub command_timeout: Duration,
    pub console_connect_timeout: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
    pub delete_stop_timeout: Duration,
    pub telemetry_history: usize,
    pub max_servers_per_owner: usize,
    pub games: GameCatalog,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("KILN_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("KILN_LISTEN_ADDR")?;

        let log_level = std::env::var("KILN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let games = GameCatalog::parse(
            &std::env::var("KILN_GAME_IMAGES").unwrap_or_else(|_| DEFAULT_GAME_IMAGES.to_string()),
        )
        .context("KILN_GAME_IMAGES")?;

        Ok(Self {
            listen_addr,
            log_level,
            reconcile_interval: env_secs("KILN_RECONCILE_INTERVAL", 30)?,
            heartbeat_timeout: env_secs("KILN_HEARTBEAT_TIMEOUT", 30)?,
            node_monitor_interval: env_secs("KILN_NODE_MONITOR_INTERVAL", 5)?,
            command_timeout: env_secs("KILN_COMMAND_TIMEOUT", 30)?,
            console_connect_timeout: env_secs("KILN_CONSOLE_CONNECT_TIMEOUT", 5)?,
            retry_base: env_secs("KILN_RETRY_BASE", 2)?,
            max_retries: env_parse("KILN_MAX_RETRIES", 3)?,
            delete_stop_timeout: env_secs("KILN_DELETE_STOP_TIMEOUT", 10)?,
            telemetry_history: env_parse("KILN_TELEMETRY_HISTORY", DEFAULT_HISTORY_LEN)?,
            max_servers_per_owner: env_parse("KILN_MAX_SERVERS_PER_OWNER", 10)?,
            games,
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            command_timeout: self.command_timeout,
            backoff: BackoffPolicy::new(self.retry_base, self.max_retries),
            delete_stop_timeout: self.delete_stop_timeout,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("invalid {name}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    let secs: u64 = env_parse(name, default)?;
    if secs == 0 {
        anyhow::bail!("{name} must be at least 1 second");
    }
    Ok(Duration::from_secs(secs))
}
