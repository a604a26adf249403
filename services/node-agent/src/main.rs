//! kiln Node Agent
//!
//! Runs on each host and executes container commands for the control plane.
//!
//! ## Architecture
//!
//! - **Command API**: create/start/stop/inspect/remove containers on request
//! - **Console Gateway**: attach streams proxied by the control plane
//! - **Stats Sampler**: pushes host resource usage every interval
//! - **Runtime**: docker CLI in production, mock in development

use std::sync::Arc;

use anyhow::Result;
use kiln_node_agent::{
    api::{self, AgentState},
    client::ControlPlaneClient,
    config::{self, RuntimeKind},
    console_gateway::ConsoleGateway,
    resources::HostSampler,
    runtime::{ContainerRuntime, DockerRuntime, MockRuntime},
    sampler::StatsLoop,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KILN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln node agent");
    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        runtime = ?config.runtime,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    if config.node_id_generated {
        warn!(
            node_id = %config.node_id,
            "KILN_NODE_ID is unset, using a generated id; register this node and \
             set KILN_NODE_ID or the control plane will not recognise its stats"
        );
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new()),
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
    };

    // Start the console gateway
    let gateway = ConsoleGateway::bind(config.console_listen_addr, Arc::clone(&runtime)).await?;
    let gateway_handle = tokio::spawn(gateway.run(shutdown_rx.clone()));

    // Start the stats sampler
    let client = ControlPlaneClient::new(
        &config.control_plane_url,
        config.node_id,
        config.sample_interval,
    )?;
    let stats_loop = StatsLoop::new(
        client,
        HostSampler::new(config.data_dir.clone()),
        config.sample_interval,
    );
    let sampler_handle = tokio::spawn(stats_loop.run(shutdown_rx.clone()));

    // Serve the command API
    let app = api::router(AgentState::new(config.node_id, runtime));
    let listener = tokio::net::TcpListener::bind(config.agent_listen_addr).await?;
    info!(addr = %config.agent_listen_addr, "Command API listening");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Command API exited normally"),
                Ok(Err(e)) => error!(error = %e, "Command API error"),
                Err(e) => error!(error = %e, "Command API task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, gateway_handle).await;
    let _ = tokio::time::timeout(shutdown_timeout, sampler_handle).await;

    info!("Node agent shutdown complete");
    Ok(())
}
