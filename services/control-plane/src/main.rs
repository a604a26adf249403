//! kiln Control Plane
//!
//! The control plane places game servers on nodes, drives their lifecycle
//! through the node agents, fans node telemetry out to dashboards and
//! proxies console sessions.

use std::sync::Arc;

use anyhow::Result;
use kiln_control_plane::{
    agent::HttpAgentClient,
    api, config,
    console::{ConsoleProxy, TcpConsoleConnector, DEFAULT_VIEWER_BUFFER},
    orchestrator::{Orchestrator, ServerCountQuota},
    reconcile::{NodeMonitor, ReconcileWorker},
    registry::Registry,
    state::AppState,
    telemetry::TelemetryBroadcaster,
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

    info!("Starting kiln control plane");
    info!(
        listen_addr = %config.listen_addr,
        games = config.games.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    let agents = Arc::new(HttpAgentClient::new(config.command_timeout)?);
    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        agents,
        config.games.clone(),
        Arc::new(ServerCountQuota {
            max_servers: config.max_servers_per_owner,
        }),
        config.orchestrator_settings(),
    );
    let telemetry = Arc::new(TelemetryBroadcaster::new(
        Arc::clone(&registry),
        config.telemetry_history,
    ));
    let console = Arc::new(ConsoleProxy::new(
        Arc::new(TcpConsoleConnector::new(config.console_connect_timeout)),
        DEFAULT_VIEWER_BUFFER,
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start reconcile worker in background
    let reconcile_worker = ReconcileWorker::new(orchestrator.clone(), config.reconcile_interval);
    let reconcile_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconcile_worker.run(shutdown_rx).await;
        }
    });

    // Start node monitor in background
    let node_monitor = NodeMonitor::new(
        Arc::clone(&registry),
        config.heartbeat_timeout,
        config.node_monitor_interval,
    );
    let monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            node_monitor.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(orchestrator, telemetry, console);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconcile_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, monitor_handle).await {
        warn!(error = %e, "Node monitor did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
