//! Shared harness: a control plane and one mock node agent on loopback.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_control_plane::{
    agent::HttpAgentClient,
    api,
    catalog::GameCatalog,
    console::{ConsoleProxy, TcpConsoleConnector, DEFAULT_VIEWER_BUFFER},
    orchestrator::{Orchestrator, OrchestratorSettings, ServerCountQuota},
    registry::Registry,
    state::AppState,
    telemetry::{TelemetryBroadcaster, DEFAULT_HISTORY_LEN},
};
use kiln_id::OwnerId;
use kiln_node_agent::{
    router as agent_router, AgentState, ConsoleGateway, ContainerRuntime, MockRuntime,
};
use kiln_protocol::{ContainerRef, ContainerState};
use kiln_reconcile::BackoffPolicy;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const OWNER_HEADER: &str = "x-owner-id";

pub struct Harness {
    pub base_url: String,
    pub ws_url: String,
    pub client: reqwest::Client,
    pub owner: OwnerId,
    pub node_id: String,
    pub runtime: Arc<MockRuntime>,
    pub orchestrator: Orchestrator,
    pub registry: Arc<Registry>,
    pub console: Arc<ConsoleProxy>,
    _shutdown: watch::Sender<bool>,
}

pub struct HarnessOptions {
    pub capacity: Value,
    pub max_servers: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            capacity: json!({"cpu": 400, "ram_mb": 8192, "disk_gb": 100}),
            max_servers: 10,
        }
    }
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,kiln_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Node agent with the mock runtime
        let runtime = Arc::new(MockRuntime::new());
        let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent_addr = agent_listener.local_addr().unwrap();
        let gateway = ConsoleGateway::bind("127.0.0.1:0".parse().unwrap(), runtime.clone())
            .await
            .unwrap();
        let console_port = gateway.local_addr().unwrap().port();
        tokio::spawn(gateway.run(shutdown_rx.clone()));

        // The agent's node id is only used in its health report here.
        let agent_app = agent_router(AgentState::new(kiln_id::NodeId::new(), runtime.clone()));
        tokio::spawn(async move {
            axum::serve(agent_listener, agent_app).await.unwrap();
        });

        // Control plane
        let registry = Arc::new(Registry::new());
        let settings = OrchestratorSettings {
            command_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::new(Duration::from_millis(50), 2),
            delete_stop_timeout: Duration::from_secs(1),
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::new(HttpAgentClient::new(Duration::from_secs(2)).unwrap()),
            GameCatalog::default(),
            Arc::new(ServerCountQuota {
                max_servers: options.max_servers,
            }),
            settings,
        );
        let telemetry = Arc::new(TelemetryBroadcaster::new(
            Arc::clone(&registry),
            DEFAULT_HISTORY_LEN,
        ));
        let console = Arc::new(ConsoleProxy::new(
            Arc::new(TcpConsoleConnector::new(Duration::from_secs(2))),
            DEFAULT_VIEWER_BUFFER,
        ));
        let state = AppState::new(orchestrator.clone(), telemetry, Arc::clone(&console));
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut harness = Self {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}"),
            client: reqwest::Client::new(),
            owner: OwnerId::new(),
            node_id: String::new(),
            runtime,
            orchestrator,
            registry,
            console,
            _shutdown: shutdown_tx,
        };

        let node = harness
            .post_json(
                "/v1/nodes",
                json!({
                    "address": agent_addr.to_string(),
                    "console_port": console_port,
                    "capacity": options.capacity,
                }),
            )
            .await;
        assert_eq!(node.status(), reqwest::StatusCode::CREATED);
        let node: Value = node.json().await.unwrap();
        harness.node_id = node["id"].as_str().unwrap().to_string();
        harness
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(OWNER_HEADER, self.owner.to_string())
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(OWNER_HEADER, self.owner.to_string())
            .send()
            .await
            .unwrap()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header(OWNER_HEADER, self.owner.to_string())
            .send()
            .await
            .unwrap()
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .header(OWNER_HEADER, self.owner.to_string())
            .send()
            .await
            .unwrap()
    }

    /// Create a server and return its JSON.
    pub async fn create_server(&self, name: &str, auto_start: bool) -> Value {
        let resp = self
            .post_json(
                "/v1/servers",
                json!({
                    "name": name,
                    "plan": {"cpu": 100, "ram_mb": 1024, "disk_gb": 5},
                    "game_type": "minecraft",
                    "auto_start": auto_start,
                }),
            )
            .await;
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        resp.json().await.unwrap()
    }

    /// Poll until the server reaches `status`, or panic.
    pub async fn wait_for_status(&self, server_id: &str, status: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let resp = self.get(&format!("/v1/servers/{server_id}")).await;
            let server: Value = resp.json().await.unwrap();
            if server["status"] == status {
                return server;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("server {server_id} never reached {status}; last seen {server}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// What the mock agent holds for a container.
    pub async fn container_state(&self, container: &str) -> ContainerState {
        self.runtime
            .inspect(&ContainerRef::new(container))
            .await
            .unwrap()
    }

    /// Poll until the server is gone from the registry.
    pub async fn wait_for_purge(&self, server_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let resp = self.get(&format!("/v1/servers/{server_id}")).await;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("server {server_id} was never purged");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
