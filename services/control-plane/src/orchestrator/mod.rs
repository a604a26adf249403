//! Lifecycle orchestrator.
//!
//! Drives create/start/stop/restart/delete for server instances. Every call
//! validates against the state machine, records the transitional state and
//! returns; the agent command runs on a spawned task and its result lands on
//! the instance later.
//!
//! Per-instance serialization: dispatch sets `in_flight` and bumps
//! `op_seq` while holding the instance lock. A spawned command only applies
//! its result if `op_seq` is unchanged, and stops retrying as soon as it is
//! not.

mod quota;
mod transitions;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_id::{NodeId, OwnerId, ServerId};
use kiln_protocol::{ContainerRef, ContainerSpec, ContainerState, ContainerStatus, Resources, StopRequest};
use kiln_reconcile::BackoffPolicy;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

pub use quota::{OwnerUsage, QuotaPolicy, ServerCountQuota};
pub use transitions::Operation;

use crate::agent::{AgentClient, AgentError, AgentResult, AgentTarget};
use crate::catalog::GameCatalog;
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::registry::{
    DesiredState, NodeStatus, Registry, ServerHandle, ServerInstance, ServerStatus,
};

const MAX_NAME_LEN: usize = 64;

/// Extra wait past the stop grace period before delete gives up on the
/// agent's answer. The agent kills the container once the grace runs out.
const STOP_REPLY_MARGIN: Duration = Duration::from_secs(5);

/// Knobs for command dispatch.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Upper bound on a single agent call.
    pub command_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// How long delete waits for the graceful stop before removing.
    pub delete_stop_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            delete_stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Body of a create call.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServer {
    pub name: String,
    pub plan: Resources,
    pub game_type: String,
    #[serde(default)]
    pub auto_start: bool,
}

/// Drift fix issued by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Start,
    Stop,
}

#[derive(Debug)]
enum AgentCall {
    Create(ContainerSpec),
    Start(ContainerRef),
    Stop(ContainerRef, StopRequest),
    Remove(ContainerRef),
}

impl AgentCall {
    fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Start(_) => "start",
            Self::Stop(..) => "stop",
            Self::Remove(_) => "remove",
        }
    }
}

#[derive(Debug)]
enum CommandFailure {
    /// A newer command owns the instance now.
    Superseded,
    Failed(String),
}

struct Inner {
    registry: Arc<Registry>,
    agents: Arc<dyn AgentClient>,
    catalog: GameCatalog,
    quota: Arc<dyn QuotaPolicy>,
    settings: OrchestratorSettings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        agents: Arc<dyn AgentClient>,
        catalog: GameCatalog,
        quota: Arc<dyn QuotaPolicy>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                agents,
                catalog,
                quota,
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn agents(&self) -> &Arc<dyn AgentClient> {
        &self.inner.agents
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, owner: &OwnerId, id: &ServerId) -> ControlPlaneResult<ServerInstance> {
        let handle = self.owned_handle(owner, id).await?;
        let server = handle.lock().await;
        Ok(server.clone())
    }

    pub async fn list(&self, owner: &OwnerId) -> Vec<ServerInstance> {
        self.inner.registry.servers_for_owner(owner).await
    }

    async fn owned_handle(&self, owner: &OwnerId, id: &ServerId) -> ControlPlaneResult<ServerHandle> {
        let handle = self
            .inner
            .registry
            .server(id)
            .await
            .ok_or_else(|| ControlPlaneError::server_not_found(id))?;
        if &handle.lock().await.owner != owner {
            return Err(ControlPlaneError::Forbidden(format!(
                "server {id} belongs to another owner"
            )));
        }
        Ok(handle)
    }

    async fn target_for(&self, node_id: &NodeId) -> ControlPlaneResult<AgentTarget> {
        let node = self
            .inner
            .registry
            .node(node_id)
            .await
            .ok_or_else(|| ControlPlaneError::node_not_found(node_id))?;
        Ok(AgentTarget {
            node_id: node.id,
            address: node.address,
        })
    }

    // =========================================================================
    // Lifecycle calls
    // =========================================================================

    /// Validate, place and record a new server, then create its container in
    /// the background.
    pub async fn create(
        &self,
        owner: OwnerId,
        request: CreateServer,
    ) -> ControlPlaneResult<ServerInstance> {
        let name = request.name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ControlPlaneError::Validation(format!(
                "name must be 1 to {MAX_NAME_LEN} characters"
            )));
        }
        if request.plan.cpu == 0 || request.plan.ram_mb == 0 {
            return Err(ControlPlaneError::Validation(
                "plan must request non-zero cpu and ram_mb".into(),
            ));
        }
        let game = self.inner.catalog.resolve(&request.game_type)?.clone();

        let owned = self.inner.registry.servers_for_owner(&owner).await;
        let usage = OwnerUsage {
            servers: owned.len(),
            committed: owned
                .iter()
                .fold(Resources::ZERO, |acc, s| acc.saturating_add(&s.plan)),
        };
        self.inner.quota.check(&owner, &usage, &request.plan)?;

        let placement = self.inner.registry.reserve(&request.plan).await?;

        let mut server = ServerInstance::new(
            ServerId::new(),
            owner,
            name.to_string(),
            request.game_type.trim().to_ascii_lowercase(),
            request.plan,
            Utc::now(),
        );
        server.node_id = Some(placement.node_id);
        server.port = Some(placement.host_port);
        server.desired = if request.auto_start {
            DesiredState::Running
        } else {
            DesiredState::Stopped
        };
        server.in_flight = true;
        server.op_seq = 1;
        let snapshot = server.clone();

        let handle = self.inner.registry.insert_server(server).await;

        info!(
            server_id = %snapshot.id,
            owner = %snapshot.owner,
            node_id = %placement.node_id,
            host_port = placement.host_port,
            game_type = %snapshot.game_type,
            "Server placed, dispatching create"
        );

        let spec = ContainerSpec {
            server_id: snapshot.id,
            image: game.image,
            resources: request.plan,
            host_port: placement.host_port,
            container_port: game.container_port,
            env: BTreeMap::new(),
        };
        let target = AgentTarget {
            node_id: placement.node_id,
            address: placement.address,
        };
        let this = self.clone();
        let auto_start = request.auto_start;
        tokio::spawn(async move {
            this.run_create(handle, snapshot.op_seq, target, spec, auto_start)
                .await;
        });

        Ok(snapshot)
    }

    pub async fn start(&self, owner: &OwnerId, id: &ServerId) -> ControlPlaneResult<ServerInstance> {
        self.dispatch(owner, id, Operation::Start).await
    }

    pub async fn stop(&self, owner: &OwnerId, id: &ServerId) -> ControlPlaneResult<ServerInstance> {
        self.dispatch(owner, id, Operation::Stop).await
    }

    pub async fn restart(
        &self,
        owner: &OwnerId,
        id: &ServerId,
    ) -> ControlPlaneResult<ServerInstance> {
        self.dispatch(owner, id, Operation::Restart).await
    }

    /// Stop (bounded), force-remove and purge. The instance leaves the
    /// registry even if its node never answers.
    pub async fn delete(&self, owner: &OwnerId, id: &ServerId) -> ControlPlaneResult<ServerInstance> {
        self.dispatch(owner, id, Operation::Delete).await
    }

    async fn dispatch(
        &self,
        owner: &OwnerId,
        id: &ServerId,
        op: Operation,
    ) -> ControlPlaneResult<ServerInstance> {
        let handle = self.owned_handle(owner, id).await?;
        let mut server = handle.lock().await;
        transitions::check(&server, op)?;

        let invalid = |server: &ServerInstance| ControlPlaneError::InvalidTransition {
            server_id: server.id,
            from: server.status,
            operation: op.as_str(),
        };
        let node_id = server.node_id.ok_or_else(|| invalid(&server))?;
        let container = server.container_ref.clone();
        if op != Operation::Delete && container.is_none() {
            return Err(invalid(&server));
        }
        let target = self.target_for(&node_id).await?;

        let was_running = server.status == ServerStatus::Running;
        server.transition(op.transitional_state());
        match op {
            Operation::Start | Operation::Restart => server.desired = DesiredState::Running,
            Operation::Stop => server.desired = DesiredState::Stopped,
            Operation::Delete => {}
        }
        server.in_flight = true;
        server.op_seq += 1;
        let seq = server.op_seq;
        let snapshot = server.clone();
        drop(server);

        info!(
            server_id = %id,
            node_id = %node_id,
            operation = op.as_str(),
            "Dispatching lifecycle command"
        );

        let this = self.clone();
        tokio::spawn(async move {
            match (op, container) {
                (Operation::Start, Some(c)) => this.run_start(&handle, seq, &target, c).await,
                (Operation::Stop, Some(c)) => this.run_stop(&handle, seq, &target, c).await,
                (Operation::Restart, Some(c)) => this.run_restart(&handle, seq, &target, c).await,
                (Operation::Delete, c) => this.run_delete(&handle, seq, &target, c, was_running).await,
                (_, None) => {}
            }
        });

        Ok(snapshot)
    }

    /// Issue a drift fix for an instance the caller holds locked.
    ///
    /// The status is left alone: the instance already shows the state the
    /// fix restores.
    pub(crate) fn correct(
        &self,
        handle: ServerHandle,
        server: &mut ServerInstance,
        target: AgentTarget,
        correction: Correction,
    ) {
        let Some(container) = server.container_ref.clone() else {
            return;
        };
        server.in_flight = true;
        server.op_seq += 1;
        let seq = server.op_seq;
        let server_id = server.id;

        info!(server_id = %server_id, correction = ?correction, "Correcting drift");

        let this = self.clone();
        tokio::spawn(async move {
            let call = match correction {
                Correction::Start => AgentCall::Start(container),
                Correction::Stop => AgentCall::Stop(container, StopRequest::default()),
            };
            let op = call.name();
            match this.call_with_retry(&handle, seq, &target, call).await {
                Ok(_) => {
                    this.settle(&handle, seq, |s| s.in_flight = false).await;
                }
                Err(failure) => this.settle_failure(&handle, seq, op, failure).await,
            }
        });
    }

    // =========================================================================
    // Command tasks
    // =========================================================================

    async fn run_create(
        &self,
        handle: ServerHandle,
        seq: u64,
        target: AgentTarget,
        spec: ContainerSpec,
        auto_start: bool,
    ) {
        let server_id = spec.server_id;
        let status = match self
            .call_with_retry(&handle, seq, &target, AgentCall::Create(spec))
            .await
        {
            Ok(status) => status,
            Err(failure) => return self.settle_failure(&handle, seq, "create", failure).await,
        };

        let container = status.container_ref;
        let applied = self
            .settle(&handle, seq, |s| {
                s.container_ref = Some(container.clone());
                if auto_start {
                    s.transition(ServerStatus::Starting);
                } else {
                    s.transition(ServerStatus::Stopped);
                    s.in_flight = false;
                }
            })
            .await;
        info!(server_id = %server_id, container = %container, "Container created");

        if applied && auto_start {
            self.run_start(&handle, seq, &target, container).await;
        }
    }

    async fn run_start(
        &self,
        handle: &ServerHandle,
        seq: u64,
        target: &AgentTarget,
        container: ContainerRef,
    ) {
        match self
            .call_with_retry(handle, seq, target, AgentCall::Start(container))
            .await
        {
            Ok(_) => {
                self.settle(handle, seq, |s| {
                    s.transition(ServerStatus::Running);
                    s.in_flight = false;
                })
                .await;
            }
            Err(failure) => self.settle_failure(handle, seq, "start", failure).await,
        }
    }

    async fn run_stop(
        &self,
        handle: &ServerHandle,
        seq: u64,
        target: &AgentTarget,
        container: ContainerRef,
    ) {
        let call = AgentCall::Stop(container, StopRequest::default());
        match self.call_with_retry(handle, seq, target, call).await {
            Ok(_) => {
                self.settle(handle, seq, |s| {
                    s.transition(ServerStatus::Stopped);
                    s.in_flight = false;
                })
                .await;
            }
            Err(failure) => self.settle_failure(handle, seq, "stop", failure).await,
        }
    }

    async fn run_restart(
        &self,
        handle: &ServerHandle,
        seq: u64,
        target: &AgentTarget,
        container: ContainerRef,
    ) {
        let call = AgentCall::Stop(container.clone(), StopRequest::default());
        if let Err(failure) = self.call_with_retry(handle, seq, target, call).await {
            return self.settle_failure(handle, seq, "restart", failure).await;
        }
        let applied = self
            .settle(handle, seq, |s| {
                s.transition(ServerStatus::Stopped);
                s.transition(ServerStatus::Starting);
            })
            .await;
        if applied {
            self.run_start(handle, seq, target, container).await;
        }
    }

    async fn run_delete(
        &self,
        handle: &ServerHandle,
        seq: u64,
        target: &AgentTarget,
        container: Option<ContainerRef>,
        was_running: bool,
    ) {
        let server_id = handle.lock().await.id;
        let mut confirmed = container.is_none();

        if let Some(container) = container {
            let node_offline = self
                .inner
                .registry
                .node(&target.node_id)
                .await
                .is_none_or(|n| n.status == NodeStatus::Offline);

            if node_offline {
                warn!(
                    server_id = %server_id,
                    node_id = %target.node_id,
                    "Node offline, skipping agent teardown"
                );
            } else {
                if was_running {
                    let grace = self.inner.settings.delete_stop_timeout;
                    let stop = AgentCall::Stop(
                        container.clone(),
                        StopRequest {
                            timeout_secs: grace.as_secs(),
                        },
                    );
                    let wait = grace + STOP_REPLY_MARGIN;
                    match tokio::time::timeout(wait, self.call_once(target, &stop)).await {
                        Ok(Ok(_)) => debug!(server_id = %server_id, "Stopped before delete"),
                        Ok(Err(e)) => debug!(server_id = %server_id, error = %e, "Stop before delete failed"),
                        Err(_) => debug!(server_id = %server_id, "Stop before delete timed out"),
                    }
                }

                match self
                    .call_with_retry(handle, seq, target, AgentCall::Remove(container))
                    .await
                {
                    Ok(_) => confirmed = true,
                    Err(failure) => warn!(
                        server_id = %server_id,
                        node_id = %target.node_id,
                        failure = ?failure,
                        "Force remove failed, purging without agent confirmation"
                    ),
                }
            }
        }

        self.inner.registry.purge_server(&server_id).await;
        info!(server_id = %server_id, confirmed, "Server deleted");
    }

    // =========================================================================
    // Agent calls
    // =========================================================================

    async fn call_once(&self, target: &AgentTarget, call: &AgentCall) -> AgentResult<ContainerStatus> {
        let agents = &self.inner.agents;
        let request = async {
            match call {
                AgentCall::Create(spec) => agents.create(target, spec).await,
                AgentCall::Start(c) => agents.start(target, c).await,
                AgentCall::Stop(c, req) => agents.stop(target, c, *req).await,
                AgentCall::Remove(c) => agents.remove(target, c).await.map(|()| ContainerStatus {
                    container_ref: c.clone(),
                    state: ContainerState::Missing,
                }),
            }
        };
        let timeout = self.inner.settings.command_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::Unreachable(format!(
                    "no answer within {}s",
                    timeout.as_secs()
                )))
            })
    }

    /// Run `call`, retrying transient failures with exponential backoff.
    async fn call_with_retry(
        &self,
        handle: &ServerHandle,
        seq: u64,
        target: &AgentTarget,
        call: AgentCall,
    ) -> Result<ContainerStatus, CommandFailure> {
        let backoff = &self.inner.settings.backoff;
        let mut retry = 0;
        loop {
            let err = match self.call_once(target, &call).await {
                Ok(status) => return Ok(status),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(CommandFailure::Failed(err.to_string()));
            }

            retry += 1;
            let Some(delay) = backoff.delay_for(retry) else {
                return Err(CommandFailure::Failed(format!(
                    "{err} (gave up after {retry} attempts)"
                )));
            };
            warn!(
                node_id = %target.node_id,
                command = call.name(),
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Agent command failed, retrying"
            );
            tokio::time::sleep(delay).await;

            if handle.lock().await.op_seq != seq {
                return Err(CommandFailure::Superseded);
            }
        }
    }

    /// Apply `f` if no newer command took over. Returns whether it applied.
    async fn settle(
        &self,
        handle: &ServerHandle,
        seq: u64,
        f: impl FnOnce(&mut ServerInstance),
    ) -> bool {
        let mut server = handle.lock().await;
        if server.op_seq != seq {
            debug!(server_id = %server.id, "Dropping result of superseded command");
            return false;
        }
        f(&mut server);
        true
    }

    async fn settle_failure(
        &self,
        handle: &ServerHandle,
        seq: u64,
        op: &'static str,
        failure: CommandFailure,
    ) {
        match failure {
            CommandFailure::Superseded => {}
            CommandFailure::Failed(message) => {
                self.settle(handle, seq, |s| {
                    error!(server_id = %s.id, operation = op, error = %message, "Lifecycle command failed");
                    s.fail(format!("{op} failed: {message}"));
                })
                .await;
            }
        }
    }
}
