//! In-process agent double for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiln_protocol::{
    AgentHealth, ContainerRef, ContainerSpec, ContainerState, ContainerStatus, StopRequest,
};

use crate::agent::{AgentClient, AgentError, AgentResult, AgentTarget};

/// Keeps containers in a map and records every command it receives.
#[derive(Default)]
pub struct FakeAgent {
    containers: Mutex<HashMap<ContainerRef, ContainerState>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<AgentError>>,
    down: Mutex<bool>,
    stop_delay: Mutex<Option<Duration>>,
    stop_timeouts: Mutex<Vec<u64>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next command with `err`.
    pub fn fail_next(&self, err: AgentError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Make every command fail as unreachable until switched back.
    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    /// Make every stop take `delay` before it answers.
    pub fn delay_stops(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    /// Grace periods carried by the stop commands received so far.
    pub fn stop_timeouts(&self) -> Vec<u64> {
        self.stop_timeouts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn state_of(&self, container: &ContainerRef) -> ContainerState {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .copied()
            .unwrap_or(ContainerState::Missing)
    }

    /// Change a container behind the control plane's back.
    pub fn force_state(&self, container: &ContainerRef, state: ContainerState) {
        let mut containers = self.containers.lock().unwrap();
        if state == ContainerState::Missing {
            containers.remove(container);
        } else {
            containers.insert(container.clone(), state);
        }
    }

    fn enter(&self, call: String) -> AgentResult<()> {
        self.calls.lock().unwrap().push(call);
        if *self.down.lock().unwrap() {
            return Err(AgentError::Unreachable("connection refused".into()));
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set(&self, container: &ContainerRef, state: ContainerState) -> ContainerStatus {
        self.containers
            .lock()
            .unwrap()
            .insert(container.clone(), state);
        ContainerStatus {
            container_ref: container.clone(),
            state,
        }
    }

    fn require(&self, container: &ContainerRef) -> AgentResult<()> {
        if self.state_of(container) == ContainerState::Missing {
            return Err(AgentError::Rejected {
                status: 404,
                message: format!("no container {container}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn create(
        &self,
        _target: &AgentTarget,
        spec: &ContainerSpec,
    ) -> AgentResult<ContainerStatus> {
        self.enter(format!("create {}", spec.server_id))?;
        let container = ContainerRef::new(spec.container_name());
        let state = match self.state_of(&container) {
            ContainerState::Missing => ContainerState::Created,
            existing => existing,
        };
        Ok(self.set(&container, state))
    }

    async fn start(
        &self,
        _target: &AgentTarget,
        container: &ContainerRef,
    ) -> AgentResult<ContainerStatus> {
        self.enter(format!("start {container}"))?;
        self.require(container)?;
        Ok(self.set(container, ContainerState::Running))
    }

    async fn stop(
        &self,
        _target: &AgentTarget,
        container: &ContainerRef,
        request: StopRequest,
    ) -> AgentResult<ContainerStatus> {
        self.enter(format!("stop {container}"))?;
        self.stop_timeouts.lock().unwrap().push(request.timeout_secs);
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.require(container)?;
        Ok(self.set(container, ContainerState::Exited))
    }

    async fn remove(&self, _target: &AgentTarget, container: &ContainerRef) -> AgentResult<()> {
        self.enter(format!("remove {container}"))?;
        self.containers.lock().unwrap().remove(container);
        Ok(())
    }

    async fn inspect(
        &self,
        _target: &AgentTarget,
        container: &ContainerRef,
    ) -> AgentResult<ContainerStatus> {
        self.enter(format!("inspect {container}"))?;
        Ok(ContainerStatus {
            container_ref: container.clone(),
            state: self.state_of(container),
        })
    }

    async fn health(&self, target: &AgentTarget) -> AgentResult<AgentHealth> {
        self.enter("health".into())?;
        Ok(AgentHealth {
            status: "ok".into(),
            node: target.node_id.to_string(),
            time: Utc::now(),
        })
    }
}
