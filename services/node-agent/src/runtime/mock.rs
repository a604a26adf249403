//! In-memory runtime for development and tests.
//!
//! Containers are entries in a map. Attaching to a running container gives
//! an echo console: every input line comes back as `[mock] <line>`, and the
//! line `stop` exits the container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kiln_protocol::{ContainerRef, ContainerSpec, ContainerState, ContainerStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{validate_ref, ConsoleStreams, ContainerRuntime, RuntimeError, RuntimeResult};

const CONSOLE_PIPE_CAPACITY: usize = 64 * 1024;

struct MockContainer {
    state: ContainerState,
    /// Open consoles; fired when the container stops.
    consoles: Vec<oneshot::Sender<()>>,
}

impl MockContainer {
    fn halt(&mut self) {
        self.state = ContainerState::Exited;
        for console in self.consoles.drain(..) {
            let _ = console.send(());
        }
    }
}

type Containers = Arc<Mutex<HashMap<ContainerRef, MockContainer>>>;

fn lock(containers: &Containers) -> MutexGuard<'_, HashMap<ContainerRef, MockContainer>> {
    containers.lock().unwrap_or_else(|p| p.into_inner())
}

/// Mock runtime for testing and development.
#[derive(Default)]
pub struct MockRuntime {
    containers: Containers,
    /// Whether every command should fail.
    failing: AtomicBool,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command fail as a runtime error until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Overwrite a container's state, e.g. to simulate a crash.
    pub fn force_state(&self, container: &ContainerRef, state: ContainerState) {
        let mut containers = lock(&self.containers);
        if state == ContainerState::Missing {
            if let Some(mut gone) = containers.remove(container) {
                gone.halt();
            }
            return;
        }
        if let Some(c) = containers.get_mut(container) {
            if state == ContainerState::Running {
                c.state = state;
            } else {
                c.halt();
                c.state = state;
            }
        }
    }

    pub fn container_count(&self) -> usize {
        lock(&self.containers).len()
    }

    fn check_failing(&self) -> RuntimeResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("mock runtime configured to fail".into()));
        }
        Ok(())
    }

    fn transition(
        &self,
        container: &ContainerRef,
        apply: impl FnOnce(&mut MockContainer),
    ) -> RuntimeResult<ContainerStatus> {
        validate_ref(container)?;
        self.check_failing()?;
        let mut containers = lock(&self.containers);
        let c = containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::NotFound(container.clone()))?;
        apply(c);
        Ok(ContainerStatus {
            container_ref: container.clone(),
            state: c.state,
        })
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerStatus> {
        self.check_failing()?;
        let container = ContainerRef::new(spec.container_name());
        validate_ref(&container)?;

        let mut containers = lock(&self.containers);
        let entry = containers.entry(container.clone()).or_insert_with(|| {
            info!(container = %container, image = %spec.image, "[MOCK] Creating container");
            MockContainer {
                state: ContainerState::Created,
                consoles: Vec::new(),
            }
        });
        Ok(ContainerStatus {
            container_ref: container,
            state: entry.state,
        })
    }

    async fn start(&self, container: &ContainerRef) -> RuntimeResult<ContainerStatus> {
        debug!(container = %container, "[MOCK] Starting container");
        self.transition(container, |c| c.state = ContainerState::Running)
    }

    async fn stop(
        &self,
        container: &ContainerRef,
        _grace: Duration,
    ) -> RuntimeResult<ContainerStatus> {
        debug!(container = %container, "[MOCK] Stopping container");
        self.transition(container, |c| {
            if c.state == ContainerState::Running {
                c.halt();
            }
        })
    }

    async fn remove(&self, container: &ContainerRef) -> RuntimeResult<()> {
        validate_ref(container)?;
        self.check_failing()?;
        if let Some(mut gone) = lock(&self.containers).remove(container) {
            gone.halt();
            debug!(container = %container, "[MOCK] Removed container");
        }
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerState> {
        validate_ref(container)?;
        self.check_failing()?;
        Ok(lock(&self.containers)
            .get(container)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn attach(&self, container: &ContainerRef) -> RuntimeResult<ConsoleStreams> {
        validate_ref(container)?;
        self.check_failing()?;

        let stopped = {
            let mut containers = lock(&self.containers);
            let c = containers
                .get_mut(container)
                .ok_or_else(|| RuntimeError::NotFound(container.clone()))?;
            if c.state != ContainerState::Running {
                return Err(RuntimeError::NotRunning(container.clone()));
            }
            let (tx, rx) = oneshot::channel();
            c.consoles.push(tx);
            rx
        };

        let (session, game) = tokio::io::duplex(CONSOLE_PIPE_CAPACITY);
        tokio::spawn(run_echo_console(
            game,
            stopped,
            Arc::clone(&self.containers),
            container.clone(),
        ));

        let (stdout, stdin) = tokio::io::split(session);
        Ok(ConsoleStreams::new(Box::new(stdout), None, Box::new(stdin)))
    }
}

async fn run_echo_console(
    game: DuplexStream,
    mut stopped: oneshot::Receiver<()>,
    containers: Containers,
    container: ContainerRef,
) {
    let (reader, mut writer) = tokio::io::split(game);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let reply = format!("[mock] {line}\n");
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
                if line.trim() == "stop" {
                    if let Some(c) = lock(&containers).get_mut(&container) {
                        c.halt();
                    }
                    break;
                }
            }
        }
    }
    debug!(container = %container, "[MOCK] Console closed");
}
