//! Container runtime interface.
//!
//! The agent executes lifecycle commands through a [`ContainerRuntime`].
//! Every operation is idempotent: creating a server that already has a
//! container returns that container, starting a running container and
//! stopping a stopped one succeed without side effects, and removing a
//! missing container is not an error.
//!
//! - `docker`: drives the `docker` CLI
//! - `mock`: in-memory containers with an echo console, for development and tests

mod docker;
mod mock;

use std::time::Duration;

use async_trait::async_trait;
use kiln_protocol::{ContainerRef, ContainerSpec, ContainerState, ContainerStatus};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(ContainerRef),

    #[error("container {0} is not running")]
    NotRunning(ContainerRef),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The runtime itself failed. Worth retrying.
    #[error("runtime failure: {0}")]
    Failed(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A live attachment to a container's stdio.
pub struct ConsoleStreams {
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub stdin: BoxedWriter,
    /// Attach helper process, killed when the session is dropped.
    pub(crate) process: Option<Child>,
}

impl ConsoleStreams {
    pub fn new(stdout: BoxedReader, stderr: Option<BoxedReader>, stdin: BoxedWriter) -> Self {
        Self {
            stdout,
            stderr,
            stdin,
            process: None,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerStatus>;

    async fn start(&self, container: &ContainerRef) -> RuntimeResult<ContainerStatus>;

    async fn stop(&self, container: &ContainerRef, grace: Duration)
        -> RuntimeResult<ContainerStatus>;

    async fn remove(&self, container: &ContainerRef) -> RuntimeResult<()>;

    /// Current state, `Missing` when the container does not exist.
    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerState>;

    /// Attach to a running container's console.
    async fn attach(&self, container: &ContainerRef) -> RuntimeResult<ConsoleStreams>;
}

/// Container references become CLI arguments, so only plain names pass.
pub fn validate_ref(container: &ContainerRef) -> RuntimeResult<()> {
    let name = container.as_str();
    let valid = !name.is_empty()
        && name.len() <= 128
        && name.as_bytes()[0].is_ascii_alphanumeric()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::Invalid(format!(
            "invalid container reference '{name}'"
        )))
    }
}
