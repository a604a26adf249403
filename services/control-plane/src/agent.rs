//! Client side of the node agent command API.
//!
//! The orchestrator and reconciler talk to agents only through
//! [`AgentClient`], so tests can swap in a scripted agent.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use kiln_id::NodeId;
use kiln_protocol::{AgentHealth, ContainerRef, ContainerSpec, ContainerStatus, StopRequest};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Which agent a command goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTarget {
    pub node_id: NodeId,
    pub address: SocketAddr,
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport failure, timeout or agent-side 5xx. Worth retrying.
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The agent understood the command and refused it.
    #[error("agent rejected command ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Idempotent container lifecycle commands against one node.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create(&self, target: &AgentTarget, spec: &ContainerSpec)
        -> AgentResult<ContainerStatus>;

    async fn start(&self, target: &AgentTarget, container: &ContainerRef)
        -> AgentResult<ContainerStatus>;

    async fn stop(
        &self,
        target: &AgentTarget,
        container: &ContainerRef,
        request: StopRequest,
    ) -> AgentResult<ContainerStatus>;

    async fn remove(&self, target: &AgentTarget, container: &ContainerRef) -> AgentResult<()>;

    async fn inspect(&self, target: &AgentTarget, container: &ContainerRef)
        -> AgentResult<ContainerStatus>;

    async fn health(&self, target: &AgentTarget) -> AgentResult<AgentHealth>;
}

/// JSON over HTTP agent client.
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self { client })
    }

    fn url(target: &AgentTarget, path: &str) -> String {
        format!("http://{}{}", target.address, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AgentResult<T> {
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| AgentError::Unreachable(format!("malformed agent response: {e}")))
    }
}

async fn check_status(response: reqwest::Response) -> AgentResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(AgentError::Unreachable(format!("{status}: {body}")))
    } else {
        Err(AgentError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn create(
        &self,
        target: &AgentTarget,
        spec: &ContainerSpec,
    ) -> AgentResult<ContainerStatus> {
        debug!(node_id = %target.node_id, server_id = %spec.server_id, "Sending create");
        let response = self
            .client
            .post(Self::url(target, "/containers"))
            .json(spec)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn start(
        &self,
        target: &AgentTarget,
        container: &ContainerRef,
    ) -> AgentResult<ContainerStatus> {
        debug!(node_id = %target.node_id, container = %container, "Sending start");
        let path = format!("/containers/{container}/start");
        let response = self.client.post(Self::url(target, &path)).send().await?;
        Self::decode(response).await
    }

    async fn stop(
        &self,
        target: &AgentTarget,
        container: &ContainerRef,
        request: StopRequest,
    ) -> AgentResult<ContainerStatus> {
        debug!(node_id = %target.node_id, container = %container, "Sending stop");
        let path = format!("/containers/{container}/stop");
        let response = self
            .client
            .post(Self::url(target, &path))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn remove(&self, target: &AgentTarget, container: &ContainerRef) -> AgentResult<()> {
        debug!(node_id = %target.node_id, container = %container, "Sending remove");
        let path = format!("/containers/{container}");
        let response = self.client.delete(Self::url(target, &path)).send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn inspect(
        &self,
        target: &AgentTarget,
        container: &ContainerRef,
    ) -> AgentResult<ContainerStatus> {
        let path = format!("/containers/{container}");
        let response = self.client.get(Self::url(target, &path)).send().await?;
        Self::decode(response).await
    }

    async fn health(&self, target: &AgentTarget) -> AgentResult<AgentHealth> {
        let response = self.client.get(Self::url(target, "/health")).send().await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_transient() {
        assert!(AgentError::Unreachable("refused".into()).is_transient());
        assert!(!AgentError::Rejected {
            status: 400,
            message: "bad image".into()
        }
        .is_transient());
    }

    #[test]
    fn test_url_uses_agent_address() {
        let target = AgentTarget {
            node_id: NodeId::new(),
            address: "10.1.2.3:5001".parse().unwrap(),
        };
        assert_eq!(
            HttpAgentClient::url(&target, "/containers/abc/start"),
            "http://10.1.2.3:5001/containers/abc/start"
        );
    }
}
