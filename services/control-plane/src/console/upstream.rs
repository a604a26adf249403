//! Opening the node-side attach stream.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use kiln_id::NodeId;
use kiln_protocol::console::{frame_type, parse_exit, read_frame, write_frame, ConsoleInit, Frame};
use kiln_protocol::ContainerRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Which container's console to attach to, and where its agent listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTarget {
    pub node_id: NodeId,
    pub console_addr: SocketAddr,
    pub container_ref: ContainerRef,
}

/// Both halves of an attach stream, already past the handshake: the agent
/// has confirmed the attach.
pub struct Upstream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

#[async_trait]
pub trait ConsoleConnector: Send + Sync {
    async fn open(&self, target: &ConsoleTarget) -> anyhow::Result<Upstream>;
}

/// Connects to an agent's console gateway over TCP.
pub struct TcpConsoleConnector {
    connect_timeout: Duration,
}

impl TcpConsoleConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ConsoleConnector for TcpConsoleConnector {
    async fn open(&self, target: &ConsoleTarget) -> anyhow::Result<Upstream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(target.console_addr),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect to {} timed out", target.console_addr))??;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let init = Frame::init(&ConsoleInit {
            container_ref: target.container_ref.clone(),
        })?;
        write_frame(&mut writer, &init).await?;

        let reply = tokio::time::timeout(self.connect_timeout, read_frame(&mut reader))
            .await
            .map_err(|_| anyhow::anyhow!("agent at {} did not confirm attach", target.console_addr))??;
        match reply {
            Some(frame) if frame.kind == frame_type::READY => {}
            Some(frame) if frame.kind == frame_type::EXIT => {
                let reason = parse_exit(&frame)
                    .map(|exit| exit.reason)
                    .unwrap_or_else(|_| "unknown".to_string());
                anyhow::bail!("agent refused attach: {reason}");
            }
            Some(frame) => anyhow::bail!("unexpected console frame 0x{:02x} during attach", frame.kind),
            None => anyhow::bail!("agent closed the console before attaching"),
        }

        debug!(
            node_id = %target.node_id,
            addr = %target.console_addr,
            container = %target.container_ref,
            "Console upstream opened"
        );

        Ok(Upstream {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}
