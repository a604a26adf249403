//! Console attach stream framing.
//!
//! The control plane talks to an agent's console gateway over TCP using
//! length-prefixed frames: a big-endian `u32` length followed by that many
//! bytes, the first of which is the frame type.
//!
//! A session opens with an [`frame_type::INIT`] frame carrying a JSON
//! [`ConsoleInit`]. The agent answers with `READY` once it is attached, or
//! with `EXIT` if it could not attach. After `READY` the agent sends
//! `STDOUT`/`STDERR` frames and the control plane sends `STDIN` frames. The agent ends a session with an
//! `EXIT` frame when the container's output closes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::container::ContainerRef;

pub mod frame_type {
    pub const STDIN: u8 = 0x01;
    pub const STDOUT: u8 = 0x02;
    pub const STDERR: u8 = 0x03;
    pub const READY: u8 = 0x10;
    pub const EXIT: u8 = 0x11;
    pub const INIT: u8 = 0x20;
}

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Largest payload that fits in one frame after the type byte.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("empty frame")]
    Empty,

    #[error("invalid init payload: {0}")]
    InvalidInit(#[from] serde_json::Error),
}

/// First frame of every console session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInit {
    pub container_ref: ContainerRef,
}

/// Reason sent with an exit frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleExit {
    pub reason: String,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn init(init: &ConsoleInit) -> Result<Self, FrameError> {
        Ok(Self::new(frame_type::INIT, serde_json::to_vec(init)?))
    }

    pub fn exit(reason: &str) -> Result<Self, FrameError> {
        let body = ConsoleExit {
            reason: reason.to_string(),
        };
        Ok(Self::new(frame_type::EXIT, serde_json::to_vec(&body)?))
    }

    pub fn ready() -> Self {
        Self::new(frame_type::READY, Bytes::new())
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, frame_type::STDOUT | frame_type::STDERR)
    }
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let len = 1 + frame.payload.len();
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    stream.write_all(&(len as u32).to_be_bytes()).await?;
    stream.write_all(&[frame.kind]).await?;
    stream.write_all(&frame.payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let kind = buf[0];
    let payload = Bytes::from(buf).slice(1..);
    Ok(Some(Frame { kind, payload }))
}

/// Parse the payload of an init frame.
pub fn parse_init(frame: &Frame) -> Result<ConsoleInit, FrameError> {
    Ok(serde_json::from_slice(&frame.payload)?)
}

/// Parse the payload of an exit frame.
pub fn parse_exit(frame: &Frame) -> Result<ConsoleExit, FrameError> {
    Ok(serde_json::from_slice(&frame.payload)?)
}
