//! kiln Node Agent Library
//!
//! The node agent runs on each host and executes container lifecycle
//! commands issued by the control plane. It makes no placement decisions.
//!
//! ## Modules
//!
//! - `api`: HTTP command API (create/start/stop/inspect/remove, health)
//! - `console_gateway`: TCP attach streams for server consoles
//! - `runtime`: container runtimes (docker CLI, mock)
//! - `sampler`: periodic host stats push to the control plane

pub mod api;
pub mod client;
pub mod config;
pub mod console_gateway;
pub mod resources;
pub mod runtime;
pub mod sampler;

// Re-export commonly used types
pub use api::{router, AgentState};
pub use client::ControlPlaneClient;
pub use console_gateway::ConsoleGateway;
pub use runtime::{ContainerRuntime, DockerRuntime, MockRuntime};
