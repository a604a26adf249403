//! # kiln-protocol
//!
//! Types exchanged between the control plane and node agents.
//!
//! - [`resources`]: resource quantities used for capacity and plans
//! - [`container`]: container lifecycle commands and their results
//! - [`telemetry`]: stats pushes and the samples fanned out to viewers
//! - [`console`]: the length-prefixed frame codec for console attach streams

pub mod console;
pub mod container;
pub mod resources;
pub mod telemetry;

pub use container::{
    AgentHealth, ContainerRef, ContainerSpec, ContainerState, ContainerStatus, StopRequest,
};
pub use resources::Resources;
pub use telemetry::{NodeStats, StatsPush, TelemetrySample};
