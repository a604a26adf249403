//! kiln control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod agent;
pub mod api;
pub mod catalog;
pub mod config;
pub mod console;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;
