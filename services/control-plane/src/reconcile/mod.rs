//! Background loops: drift reconciliation and node liveness.

mod node_monitor;
mod reconciler;
mod worker;

pub use node_monitor::NodeMonitor;
pub use reconciler::{ReconcileStats, ServerReconciler};
pub use worker::ReconcileWorker;
