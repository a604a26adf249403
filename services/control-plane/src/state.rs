//! Application state shared across request handlers.

use std::sync::Arc;

use crate::console::ConsoleProxy;
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::telemetry::TelemetryBroadcaster;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Orchestrator,
    telemetry: Arc<TelemetryBroadcaster>,
    console: Arc<ConsoleProxy>,
}

impl AppState {
    pub fn new(
        orchestrator: Orchestrator,
        telemetry: Arc<TelemetryBroadcaster>,
        console: Arc<ConsoleProxy>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                telemetry,
                console,
            }),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.inner.orchestrator.registry()
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBroadcaster> {
        &self.inner.telemetry
    }

    pub fn console(&self) -> &Arc<ConsoleProxy> {
        &self.inner.console
    }
}
