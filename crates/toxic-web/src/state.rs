//! Shared state passed to every request handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use toxic_kernel::{LifecycleSnapshot, MemorySampler, OrchestratorHandle};

/// State shared across every request handler.
///
/// Snapshots arrive over a `watch` channel, so handlers never contend with
/// the orchestrator loop.
#[derive(Clone)]
pub struct AppState {
    /// Name reported by `/status`.
    pub bot_name: String,
    /// When the process started serving.
    pub started_at: Instant,
    /// Latest orchestrator snapshot.
    pub snapshots: watch::Receiver<LifecycleSnapshot>,
    /// Resident memory source.
    pub memory: Arc<dyn MemorySampler>,
}

impl AppState {
    pub fn new(
        bot_name: impl Into<String>,
        snapshots: watch::Receiver<LifecycleSnapshot>,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            started_at: Instant::now(),
            snapshots,
            memory,
        }
    }

    /// Build state that follows a running orchestrator.
    pub fn from_handle(
        bot_name: impl Into<String>,
        handle: &OrchestratorHandle,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        Self::new(bot_name, handle.subscribe(), memory)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshots.borrow().clone()
    }
}
