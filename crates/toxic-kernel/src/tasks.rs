//! Background task registry.
//!
//! Each connection epoch owns one [`TaskRegistry`]. Every periodic job the
//! epoch starts is registered here, and [`TaskRegistry::teardown`] aborts
//! all of them at once so nothing leaks into the next epoch. Dropping the
//! registry has the same effect.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How a periodic job is first scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    /// Run once immediately, then every period.
    Immediate,
    /// Wait one full period before the first run.
    AfterPeriod,
}

struct RegisteredTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Tracks the tokio tasks belonging to one epoch.
pub struct TaskRegistry {
    epoch: u64,
    tasks: Vec<RegisteredTask>,
}

impl TaskRegistry {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            tasks: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Take ownership of an already spawned task.
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(epoch = self.epoch, task = %name, "task registered");
        self.tasks.push(RegisteredTask { name, handle });
    }

    /// Spawn `job` on a fixed period and register it.
    ///
    /// Runs of a slow job never overlap; missed ticks are skipped. A zero
    /// period is refused and nothing is spawned; the return value says
    /// whether the job was registered.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        first: FirstTick,
        mut job: F,
    ) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if period.is_zero() {
            warn!(epoch = self.epoch, task = %name, "periodic task has a zero period, not started");
            return false;
        }
        let start = match first {
            FirstTick::Immediate => tokio::time::Instant::now(),
            FirstTick::AfterPeriod => tokio::time::Instant::now() + period,
        };
        let task_name = name.clone();
        let epoch = self.epoch;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                debug!(epoch, task = %task_name, "periodic task tick");
                job().await;
            }
        });
        self.register(name, handle);
        true
    }

    /// Number of tasks currently registered.
    pub fn live(&self) -> usize {
        self.tasks.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    /// Abort every registered task and forget them.
    pub fn teardown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let count = self.tasks.len();
        for task in self.tasks.drain(..) {
            task.handle.abort();
            debug!(epoch = self.epoch, task = %task.name, "task aborted");
        }
        info!(epoch = self.epoch, count, "epoch tasks torn down");
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("epoch", &self.epoch)
            .field("tasks", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
