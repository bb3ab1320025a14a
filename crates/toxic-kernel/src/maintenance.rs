//! Periodic jobs registered at the start of every connection epoch.
//!
//! - memory watchdog: trims the transport's message cache when resident
//!   memory is over the ceiling
//! - credential-file janitor: sweeps stale files out of the session
//!   directory
//! - store flush: asks the transport to persist its message store

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::session_files::SessionFiles;
use crate::tasks::{FirstTick, TaskRegistry};
use crate::transport::Transport;

/// Messages kept per chat when the watchdog trims.
pub const KEEP_MESSAGES_PER_CHAT: usize = 50;

/// Timings and limits for the epoch jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub memory_ceiling_mb: u64,
    #[serde(with = "secs")]
    pub memory_check_interval: Duration,
    #[serde(with = "secs")]
    pub janitor_interval: Duration,
    /// Age after which a non-credential session file is deleted.
    #[serde(with = "secs")]
    pub session_retention: Duration,
    #[serde(rename = "store_flush_interval_ms", with = "crate::backoff::millis")]
    pub store_flush_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: 300,
            memory_check_interval: Duration::from_secs(5 * 60),
            janitor_interval: Duration::from_secs(12 * 60 * 60),
            session_retention: Duration::from_secs(24 * 60 * 60),
            store_flush_interval: Duration::from_secs(10 * 60),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Memory sampling
// ---------------------------------------------------------------------------

/// Source of the process's resident memory figure.
pub trait MemorySampler: Send + Sync {
    /// Resident set size in megabytes.
    fn resident_mb(&self) -> u64;
}

/// Samples the current process through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemorySampler for ProcessMemory {
    fn resident_mb(&self) -> u64 {
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        sys.process(pid).map(|p| p.memory() / 1024 / 1024).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Everything the epoch jobs need.
#[derive(Clone)]
pub struct Maintenance {
    pub config: MaintenanceConfig,
    pub transport: Arc<dyn Transport>,
    pub session: SessionFiles,
    pub memory: Arc<dyn MemorySampler>,
}

impl Maintenance {
    /// Spawn the three jobs into `registry`.
    pub fn register(&self, registry: &mut TaskRegistry) {
        self.register_memory_watchdog(registry);
        self.register_janitor(registry);
        self.register_store_flush(registry);
        info!(epoch = registry.epoch(), tasks = registry.live(), "epoch maintenance registered");
    }

    fn register_memory_watchdog(&self, registry: &mut TaskRegistry) {
        let transport = Arc::clone(&self.transport);
        let memory = Arc::clone(&self.memory);
        let ceiling = self.config.memory_ceiling_mb;

        registry.spawn_periodic(
            "memory-watchdog",
            self.config.memory_check_interval,
            FirstTick::AfterPeriod,
            move || {
                let transport = Arc::clone(&transport);
                let memory = Arc::clone(&memory);
                async move {
                    let rss = memory.resident_mb();
                    if rss <= ceiling {
                        debug!(rss_mb = rss, ceiling_mb = ceiling, "memory within ceiling");
                        return;
                    }
                    warn!(rss_mb = rss, ceiling_mb = ceiling, "memory over ceiling, trimming message store");
                    if let Err(e) = transport.trim_message_store(KEEP_MESSAGES_PER_CHAT).await {
                        warn!(error = %e, "message store trim failed");
                    }
                }
            },
        );
    }

    fn register_janitor(&self, registry: &mut TaskRegistry) {
        let session = self.session.clone();
        let retention = self.config.session_retention;

        registry.spawn_periodic(
            "session-janitor",
            self.config.janitor_interval,
            FirstTick::Immediate,
            move || {
                let result = session.sweep(retention, SystemTime::now());
                async move {
                    if let Err(e) = result {
                        warn!(error = %e, "session sweep failed");
                    }
                }
            },
        );
    }

    fn register_store_flush(&self, registry: &mut TaskRegistry) {
        let transport = Arc::clone(&self.transport);

        registry.spawn_periodic(
            "store-flush",
            self.config.store_flush_interval,
            FirstTick::AfterPeriod,
            move || {
                let transport = Arc::clone(&transport);
                async move {
                    match transport.flush_store().await {
                        Ok(()) => debug!("message store flushed"),
                        Err(e) => warn!(error = %e, "message store flush failed"),
                    }
                }
            },
        );
    }
}
