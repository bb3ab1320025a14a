//! Connection lifecycle orchestrator.
//!
//! One [`Orchestrator`] owns the reconnect state machine:
//!
//! ```text
//! Idle --> Connecting --> Open --> Closing --+--> WipingSession --+
//!              ^                             +--> Reconnecting ---+
//!              |                             +--> Cooldown -------+
//!              +-------------------------------------------------+
//! ```
//!
//! Everything runs on a single task. [`Orchestrator::run`] consumes, in
//! arrival order, the current connection's event channel, the firings of
//! its own reconnect timer, and commands from [`OrchestratorHandle`]s.
//! Periodic epoch jobs and the reconnect timer are separate tokio tasks
//! that only ever send messages back.
//!
//! At most one reconnect timer is outstanding. Each one carries a
//! generation number and a firing whose generation is no longer current
//! is dropped.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use toxic_store::ConfigStore;

use crate::backoff::{Decision, ReconnectPolicy};
use crate::disconnect::{DisconnectClass, DisconnectEvent};
use crate::error::{KernelError, Result};
use crate::maintenance::{Maintenance, MaintenanceConfig, MemorySampler, ProcessMemory};
use crate::session_files::SessionFiles;
use crate::tasks::TaskRegistry;
use crate::transport::{CredentialsUpdate, Transport, TransportEvent, TransportEvents};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    Connecting,
    Open,
    Closing,
    WipingSession,
    Reconnecting,
    Cooldown,
    /// The orchestrator was shut down.
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::WipingSession => "wiping_session",
            Self::Reconnecting => "reconnecting",
            Self::Cooldown => "cooldown",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleSnapshot {
    pub phase: LifecyclePhase,
    /// Number of the current epoch; 0 before the first connect.
    pub epoch: u64,
    pub attempt_count: u32,
    /// Successful opens after the first epoch.
    pub reconnects: u64,
    pub last_disconnect: Option<DisconnectClass>,
    /// Delay of the pending reconnect timer, if any.
    pub next_retry_ms: Option<u64>,
}

impl Default for LifecycleSnapshot {
    fn default() -> Self {
        Self {
            phase: LifecyclePhase::Idle,
            epoch: 0,
            attempt_count: 0,
            reconnects: 0,
            last_disconnect: None,
            next_retry_ms: None,
        }
    }
}

/// Static configuration of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub policy: ReconnectPolicy,
    pub maintenance: MaintenanceConfig,
    pub session_dir: PathBuf,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            maintenance: MaintenanceConfig::default(),
            session_dir: PathBuf::from("Session"),
        }
    }
}

struct PendingTimer {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

impl Drop for PendingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Failure counter and reconnect guard.
#[derive(Default)]
pub struct ReconnectState {
    pub attempt_count: u32,
    /// A reconnect is scheduled; new connection cycles are refused.
    pub is_restarting: bool,
    pending_timer: Option<PendingTimer>,
}

impl ReconnectState {
    pub fn has_pending_timer(&self) -> bool {
        self.pending_timer.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            debug!(generation = timer.generation, "pending reconnect timer cancelled");
        }
    }
}

impl fmt::Debug for ReconnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectState")
            .field("attempt_count", &self.attempt_count)
            .field("is_restarting", &self.is_restarting)
            .field("pending_timer", &self.pending_timer.as_ref().map(|t| t.generation))
            .finish()
    }
}

/// One connect-to-steady-state cycle and the tasks it started.
#[derive(Debug)]
pub struct ConnectionEpoch {
    pub number: u64,
    pub started_at: Instant,
    tasks: TaskRegistry,
}

impl ConnectionEpoch {
    pub fn live_tasks(&self) -> usize {
        self.tasks.live()
    }
}

enum Command {
    Restart,
    Shutdown,
}

struct TimerFired {
    generation: u64,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable control and observation handle.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<LifecycleSnapshot>,
}

impl OrchestratorHandle {
    /// The most recently published snapshot.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A fresh receiver for snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.snapshots.clone()
    }

    /// Ask for a new connection cycle. Ignored while a reconnect is
    /// already scheduled.
    pub fn restart(&self) -> Result<()> {
        self.commands
            .send(Command::Restart)
            .map_err(|_| KernelError::OrchestratorStopped)
    }

    /// Stop the run loop after it finishes the current transition.
    pub fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| KernelError::OrchestratorStopped)
    }
}

impl fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("snapshot", &*self.snapshots.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The connection lifecycle state machine.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    store: Arc<ConfigStore>,
    policy: ReconnectPolicy,
    session: SessionFiles,
    maintenance: Maintenance,

    state: ReconnectState,
    epoch: Option<ConnectionEpoch>,
    epochs_started: u64,
    reconnects: u64,
    last_disconnect: Option<DisconnectClass>,
    phase: LifecyclePhase,
    generation: u64,

    events: Option<TransportEvents>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<LifecycleSnapshot>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<ConfigStore>, config: LifecycleConfig) -> Self {
        let LifecycleConfig {
            policy,
            maintenance,
            session_dir,
        } = config;
        let session = SessionFiles::new(session_dir);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(LifecycleSnapshot::default());

        Self {
            maintenance: Maintenance {
                config: maintenance,
                transport: Arc::clone(&transport),
                session: session.clone(),
                memory: Arc::new(ProcessMemory),
            },
            transport,
            store,
            policy,
            session,
            state: ReconnectState::default(),
            epoch: None,
            epochs_started: 0,
            reconnects: 0,
            last_disconnect: None,
            phase: LifecyclePhase::Idle,
            generation: 0,
            events: None,
            timer_tx,
            timer_rx,
            command_tx,
            command_rx,
            snapshot_tx,
        }
    }

    /// Replace the resident-memory source used by the memory watchdog.
    pub fn with_memory_sampler(mut self, memory: Arc<dyn MemorySampler>) -> Self {
        self.maintenance.memory = memory;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            commands: self.command_tx.clone(),
            snapshots: self.snapshot_tx.subscribe(),
        }
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn current_epoch(&self) -> Option<&ConnectionEpoch> {
        self.epoch.as_ref()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            phase: self.phase,
            epoch: self.epochs_started,
            attempt_count: self.state.attempt_count,
            reconnects: self.reconnects,
            last_disconnect: self.last_disconnect,
            next_retry_ms: self
                .state
                .pending_timer
                .as_ref()
                .map(|t| t.delay.as_millis() as u64),
        }
    }

    /// Drive the state machine until a shutdown command arrives.
    pub async fn run(mut self) {
        info!(
            max_attempts = self.policy.max_attempts,
            base_delay_ms = self.policy.base_delay.as_millis() as u64,
            "connection lifecycle started"
        );
        self.start().await;

        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => match command {
                    Command::Restart => self.start().await,
                    Command::Shutdown => break,
                },
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired).await,
                event = next_event(&mut self.events) => self.on_event(event).await,
                else => break,
            }
        }

        self.stop();
    }

    // -- transitions --------------------------------------------------------

    /// Begin a new connection epoch.
    ///
    /// No-op while a reconnect is scheduled.
    pub async fn start(&mut self) {
        if self.state.is_restarting {
            debug!(epoch = self.epochs_started, "start ignored, reconnect already scheduled");
            return;
        }

        self.state.cancel_timer();
        self.teardown_epoch();
        self.events = None;

        self.epochs_started += 1;
        let number = self.epochs_started;
        self.phase = LifecyclePhase::Connecting;

        let settings = self.store.settings().await;
        debug!(epoch = number, source = ?settings.source, "settings loaded for epoch");

        let mut tasks = TaskRegistry::new(number);
        self.maintenance.register(&mut tasks);
        self.epoch = Some(ConnectionEpoch {
            number,
            started_at: Instant::now(),
            tasks,
        });
        self.publish();

        info!(epoch = number, attempt = self.state.attempt_count, "connecting");
        match self.transport.connect(&settings.value).await {
            Ok(events) => self.events = Some(events),
            Err(e) => {
                warn!(epoch = number, error = %e, "transport connect failed");
                self.on_disconnect(DisconnectEvent::without_code(e.to_string()));
            }
        }
    }

    /// The connection reached steady state.
    pub fn on_open(&mut self) {
        self.state.attempt_count = 0;
        self.state.is_restarting = false;
        self.state.cancel_timer();
        if self.epochs_started > 1 {
            self.reconnects += 1;
        }
        self.phase = LifecyclePhase::Open;
        self.publish();
        info!(epoch = self.epochs_started, reconnects = self.reconnects, "connection open");
    }

    /// Classify a close and schedule the matching reconnect.
    ///
    /// Ignored while a reconnect is already scheduled.
    pub fn on_disconnect(&mut self, event: DisconnectEvent) {
        if self.state.is_restarting {
            debug!(cause = ?event.cause_code, "disconnect ignored, reconnect already scheduled");
            return;
        }

        self.state.cancel_timer();
        self.events = None;
        self.phase = LifecyclePhase::Closing;
        self.teardown_epoch();

        let class = event.class();
        self.last_disconnect = Some(class);
        let decision = self.policy.decide(class, &mut self.state.attempt_count);
        let delay_ms = decision.delay().as_millis() as u64;

        match decision {
            Decision::WipeSession { .. } => {
                self.phase = LifecyclePhase::WipingSession;
                self.publish();
                match self.session.wipe() {
                    Ok(removed) => debug!(removed, "session files removed"),
                    Err(e) => error!(error = %e, "failed to wipe session credentials"),
                }
                self.store.invalidate_settings();
                self.phase = LifecyclePhase::Reconnecting;
                warn!(
                    %class,
                    cause = ?event.cause_code,
                    epoch = self.epochs_started,
                    delay_ms,
                    "logged out, session wiped; reconnecting for a new pairing"
                );
            }
            Decision::Restart { .. } => {
                self.phase = LifecyclePhase::Reconnecting;
                info!(%class, cause = ?event.cause_code, epoch = self.epochs_started, delay_ms, "restart required");
            }
            Decision::Backoff { attempt, .. } => {
                self.phase = LifecyclePhase::Reconnecting;
                warn!(
                    %class,
                    cause = ?event.cause_code,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    epoch = self.epochs_started,
                    delay_ms,
                    error = %event.raw_error,
                    "connection lost, reconnecting"
                );
            }
            Decision::Cooldown { .. } => {
                self.phase = LifecyclePhase::Cooldown;
                error!(
                    %class,
                    cause = ?event.cause_code,
                    max_attempts = self.policy.max_attempts,
                    epoch = self.epochs_started,
                    delay_ms,
                    "reconnect attempts exhausted, cooling down"
                );
            }
        }

        self.schedule_reconnect(decision.delay());
    }

    // -- internals ----------------------------------------------------------

    async fn on_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => self.on_open(),
            Some(TransportEvent::Close(disconnect)) => self.on_disconnect(disconnect),
            Some(TransportEvent::CredentialsUpdated(update)) => self.persist_credentials(update).await,
            None => {
                self.events = None;
                self.on_disconnect(DisconnectEvent::without_code("transport event stream closed"));
            }
        }
    }

    async fn persist_credentials(&self, update: CredentialsUpdate) {
        match self.transport.persist_credentials(update).await {
            Ok(()) => debug!(epoch = self.epochs_started, "credentials persisted"),
            Err(e) => warn!(epoch = self.epochs_started, error = %e, "failed to persist credentials"),
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        let current = self.state.pending_timer.as_ref().map(|t| t.generation);
        if current != Some(fired.generation) {
            debug!(generation = fired.generation, ?current, "stale reconnect timer ignored");
            return;
        }
        self.state.pending_timer = None;
        self.state.is_restarting = false;
        self.start().await;
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.state.cancel_timer();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.timer_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The receiver only disappears with the orchestrator.
            let _ = tx.send(TimerFired { generation });
        });

        self.state.pending_timer = Some(PendingTimer {
            generation,
            delay,
            handle,
        });
        self.state.is_restarting = true;
        self.publish();
    }

    fn teardown_epoch(&mut self) {
        if let Some(epoch) = self.epoch.as_mut() {
            epoch.tasks.teardown();
        }
    }

    fn stop(&mut self) {
        self.state.cancel_timer();
        self.state.is_restarting = false;
        self.teardown_epoch();
        self.events = None;
        self.phase = LifecyclePhase::Stopped;
        self.publish();
        info!(epoch = self.epochs_started, reconnects = self.reconnects, "connection lifecycle stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phase", &self.phase)
            .field("epoch", &self.epochs_started)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use toxic_store::{ConfigStoreOptions, MemoryBackend, Settings};

    use crate::transport::event_channel;

    /// Connects successfully and keeps every sender alive.
    #[derive(Default)]
    struct IdleTransport {
        connects: AtomicUsize,
        senders: std::sync::Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl Transport for IdleTransport {
        async fn connect(&self, _settings: &Settings) -> Result<TransportEvents> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = event_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn persist_credentials(&self, _update: CredentialsUpdate) -> Result<()> {
            Ok(())
        }

        async fn flush_store(&self) -> Result<()> {
            Ok(())
        }

        async fn trim_message_store(&self, _keep_per_chat: usize) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator(transport: Arc<IdleTransport>, session_dir: PathBuf) -> Orchestrator {
        let store = Arc::new(ConfigStore::new(
            Arc::new(MemoryBackend::new()),
            ConfigStoreOptions::default(),
        ));
        Orchestrator::new(
            transport,
            store,
            LifecycleConfig {
                session_dir,
                ..LifecycleConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_epoch_with_maintenance_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(IdleTransport::default());
        let mut orch = orchestrator(transport.clone(), dir.path().to_path_buf());

        orch.start().await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        let epoch = orch.current_epoch().unwrap();
        assert_eq!(epoch.number, 1);
        assert_eq!(epoch.live_tasks(), 3);
        assert_eq!(orch.snapshot().phase, LifecyclePhase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tears_down_epoch_and_arms_one_timer() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(IdleTransport::default());
        let mut orch = orchestrator(transport, dir.path().to_path_buf());
        orch.start().await;

        orch.on_disconnect(DisconnectEvent::with_code(408, "Connection Lost"));

        assert_eq!(orch.current_epoch().unwrap().live_tasks(), 0);
        assert!(orch.reconnect_state().is_restarting);
        assert!(orch.reconnect_state().has_pending_timer());
        assert_eq!(orch.reconnect_state().attempt_count, 1);
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.phase, LifecyclePhase::Reconnecting);
        assert_eq!(snapshot.next_retry_ms, Some(3_000));
        assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::Transient));
    }

    #[tokio::test(start_paused = true)]
    async fn second_disconnect_and_start_are_ignored_while_restarting() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(IdleTransport::default());
        let mut orch = orchestrator(transport.clone(), dir.path().to_path_buf());
        orch.start().await;

        orch.on_disconnect(DisconnectEvent::with_code(428, "Connection Closed"));
        let generation = orch.reconnect_state().pending_timer.as_ref().unwrap().generation;

        orch.on_disconnect(DisconnectEvent::with_code(408, "again"));
        orch.start().await;

        assert_eq!(orch.reconnect_state().attempt_count, 1);
        assert_eq!(
            orch.reconnect_state().pending_timer.as_ref().unwrap().generation,
            generation
        );
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_resets_counter_and_cancels_timer() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(IdleTransport::default());
        let mut orch = orchestrator(transport, dir.path().to_path_buf());
        orch.start().await;
        orch.on_disconnect(DisconnectEvent::with_code(503, "unavailable"));

        orch.on_open();

        let state = orch.reconnect_state();
        assert_eq!(state.attempt_count, 0);
        assert!(!state.is_restarting);
        assert!(!state.has_pending_timer());
        assert_eq!(orch.snapshot().phase, LifecyclePhase::Open);
        // Still the first epoch, so this is not counted as a reconnect.
        assert_eq!(orch.snapshot().reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_firing_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(IdleTransport::default());
        let mut orch = orchestrator(transport.clone(), dir.path().to_path_buf());
        orch.start().await;
        orch.on_disconnect(DisconnectEvent::with_code(408, "lost"));

        orch.on_timer(TimerFired { generation: 0 }).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert!(orch.reconnect_state().is_restarting);

        let current = orch.reconnect_state().pending_timer.as_ref().unwrap().generation;
        orch.on_timer(TimerFired { generation: current }).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(orch.current_epoch().unwrap().number, 2);
    }
}
