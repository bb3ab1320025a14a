//! Integration tests for the toxic-kernel crate.
//!
//! These drive a running [`Orchestrator`] against a scripted transport
//! under paused tokio time, so every reconnect delay is observed exactly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toxic_kernel::{
    CredentialsUpdate, DisconnectClass, DisconnectEvent, KernelError, LifecycleConfig,
    LifecyclePhase, LifecycleSnapshot, Orchestrator, OrchestratorHandle, ReconnectPolicy, Result,
    Transport, TransportEvent, TransportEvents, event_channel,
};
use toxic_store::{ConfigStore, ConfigStoreOptions, MemoryBackend, Settings};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted transport
// ═══════════════════════════════════════════════════════════════════════

/// One connection handed out by the scripted transport.
struct Connection {
    events: mpsc::Sender<TransportEvent>,
    at: Instant,
    had_credentials: bool,
}

impl Connection {
    async fn send(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    async fn close(&self, code: Option<u16>) {
        self.send(TransportEvent::Close(DisconnectEvent::new(code, "scripted close")))
            .await;
    }
}

struct ScriptedTransport {
    session_dir: PathBuf,
    connections: mpsc::UnboundedSender<Connection>,
    failures_left: AtomicUsize,
    persisted: AtomicUsize,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _settings: &Settings) -> Result<TransportEvents> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(KernelError::transport("connect", "gateway unreachable"));
        }

        let (tx, rx) = event_channel();
        let connection = Connection {
            events: tx,
            at: Instant::now(),
            had_credentials: self.session_dir.join("creds.json").exists(),
        };
        self.connections
            .send(connection)
            .map_err(|e| KernelError::Internal(e.to_string()))?;
        Ok(rx)
    }

    async fn persist_credentials(&self, _update: CredentialsUpdate) -> Result<()> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush_store(&self) -> Result<()> {
        Ok(())
    }

    async fn trim_message_store(&self, _keep_per_chat: usize) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    session_dir: PathBuf,
    transport: Arc<ScriptedTransport>,
    connections: mpsc::UnboundedReceiver<Connection>,
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

impl Harness {
    fn spawn(policy: ReconnectPolicy, connect_failures: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("Session");
        std::fs::create_dir_all(&session_dir).unwrap();

        let (tx, connections) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            session_dir: session_dir.clone(),
            connections: tx,
            failures_left: AtomicUsize::new(connect_failures),
            persisted: AtomicUsize::new(0),
        });
        let store = Arc::new(ConfigStore::new(
            Arc::new(MemoryBackend::new()),
            ConfigStoreOptions::default(),
        ));

        let orchestrator = Orchestrator::new(
            transport.clone(),
            store,
            LifecycleConfig {
                policy,
                session_dir: session_dir.clone(),
                ..LifecycleConfig::default()
            },
        );
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run());

        Self {
            _dir: dir,
            session_dir,
            transport,
            connections,
            handle,
            task,
        }
    }

    async fn next_connection(&mut self) -> Connection {
        self.connections.recv().await.unwrap()
    }

    /// Wait until a reconnect timer is armed and return that snapshot.
    async fn scheduled(&self) -> LifecycleSnapshot {
        let mut rx = self.handle.subscribe();
        rx.wait_for(|s| s.next_retry_ms.is_some())
            .await
            .unwrap()
            .clone()
    }

    async fn phase(&self, phase: LifecyclePhase) -> LifecycleSnapshot {
        let mut rx = self.handle.subscribe();
        rx.wait_for(|s| s.phase == phase).await.unwrap().clone()
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn assert_waited(from: Instant, to: Instant, expected: Duration) {
    let waited = to.duration_since(from);
    assert!(
        waited >= expected && waited < expected + ms(5),
        "waited {waited:?}, expected {expected:?}"
    );
}

fn touch(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"{}").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Backoff
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn three_connection_losses_back_off_by_growth() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let mut previous = h.next_connection().await;
    for (n, expected) in [(1, 3_000), (2, 3_900), (3, 5_070)] {
        previous.close(Some(408)).await;

        let snapshot = h.scheduled().await;
        assert_eq!(snapshot.next_retry_ms, Some(expected));
        assert_eq!(snapshot.attempt_count, n);
        assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::Transient));

        let next = h.next_connection().await;
        assert_waited(previous.at, next.at, ms(expected));
        previous = next;
    }
    assert_eq!(h.handle.snapshot().epoch, 4);
}

#[tokio::test(start_paused = true)]
async fn open_resets_the_failure_counter() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    c1.close(Some(408)).await;
    let c2 = h.next_connection().await;
    c2.close(Some(500)).await;
    let c3 = h.next_connection().await;
    assert_eq!(h.handle.snapshot().attempt_count, 2);

    c3.send(TransportEvent::Open).await;
    let open = h.phase(LifecyclePhase::Open).await;
    assert_eq!(open.attempt_count, 0);
    assert_eq!(open.reconnects, 1);

    c3.close(Some(408)).await;
    let snapshot = h.scheduled().await;
    assert_eq!(snapshot.next_retry_ms, Some(3_000));
    assert_eq!(snapshot.attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_cool_down_and_reset() {
    let policy = ReconnectPolicy {
        max_attempts: 2,
        ..ReconnectPolicy::default()
    };
    let mut h = Harness::spawn(policy, 0);

    let c1 = h.next_connection().await;
    c1.close(None).await;
    assert_eq!(h.scheduled().await.next_retry_ms, Some(3_000));

    let c2 = h.next_connection().await;
    c2.close(None).await;
    assert_eq!(h.scheduled().await.next_retry_ms, Some(4_500));

    let c3 = h.next_connection().await;
    c3.close(Some(428)).await;
    let cooldown = h.scheduled().await;
    assert_eq!(cooldown.phase, LifecyclePhase::Cooldown);
    assert_eq!(cooldown.next_retry_ms, Some(60_000));
    assert_eq!(cooldown.attempt_count, 0);

    let c4 = h.next_connection().await;
    assert_waited(c3.at, c4.at, ms(60_000));
}

#[tokio::test(start_paused = true)]
async fn restart_required_does_not_count_a_failure() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    c1.close(Some(408)).await;
    let c2 = h.next_connection().await;
    c2.close(Some(515)).await;

    let snapshot = h.scheduled().await;
    assert_eq!(snapshot.next_retry_ms, Some(2_000));
    assert_eq!(snapshot.attempt_count, 1);
    assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::RestartRequired));

    let c3 = h.next_connection().await;
    assert_waited(c2.at, c3.at, ms(2_000));
}

// ═══════════════════════════════════════════════════════════════════════
//  Logout
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn logout_wipes_credentials_before_reconnecting() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);
    touch(&h.session_dir, "creds.json");
    touch(&h.session_dir, "pre-key-1.json");

    let c1 = h.next_connection().await;
    assert!(c1.had_credentials);
    c1.close(Some(401)).await;

    let snapshot = h.scheduled().await;
    assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::LoggedOut));
    assert_eq!(snapshot.attempt_count, 0);
    assert_eq!(snapshot.next_retry_ms, Some(3_000));
    assert_eq!(std::fs::read_dir(&h.session_dir).unwrap().count(), 0);

    let c2 = h.next_connection().await;
    assert!(!c2.had_credentials);
    assert_waited(c1.at, c2.at, ms(3_000));
}

// ═══════════════════════════════════════════════════════════════════════
//  Reentrancy and collaborator failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn restart_is_refused_while_a_reconnect_is_pending() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    c1.close(Some(408)).await;
    h.scheduled().await;

    h.handle.restart().unwrap();
    h.handle.restart().unwrap();

    let c2 = h.next_connection().await;
    assert_waited(c1.at, c2.at, ms(3_000));
    assert_eq!(h.handle.snapshot().epoch, 2);
}

#[tokio::test(start_paused = true)]
async fn restart_while_open_starts_a_new_epoch() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    c1.send(TransportEvent::Open).await;
    h.phase(LifecyclePhase::Open).await;

    h.handle.restart().unwrap();
    let c2 = h.next_connection().await;
    assert_eq!(c2.at, c1.at);
    assert_eq!(h.handle.snapshot().epoch, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_treated_as_unknown_disconnect() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 1);
    let started = Instant::now();

    let snapshot = h.scheduled().await;
    assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::Unknown));
    assert_eq!(snapshot.attempt_count, 1);

    let c1 = h.next_connection().await;
    assert_waited(started, c1.at, ms(3_000));
}

#[tokio::test(start_paused = true)]
async fn dropped_event_stream_counts_as_disconnect() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    let at = c1.at;
    drop(c1);

    let snapshot = h.scheduled().await;
    assert_eq!(snapshot.last_disconnect, Some(DisconnectClass::Unknown));

    let c2 = h.next_connection().await;
    assert_waited(at, c2.at, ms(3_000));
}

#[tokio::test(start_paused = true)]
async fn credential_updates_are_forwarded() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);

    let c1 = h.next_connection().await;
    c1.send(TransportEvent::CredentialsUpdated(CredentialsUpdate(
        serde_json::json!({"me": "bot"}),
    )))
    .await;
    c1.send(TransportEvent::Open).await;
    h.phase(LifecyclePhase::Open).await;

    assert_eq!(h.transport.persisted.load(Ordering::SeqCst), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_run_loop() {
    let mut h = Harness::spawn(ReconnectPolicy::default(), 0);
    let c1 = h.next_connection().await;
    c1.close(Some(408)).await;
    h.scheduled().await;

    h.handle.shutdown().unwrap();
    (&mut h.task).await.unwrap();

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.phase, LifecyclePhase::Stopped);
    assert_eq!(snapshot.next_retry_ms, None);

    // The cancelled timer never produces another connection.
    tokio::time::sleep(ms(10_000)).await;
    assert!(h.connections.try_recv().is_err());
    assert!(h.handle.restart().is_err());
}
