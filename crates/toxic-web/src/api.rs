//! Route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::Html;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use toxic_kernel::LifecyclePhase;

use crate::state::AppState;

const INDEX_HTML: &str = "<!doctype html>\n\
<html lang=\"en\">\n\
<head><meta charset=\"utf-8\"><title>Toxic-MD</title></head>\n\
<body>\n\
<h1>Toxic-MD</h1>\n\
<p>The bot process is running. See <a href=\"/status\">/status</a> for details.</p>\n\
</body>\n\
</html>\n";

// ---------------------------------------------------------------------------
// GET /
// ---------------------------------------------------------------------------

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ---------------------------------------------------------------------------
// GET /ping
// ---------------------------------------------------------------------------

pub async fn ping() -> &'static str {
    "pong"
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Response payload for the `/health` endpoint.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Whole seconds since the server started.
    pub uptime: u64,
    /// Resident memory, e.g. `"87MB"`.
    pub memory: String,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive",
        uptime: state.uptime().as_secs(),
        memory: format_memory(state.memory.resident_mb()),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

/// Response payload for the `/status` endpoint.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub bot: String,
    pub status: &'static str,
    pub phase: LifecyclePhase,
    pub epoch: u64,
    /// Human readable, e.g. `"3h 12m"`.
    pub uptime: String,
    pub memory: String,
    pub reconnects: u64,
    pub attempt_count: u32,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.snapshot();
    Json(StatusResponse {
        bot: state.bot_name.clone(),
        status: connection_status(snapshot.phase),
        phase: snapshot.phase,
        epoch: snapshot.epoch,
        uptime: format_uptime(state.uptime()),
        memory: format_memory(state.memory.resident_mb()),
        reconnects: snapshot.reconnects,
        attempt_count: snapshot.attempt_count,
    })
}

// ── formatting ──────────────────────────────────────────────────────

fn connection_status(phase: LifecyclePhase) -> &'static str {
    match phase {
        LifecyclePhase::Open => "online",
        LifecyclePhase::Stopped => "offline",
        LifecyclePhase::Idle | LifecyclePhase::Connecting => "connecting",
        LifecyclePhase::Closing
        | LifecyclePhase::WipingSession
        | LifecyclePhase::Reconnecting
        | LifecyclePhase::Cooldown => "reconnecting",
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

fn format_memory(mb: u64) -> String {
    format!("{mb}MB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;
    use toxic_kernel::{LifecycleSnapshot, MemorySampler};

    struct FixedMemory(u64);

    impl MemorySampler for FixedMemory {
        fn resident_mb(&self) -> u64 {
            self.0
        }
    }

    fn state_with(snapshot: LifecycleSnapshot) -> (watch::Sender<LifecycleSnapshot>, Arc<AppState>) {
        let (tx, rx) = watch::channel(snapshot);
        let state = AppState::new("Toxic-MD", rx, Arc::new(FixedMemory(87)));
        (tx, Arc::new(state))
    }

    #[test]
    fn uptime_is_hours_and_minutes() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0h 0m");
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 12 * 60 + 5)), "3h 12m");
        assert_eq!(format_uptime(Duration::from_secs(27 * 3600)), "27h 0m");
    }

    #[test]
    fn every_phase_has_a_status() {
        assert_eq!(connection_status(LifecyclePhase::Open), "online");
        assert_eq!(connection_status(LifecyclePhase::Cooldown), "reconnecting");
        assert_eq!(connection_status(LifecyclePhase::Idle), "connecting");
        assert_eq!(connection_status(LifecyclePhase::Stopped), "offline");
    }

    #[tokio::test]
    async fn health_reports_memory_and_timestamp() {
        let (_tx, state) = state_with(LifecycleSnapshot::default());
        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "alive");
        assert_eq!(body.memory, "87MB");
        assert!(body.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&body.timestamp).is_ok());
    }

    #[tokio::test]
    async fn status_follows_published_snapshots() {
        let (tx, state) = state_with(LifecycleSnapshot::default());

        let Json(before) = status(State(Arc::clone(&state))).await;
        assert_eq!(before.status, "connecting");
        assert_eq!(before.epoch, 0);

        tx.send_replace(LifecycleSnapshot {
            phase: LifecyclePhase::Open,
            epoch: 4,
            reconnects: 3,
            ..LifecycleSnapshot::default()
        });
        let Json(after) = status(State(state)).await;
        assert_eq!(after.bot, "Toxic-MD");
        assert_eq!(after.status, "online");
        assert_eq!(after.epoch, 4);
        assert_eq!(after.reconnects, 3);
        assert_eq!(after.attempt_count, 0);

        let json = serde_json::to_value(&after).unwrap();
        assert_eq!(json["phase"], "open");
    }
}
