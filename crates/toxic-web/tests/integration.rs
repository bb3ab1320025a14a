//! Integration tests for the toxic-web crate.
//!
//! The server is bound to an ephemeral port and queried with raw
//! HTTP/1.1 requests over a plain TCP stream.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use toxic_kernel::{LifecyclePhase, LifecycleSnapshot, MemorySampler};
use toxic_web::{AppState, WebConfig, WebServer};

struct FixedMemory;

impl MemorySampler for FixedMemory {
    fn resident_mb(&self) -> u64 {
        42
    }
}

async fn get(addr: std::net::SocketAddr, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status_line = head.lines().next().unwrap().to_owned();
    (status_line, body.to_owned())
}

#[test]
fn web_config_defaults() {
    let config = WebConfig::default();
    assert_eq!(config.bind_addr, "0.0.0.0");
    assert_eq!(config.port, 10000);
}

#[test]
fn partial_web_config_keeps_defaults() {
    let config: WebConfig = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
    assert_eq!(config.bind_addr, "0.0.0.0");
    assert_eq!(config.port, 8080);
}

#[tokio::test]
async fn endpoints_answer_and_server_shuts_down() {
    let (snapshots_tx, snapshots_rx) = watch::channel(LifecycleSnapshot {
        phase: LifecyclePhase::Open,
        epoch: 2,
        reconnects: 1,
        ..LifecycleSnapshot::default()
    });
    let state = AppState::new("Toxic-MD", snapshots_rx, Arc::new(FixedMemory));
    let server = WebServer::new(WebConfig::default(), state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let (status_line, body) = get(addr, "/ping").await;
    assert!(status_line.contains("200"), "{status_line}");
    assert_eq!(body, "pong");

    let (_, body) = get(addr, "/health").await;
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "alive");
    assert_eq!(health["memory"], "42MB");

    let (_, body) = get(addr, "/status").await;
    let status: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["bot"], "Toxic-MD");
    assert_eq!(status["status"], "online");
    assert_eq!(status["phase"], "open");
    assert_eq!(status["epoch"], 2);
    assert_eq!(status["reconnects"], 1);

    snapshots_tx.send_replace(LifecycleSnapshot {
        phase: LifecyclePhase::Reconnecting,
        epoch: 2,
        attempt_count: 1,
        reconnects: 1,
        ..LifecycleSnapshot::default()
    });
    let (_, body) = get(addr, "/status").await;
    let status: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["status"], "reconnecting");
    assert_eq!(status["attempt_count"], 1);

    let (_, body) = get(addr, "/").await;
    assert!(body.contains("Toxic-MD"));

    let (status_line, _) = get(addr, "/missing").await;
    assert!(status_line.contains("404"), "{status_line}");

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
