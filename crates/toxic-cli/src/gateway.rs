//! WebSocket gateway transport.
//!
//! The messaging protocol lives behind a gateway process. This bridge
//! speaks a small JSON framing to it:
//!
//! - outbound `{"type":"hello", ...}` once per connection, carrying the
//!   current settings and whether pairing credentials exist
//! - inbound `open`, `creds` and `message` frames
//! - the WebSocket close code carries the disconnect cause: `4000 + N`
//!   means cause `N`, and a few standard close codes are mapped onto the
//!   matching cause
//!
//! Message payloads stay opaque. They are kept per chat in memory so the
//! maintenance jobs can flush and trim them.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use toxic_kernel::disconnect::codes;
use toxic_kernel::{
    CredentialsUpdate, DisconnectEvent, KernelError, SessionFiles, Transport, TransportEvent,
    TransportEvents, event_channel,
};
use toxic_store::Settings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Base of the application close-code range that carries a cause code.
const CAUSE_CLOSE_BASE: u16 = 4000;

/// File name of the persisted message store inside the data directory.
pub const MESSAGE_STORE_FILE: &str = "message_store.json";

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayFrame {
    Open,
    Creds {
        data: Value,
    },
    Message {
        chat: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Map a WebSocket close code onto a disconnect cause code.
pub fn cause_from_close(code: u16) -> Option<u16> {
    match code {
        c if (CAUSE_CLOSE_BASE..CAUSE_CLOSE_BASE + 1000).contains(&c) => Some(c - CAUSE_CLOSE_BASE),
        1000 | 1001 => Some(codes::CONNECTION_CLOSED),
        1006 => Some(codes::CONNECTION_LOST),
        1011 => Some(codes::BAD_SESSION),
        1012 => Some(codes::RESTART_REQUIRED),
        1013 => Some(codes::UNAVAILABLE),
        _ => None,
    }
}

fn close_event(frame: Option<CloseFrame>) -> DisconnectEvent {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = frame.reason.as_str().to_owned();
            match cause_from_close(code) {
                Some(cause) => DisconnectEvent::with_code(cause, reason),
                None => DisconnectEvent::without_code(format!("close {code}: {reason}")),
            }
        }
        None => DisconnectEvent::without_code("closed without a close frame"),
    }
}

// ---------------------------------------------------------------------------
// Message store
// ---------------------------------------------------------------------------

/// Opaque message payloads grouped by chat, oldest first.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MessageStore {
    chats: BTreeMap<String, VecDeque<Value>>,
}

impl MessageStore {
    pub fn push(&mut self, chat: impl Into<String>, message: Value) {
        self.chats.entry(chat.into()).or_default().push_back(message);
    }

    /// Keep the newest `keep_per_chat` messages of every chat. Returns the
    /// number of messages dropped.
    pub fn trim(&mut self, keep_per_chat: usize) -> usize {
        let mut removed = 0;
        for messages in self.chats.values_mut() {
            let excess = messages.len().saturating_sub(keep_per_chat);
            messages.drain(..excess);
            removed += excess;
        }
        self.chats.retain(|_, messages| !messages.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.chats.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn chat(&self, chat: &str) -> Option<&VecDeque<Value>> {
        self.chats.get(chat)
    }

    fn to_json(&self) -> Value {
        json!(self.chats)
    }

    fn from_json(value: Value) -> serde_json::Result<Self> {
        let chats = serde_json::from_value(value)?;
        Ok(Self { chats })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// [`Transport`] over a WebSocket connection to the messaging gateway.
pub struct GatewayTransport {
    url: Url,
    connect_timeout: Duration,
    session: SessionFiles,
    store_path: PathBuf,
    messages: Arc<Mutex<MessageStore>>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayTransport {
    pub fn new(url: Url, session_dir: impl Into<PathBuf>, data_dir: &Path) -> Self {
        Self {
            url,
            connect_timeout: Duration::from_secs(20),
            session: SessionFiles::new(session_dir),
            store_path: data_dir.join(MESSAGE_STORE_FILE),
            messages: Arc::new(Mutex::new(MessageStore::default())),
            connection: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Load the message store written by a previous run.
    ///
    /// A missing file is not an error. Returns the number of messages
    /// loaded.
    pub async fn restore_store(&self) -> toxic_kernel::Result<usize> {
        let raw = match tokio::fs::read_to_string(&self.store_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(KernelError::transport("restore_store", e)),
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| KernelError::transport("restore_store", e))?;
        let restored = MessageStore::from_json(value)
            .map_err(|e| KernelError::transport("restore_store", e))?;
        let count = restored.len();
        *self.lock_messages() = restored;
        info!(path = %self.store_path.display(), messages = count, "message store restored");
        Ok(count)
    }

    /// A copy of the in-memory message store.
    pub fn messages(&self) -> MessageStore {
        self.lock_messages().clone()
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, MessageStore> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_connection(&self, task: JoinHandle<()>) {
        let mut current = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.replace(task) {
            previous.abort();
        }
    }
}

impl Drop for GatewayTransport {
    fn drop(&mut self) {
        let current = self.connection.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = current.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn connect(&self, settings: &Settings) -> toxic_kernel::Result<TransportEvents> {
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                KernelError::transport(
                    "connect",
                    format!("timed out after {}s", self.connect_timeout.as_secs()),
                )
            })?
            .map_err(|e| KernelError::transport("connect", e))?;

        let (mut sink, stream) = ws.split();
        let hello = json!({
            "type": "hello",
            "registered": self.session.has_credentials(),
            "settings": settings.to_document(),
        });
        sink.send(Message::Text(hello.to_string().into()))
            .await
            .map_err(|e| KernelError::transport("hello", e))?;
        debug!(url = %self.url, "gateway connected, hello sent");

        let (events_tx, events_rx) = event_channel();
        let task = tokio::spawn(pump(stream, sink, events_tx, Arc::clone(&self.messages)));
        self.replace_connection(task);
        Ok(events_rx)
    }

    async fn persist_credentials(&self, update: CredentialsUpdate) -> toxic_kernel::Result<()> {
        let dir = self.session.dir();
        let body = serde_json::to_string_pretty(&update.0)
            .map_err(|e| KernelError::transport("persist_credentials", e))?;
        write_atomic(dir, "creds.json", body.as_bytes())
            .await
            .map_err(|e| KernelError::transport("persist_credentials", e))?;
        debug!(dir = %dir.display(), "credentials persisted");
        Ok(())
    }

    async fn flush_store(&self) -> toxic_kernel::Result<()> {
        let (body, count) = {
            let messages = self.lock_messages();
            (messages.to_json(), messages.len())
        };
        let body = serde_json::to_string_pretty(&body)
            .map_err(|e| KernelError::transport("flush_store", e))?;

        let dir = self.store_path.parent().unwrap_or_else(|| Path::new("."));
        write_atomic(dir, MESSAGE_STORE_FILE, body.as_bytes())
            .await
            .map_err(|e| KernelError::transport("flush_store", e))?;
        debug!(path = %self.store_path.display(), messages = count, "message store written");
        Ok(())
    }

    async fn trim_message_store(&self, keep_per_chat: usize) -> toxic_kernel::Result<()> {
        let removed = self.lock_messages().trim(keep_per_chat);
        info!(removed, keep_per_chat, "message store trimmed");
        Ok(())
    }
}

/// Forward one connection's frames as [`TransportEvent`]s until it closes.
async fn pump(
    mut stream: SplitStream<WsStream>,
    mut sink: SplitSink<WsStream, Message>,
    events: mpsc::Sender<TransportEvent>,
    messages: Arc<Mutex<MessageStore>>,
) {
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(&text) {
                Ok(GatewayFrame::Open) => Some(TransportEvent::Open),
                Ok(GatewayFrame::Creds { data }) => {
                    Some(TransportEvent::CredentialsUpdated(CredentialsUpdate(data)))
                }
                Ok(GatewayFrame::Message { chat, payload }) => {
                    debug!(chat = %chat, "message received");
                    messages
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(chat, payload);
                    None
                }
                Ok(GatewayFrame::Unknown) => {
                    debug!("ignoring unknown gateway frame");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "unparseable gateway frame");
                    None
                }
            },
            Ok(Message::Close(frame)) => {
                let _ = events.send(TransportEvent::Close(close_event(frame))).await;
                return;
            }
            Ok(_) => None,
            Err(e) => {
                let event = DisconnectEvent::with_code(codes::CONNECTION_LOST, e.to_string());
                let _ = events.send(TransportEvent::Close(event)).await;
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("connection events no longer consumed, closing socket");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
    debug!("gateway stream ended without a close frame");
}

/// Write `bytes` to `dir/name` through a hidden temporary file.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &target).await
}
