//! The transport collaborator seam.
//!
//! The orchestrator never speaks the messaging protocol itself. It asks a
//! [`Transport`] to connect, consumes the events of that one connection,
//! and forwards a handful of lifecycle calls back to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use toxic_store::Settings;

use crate::disconnect::DisconnectEvent;
use crate::error::Result;

/// Events emitted by one live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection reached steady state.
    Open,
    /// The connection closed. No further events follow.
    Close(DisconnectEvent),
    /// The transport rotated its credentials and wants them persisted.
    CredentialsUpdated(CredentialsUpdate),
}

/// Opaque credential material handed back to the transport for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialsUpdate(pub serde_json::Value);

/// Receiver for the events of one connection.
///
/// A receiver that closes without yielding [`TransportEvent::Close`] is
/// treated as a close with no cause code.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Buffer size for per-connection event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Create a sender/receiver pair sized for one connection.
pub fn event_channel() -> (mpsc::Sender<TransportEvent>, TransportEvents) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// The messaging transport as seen by the lifecycle core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a new connection using the current settings.
    async fn connect(&self, settings: &Settings) -> Result<TransportEvents>;

    /// Store rotated credentials.
    async fn persist_credentials(&self, update: CredentialsUpdate) -> Result<()>;

    /// Write the in-memory message store to durable storage.
    async fn flush_store(&self) -> Result<()>;

    /// Drop cached messages, keeping the newest `keep_per_chat` per chat.
    async fn trim_message_store(&self, keep_per_chat: usize) -> Result<()>;
}
