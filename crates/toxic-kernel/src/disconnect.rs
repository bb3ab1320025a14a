//! Disconnect events and their classification.
//!
//! Every connection close carries an optional numeric cause code. The code
//! alone decides which [`DisconnectClass`] the close falls into, and the
//! class alone decides how the orchestrator reacts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known cause codes reported by the messaging gateway.
pub mod codes {
    /// Credentials were revoked; the session must be paired again.
    pub const LOGGED_OUT: u16 = 401;
    /// The connection was lost or timed out.
    pub const CONNECTION_LOST: u16 = 408;
    /// The connection was closed by the remote end.
    pub const CONNECTION_CLOSED: u16 = 428;
    /// Another client took over the session.
    pub const CONNECTION_REPLACED: u16 = 440;
    /// Server-side session error.
    pub const BAD_SESSION: u16 = 500;
    /// Gateway temporarily unavailable.
    pub const UNAVAILABLE: u16 = 503;
    /// The server asked the client to reconnect.
    pub const RESTART_REQUIRED: u16 = 515;
}

/// A connection close as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectEvent {
    pub cause_code: Option<u16>,
    pub raw_error: String,
}

impl DisconnectEvent {
    pub fn new(cause_code: Option<u16>, raw_error: impl Into<String>) -> Self {
        Self {
            cause_code,
            raw_error: raw_error.into(),
        }
    }

    /// A close carrying a cause code.
    pub fn with_code(code: u16, raw_error: impl Into<String>) -> Self {
        Self::new(Some(code), raw_error)
    }

    /// A close with no cause code at all.
    pub fn without_code(raw_error: impl Into<String>) -> Self {
        Self::new(None, raw_error)
    }

    pub fn class(&self) -> DisconnectClass {
        classify(self.cause_code)
    }
}

/// How a disconnect is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectClass {
    /// Wipe credentials and pair again.
    LoggedOut,
    /// Quick reconnect, failure counter untouched.
    RestartRequired,
    /// Known network-level failure; backed off.
    Transient,
    /// Anything else; backed off more steeply.
    Unknown,
}

impl DisconnectClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::RestartRequired => "restart_required",
            Self::Transient => "transient",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DisconnectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a cause code to its class.
pub fn classify(cause_code: Option<u16>) -> DisconnectClass {
    match cause_code {
        Some(codes::LOGGED_OUT) => DisconnectClass::LoggedOut,
        Some(codes::RESTART_REQUIRED) => DisconnectClass::RestartRequired,
        Some(
            codes::CONNECTION_LOST
            | codes::CONNECTION_CLOSED
            | codes::BAD_SESSION
            | codes::UNAVAILABLE,
        ) => DisconnectClass::Transient,
        Some(_) | None => DisconnectClass::Unknown,
    }
}
