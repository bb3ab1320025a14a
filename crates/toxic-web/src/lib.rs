//! HTTP liveness surface for Toxic-MD.
//!
//! Hosting platforms and keep-alive pingers poll these endpoints to decide
//! whether the process is healthy:
//!
//! - `GET /` -- a plain landing page.
//! - `GET /ping` -- `pong`.
//! - `GET /health` -- uptime, resident memory and a timestamp.
//! - `GET /status` -- the above plus the lifecycle phase, epoch and
//!   reconnect counters published by the orchestrator.

pub mod api;
pub mod server;
pub mod state;

use serde::{Deserialize, Serialize};

pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 10000,
        }
    }
}

/// Errors raised while running the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http server failed: {0}")]
    Serve(#[source] std::io::Error),
}
