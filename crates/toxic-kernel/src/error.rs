//! Kernel error types.
//!
//! Lifecycle code surfaces failures through [`KernelError`]. None of these
//! stop the orchestrator: they are logged where the collaborator is called
//! and the state machine carries on.

use std::path::PathBuf;

/// Unified error type for the lifecycle kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Transport errors ---------------------------------------------------
    /// The transport collaborator failed a lifecycle call.
    #[error("transport error during {operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    // -- Session files ------------------------------------------------------
    /// Reading or deleting session credential files failed.
    #[error("session io error on {}: {source}", path.display())]
    SessionIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // -- Orchestrator -------------------------------------------------------
    /// The orchestrator task is gone and can no longer take commands.
    #[error("orchestrator is not running")]
    OrchestratorStopped,

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Shorthand for a [`KernelError::Transport`] with a displayable cause.
    pub fn transport(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            operation,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn session_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SessionIo {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
