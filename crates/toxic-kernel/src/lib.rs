//! Toxic-MD connection lifecycle kernel.
//!
//! This crate keeps one messaging session alive against a transport whose
//! connection drops unpredictably:
//!
//! - **[`disconnect`]** -- cause codes and their [`DisconnectClass`].
//! - **[`backoff`]** -- the pure [`ReconnectPolicy`] that turns a class and
//!   the failure counter into a delay.
//! - **[`tasks`]** -- the per-epoch [`TaskRegistry`] of periodic jobs.
//! - **[`maintenance`]** -- the memory watchdog, session janitor and store
//!   flush registered at the start of every epoch.
//! - **[`session_files`]** -- the local credential directory.
//! - **[`transport`]** -- the [`Transport`] collaborator seam.
//! - **[`orchestrator`]** -- the state machine tying all of the above
//!   together.
//! - **[`error`]** -- kernel error types via [`thiserror`].

pub mod backoff;
pub mod disconnect;
pub mod error;
pub mod maintenance;
pub mod orchestrator;
pub mod session_files;
pub mod tasks;
pub mod transport;

// Re-export the most commonly used types at the crate root for convenience.
pub use backoff::{Decision, ReconnectPolicy};
pub use disconnect::{DisconnectClass, DisconnectEvent, classify};
pub use error::{KernelError, Result};
pub use maintenance::{MaintenanceConfig, MemorySampler, ProcessMemory};
pub use orchestrator::{
    ConnectionEpoch, LifecycleConfig, LifecyclePhase, LifecycleSnapshot, Orchestrator,
    OrchestratorHandle, ReconnectState,
};
pub use session_files::{SessionFiles, SweepReport};
pub use tasks::{FirstTick, TaskRegistry};
pub use transport::{CredentialsUpdate, Transport, TransportEvent, TransportEvents, event_channel};
