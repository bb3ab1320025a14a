//! # toxic-store
//!
//! Configuration storage for the Toxic-MD session keeper.
//!
//! Durable JSON documents (settings, group settings, sudo and banned user
//! lists, conversation transcripts) live behind a [`DocumentBackend`]:
//! loose JSON files or a single SQLite database. The [`ConfigStore`] puts a
//! [`TtlCache`] in front of each document family so hot reads never touch
//! storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ConfigStore  (Fetched / WriteStatus)         │
//! ├──────────────────────────────────────────────┤
//! │  TtlCache  settings 30s │ groups 60s (≤500)   │
//! │            user lists 60s                     │
//! ├──────────────────────────────────────────────┤
//! │  PersistentStore  (self-healing documents)    │
//! ├──────────────────────────────────────────────┤
//! │  JsonFileBackend │ SqliteBackend │ Memory     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use toxic_store::{ConfigStore, ConfigStoreOptions, JsonFileBackend};
//!
//! let store = ConfigStore::new(
//!     Arc::new(JsonFileBackend::new("data")),
//!     ConfigStoreOptions::default(),
//! );
//! store.initialize().await;
//! let prefix = store.settings().await.value.prefix().to_string();
//! ```

pub mod cache;
pub mod config_store;
pub mod db;
pub mod document;
pub mod error;
pub mod migration;
pub mod settings;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, Clock, ManualClock, SystemClock, TtlCache, TtlCacheBuilder};
pub use config_store::{
    ConfigStore, ConfigStoreOptions, ConversationEntry, Fetched, Source, WriteStatus,
};
pub use db::Database;
pub use document::{
    DocumentBackend, DocumentKind, JsonFileBackend, MemoryBackend, PersistentStore, SqliteBackend,
};
pub use error::{StoreError, StoreResult};
pub use settings::{GroupSettings, Mode, SettingValue, Settings, SettingsDocument};
