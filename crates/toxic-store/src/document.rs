//! Durable JSON documents behind a pluggable backend.
//!
//! A [`DocumentBackend`] only moves raw bodies in and out of storage. The
//! [`PersistentStore`] on top of it parses them, and creates a document
//! with its default body the first time it is found missing. A document
//! that exists but does not parse is reported as an error and left alone.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// The five documents owned by the config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Settings,
    GroupSettings,
    Conversations,
    SudoUsers,
    BannedUsers,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 5] = [
        Self::Settings,
        Self::GroupSettings,
        Self::Conversations,
        Self::SudoUsers,
        Self::BannedUsers,
    ];

    /// Logical name, also the row key in the SQLite backend.
    pub fn name(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::GroupSettings => "group_settings",
            Self::Conversations => "conversations",
            Self::SudoUsers => "sudo_users",
            Self::BannedUsers => "banned_users",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Settings => "settings.json",
            Self::GroupSettings => "group_settings.json",
            Self::Conversations => "conversations.json",
            Self::SudoUsers => "sudo_users.json",
            Self::BannedUsers => "banned_users.json",
        }
    }

    /// Body written when the document is first created.
    ///
    /// The settings default is `{}`; the config store backfills the default
    /// key set into it during initialization.
    pub fn default_body(self) -> &'static str {
        match self {
            Self::Settings | Self::GroupSettings | Self::Conversations => "{}",
            Self::SudoUsers | Self::BannedUsers => "[]",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Raw storage for named documents.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Read a document body. `Ok(None)` means the document does not exist.
    async fn read(&self, kind: DocumentKind) -> StoreResult<Option<String>>;

    /// Replace a document body.
    async fn write(&self, kind: DocumentKind, body: String) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per document inside a data directory.
///
/// Each write goes to its own hidden temp file, which is then renamed into
/// place, so concurrent writers never share a partial file.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: DocumentKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

#[async_trait]
impl DocumentBackend for JsonFileBackend {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn read(&self, kind: DocumentKind) -> StoreResult<Option<String>> {
        let path = self.path(kind);
        match fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    async fn write(&self, kind: DocumentKind, body: String) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(self.dir.display().to_string(), e))?;

        let dir = self.dir.clone();
        let path = self.path(kind);
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut temp = tempfile::Builder::new()
                .prefix(&format!(".{}.", kind.file_name()))
                .suffix(".tmp")
                .tempfile_in(&dir)
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
            temp.write_all(body.as_bytes())
                .map_err(|e| StoreError::io(temp.path().display().to_string(), e))?;
            temp.persist(&target)
                .map_err(|e| StoreError::io(target.display().to_string(), e.error))?;
            Ok(())
        })
        .await??;

        debug!(document = kind.name(), path = %path.display(), "document written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Every document as one row of the `documents` table.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    /// Wrap an already-migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open `path`, run migrations, and wrap the result.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::open_and_migrate(path).await?;
        Ok(Self::new(db))
    }
}

#[async_trait]
impl DocumentBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, kind: DocumentKind) -> StoreResult<Option<String>> {
        let name = kind.name();
        self.db
            .execute(move |conn| {
                let body = conn
                    .query_row(
                        "SELECT body FROM documents WHERE name = ?1",
                        rusqlite::params![name],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(body)
            })
            .await
    }

    async fn write(&self, kind: DocumentKind, body: String) -> StoreResult<()> {
        let name = kind.name();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO documents (name, body, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET body = excluded.body,
                                                     updated_at = excluded.updated_at",
                    rusqlite::params![name, body, chrono::Utc::now().timestamp()],
                )?;
                debug!(document = name, "document row upserted");
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Volatile backend for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<DocumentKind, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a raw body.
    pub fn put_raw(&self, kind: DocumentKind, body: impl Into<String>) {
        self.lock().insert(kind, body.into());
    }

    /// Current raw body, if present.
    pub fn raw(&self, kind: DocumentKind) -> Option<String> {
        self.lock().get(&kind).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentKind, String>> {
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, kind: DocumentKind) -> StoreResult<Option<String>> {
        Ok(self.raw(kind))
    }

    async fn write(&self, kind: DocumentKind, body: String) -> StoreResult<()> {
        self.put_raw(kind, body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistent store
// ---------------------------------------------------------------------------

/// Typed, self-healing access to documents.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn DocumentBackend>,
}

impl PersistentStore {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Load and parse a document, creating it from its default body when
    /// missing.
    pub async fn load<T: DeserializeOwned>(&self, kind: DocumentKind) -> StoreResult<T> {
        let body = match self.backend.read(kind).await? {
            Some(body) => body,
            None => {
                info!(document = kind.name(), backend = self.backend.name(), "creating missing document");
                let body = kind.default_body().to_string();
                self.backend.write(kind, body.clone()).await?;
                body
            }
        };
        serde_json::from_str(&body).map_err(|source| StoreError::Json {
            document: kind.name(),
            source,
        })
    }

    /// Serialize and write a document.
    pub async fn save<T: Serialize + ?Sized>(&self, kind: DocumentKind, value: &T) -> StoreResult<()> {
        let body = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
            document: kind.name(),
            source,
        })?;
        self.backend.write(kind, body).await
    }

    /// Create the document from its default body if it does not exist.
    ///
    /// Returns `true` when it was created.
    pub async fn ensure(&self, kind: DocumentKind) -> StoreResult<bool> {
        if self.backend.read(kind).await?.is_some() {
            return Ok(false);
        }
        self.backend
            .write(kind, kind.default_body().to_string())
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn load_creates_missing_document() {
        let backend = Arc::new(MemoryBackend::new());
        let store = PersistentStore::new(backend.clone());

        let users: Vec<String> = store.load(DocumentKind::SudoUsers).await.unwrap();
        assert!(users.is_empty());
        assert_eq!(backend.raw(DocumentKind::SudoUsers).as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error_and_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_raw(DocumentKind::GroupSettings, "{not json");
        let store = PersistentStore::new(backend.clone());

        let result: StoreResult<BTreeMap<String, serde_json::Value>> =
            store.load(DocumentKind::GroupSettings).await;
        assert!(matches!(result, Err(StoreError::Json { document: "group_settings", .. })));
        assert_eq!(
            backend.raw(DocumentKind::GroupSettings).as_deref(),
            Some("{not json")
        );
    }

    #[tokio::test]
    async fn ensure_reports_creation_once() {
        let store = PersistentStore::new(Arc::new(MemoryBackend::new()));
        assert!(store.ensure(DocumentKind::Conversations).await.unwrap());
        assert!(!store.ensure(DocumentKind::Conversations).await.unwrap());
    }

    #[tokio::test]
    async fn json_files_are_written_atomically_and_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("data"));
        let store = PersistentStore::new(Arc::new(backend.clone()));

        store
            .save(DocumentKind::BannedUsers, &vec!["a@s.whatsapp.net".to_string()])
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(backend.path(DocumentKind::BannedUsers)).unwrap();
        assert!(on_disk.contains('\n'));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("data"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let back: Vec<String> = store.load(DocumentKind::BannedUsers).await.unwrap();
        assert_eq!(back, vec!["a@s.whatsapp.net".to_string()]);
    }

    #[tokio::test]
    async fn json_backend_reads_missing_file_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path());
        assert!(backend.read(DocumentKind::Settings).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_backend_upserts_rows() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let backend = SqliteBackend::new(db);

        assert!(backend.read(DocumentKind::Settings).await.unwrap().is_none());
        backend
            .write(DocumentKind::Settings, r#"{"prefix":"."}"#.into())
            .await
            .unwrap();
        backend
            .write(DocumentKind::Settings, r#"{"prefix":"!"}"#.into())
            .await
            .unwrap();

        let body = backend.read(DocumentKind::Settings).await.unwrap();
        assert_eq!(body.as_deref(), Some(r#"{"prefix":"!"}"#));
    }
}
