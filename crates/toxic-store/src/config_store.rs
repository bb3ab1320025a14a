//! TTL-cached access to the bot's configuration documents.
//!
//! Reads go through a [`TtlCache`] per document family; every write path
//! invalidates the matching cache entry. Storage failures never escape:
//! reads degrade to a stale cached value or a default, writes report
//! [`WriteStatus::Failed`], and both are logged at `warn`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{Clock, SystemClock, TtlCache};
use crate::document::{DocumentBackend, DocumentKind, PersistentStore};
use crate::settings::{
    GroupSettings, GroupSettingsDocument, SettingValue, Settings, SettingsDocument,
    backfill_defaults,
};

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A fresh cache entry.
    Cache,
    /// Durable storage; the cache was refilled.
    Storage,
    /// An expired cache entry, served because storage failed.
    StaleCache,
    /// Nothing usable was available; a default was synthesized.
    Default,
}

/// A value together with the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: Source,
}

impl<T> Fetched<T> {
    fn new(value: T, source: Source) -> Self {
        Self { value, source }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Outcome of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Persisted,
    /// The operation was a no-op and nothing was written.
    Unchanged,
    Failed,
}

impl WriteStatus {
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted => write!(f, "persisted"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One line of a user's conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

type ConversationDocument = BTreeMap<String, Vec<ConversationEntry>>;

/// The two identifier lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UserList {
    Sudo,
    Banned,
}

impl UserList {
    fn document(self) -> DocumentKind {
        match self {
            Self::Sudo => DocumentKind::SudoUsers,
            Self::Banned => DocumentKind::BannedUsers,
        }
    }
}

/// Cache policy for a [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct ConfigStoreOptions {
    pub settings_ttl: Duration,
    pub user_list_ttl: Duration,
    pub group_ttl: Duration,
    pub group_capacity: usize,
    pub clock: Arc<dyn Clock>,
}

impl Default for ConfigStoreOptions {
    fn default() -> Self {
        Self {
            settings_ttl: Duration::from_secs(30),
            user_list_ttl: Duration::from_secs(60),
            group_ttl: Duration::from_secs(60),
            group_capacity: 500,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

/// Settings, group settings, user lists and transcripts over a
/// [`PersistentStore`].
///
/// Every read-modify-write holds the lock of its document from load to
/// save, so concurrent updates to one document are applied in turn.
pub struct ConfigStore {
    docs: PersistentStore,
    write_locks: [Mutex<()>; DocumentKind::ALL.len()],
    settings: TtlCache<(), Settings>,
    groups: TtlCache<String, GroupSettings>,
    user_lists: TtlCache<UserList, Vec<String>>,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn DocumentBackend>, options: ConfigStoreOptions) -> Self {
        let ConfigStoreOptions {
            settings_ttl,
            user_list_ttl,
            group_ttl,
            group_capacity,
            clock,
        } = options;

        Self {
            docs: PersistentStore::new(backend),
            write_locks: std::array::from_fn(|_| Mutex::new(())),
            settings: TtlCache::builder("settings")
                .ttl(settings_ttl)
                .clock(Arc::clone(&clock))
                .build(),
            groups: TtlCache::builder("group_settings")
                .ttl(group_ttl)
                .max_entries(group_capacity)
                .clock(Arc::clone(&clock))
                .build(),
            user_lists: TtlCache::builder("user_lists")
                .ttl(user_list_ttl)
                .clock(clock)
                .build(),
        }
    }

    /// Backfill default settings and create every missing document.
    pub async fn initialize(&self) -> WriteStatus {
        let mut status = WriteStatus::Unchanged;

        let settings_guard = self.lock(DocumentKind::Settings).await;
        match self.docs.load::<SettingsDocument>(DocumentKind::Settings).await {
            Ok(mut doc) => {
                let added = backfill_defaults(&mut doc);
                if added > 0 {
                    status = match self.docs.save(DocumentKind::Settings, &doc).await {
                        Ok(()) => {
                            info!(added, "default settings backfilled");
                            WriteStatus::Persisted
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to backfill default settings");
                            WriteStatus::Failed
                        }
                    };
                }
            }
            Err(e) => {
                warn!(error = %e, "settings document unreadable, defaults not backfilled");
                status = WriteStatus::Failed;
            }
        }
        drop(settings_guard);
        self.settings.invalidate(&());

        for kind in DocumentKind::ALL.into_iter().filter(|k| *k != DocumentKind::Settings) {
            let _guard = self.lock(kind).await;
            match self.docs.ensure(kind).await {
                Ok(true) if status == WriteStatus::Unchanged => status = WriteStatus::Persisted,
                Ok(_) => {}
                Err(e) => {
                    warn!(document = kind.name(), error = %e, "failed to create document");
                    status = WriteStatus::Failed;
                }
            }
        }

        info!(backend = self.docs.backend_name(), %status, "config store initialized");
        status
    }

    // -- global settings ----------------------------------------------------

    /// Current global settings.
    pub async fn settings(&self) -> Fetched<Settings> {
        if let Some(settings) = self.settings.get(&()) {
            return Fetched::new(settings, Source::Cache);
        }

        match self.docs.load::<SettingsDocument>(DocumentKind::Settings).await {
            Ok(doc) => {
                let settings = Settings::from_document(&doc);
                self.settings.insert((), settings.clone());
                Fetched::new(settings, Source::Storage)
            }
            Err(e) => {
                warn!(error = %e, "settings read failed");
                match self.settings.get_stale(&()) {
                    Some(stale) => Fetched::new(stale, Source::StaleCache),
                    None => Fetched::new(Settings::empty(), Source::Default),
                }
            }
        }
    }

    /// Persist one global setting. The settings cache is dropped whatever
    /// the outcome.
    pub async fn update_setting(&self, key: &str, value: impl Into<SettingValue>) -> WriteStatus {
        let value = value.into();
        let status = self.write_setting(key, &value).await;
        self.settings.invalidate(&());
        debug!(key, %value, %status, "setting updated");
        status
    }

    async fn write_setting(&self, key: &str, value: &SettingValue) -> WriteStatus {
        let _guard = self.lock(DocumentKind::Settings).await;
        let mut doc = match self.docs.load::<SettingsDocument>(DocumentKind::Settings).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(key, error = %e, "settings document unreadable, update dropped");
                return WriteStatus::Failed;
            }
        };

        let encoded = Settings::encode_value(value);
        if doc.get(key) == Some(&encoded) {
            return WriteStatus::Unchanged;
        }
        doc.insert(key.to_string(), encoded);
        self.persist(DocumentKind::Settings, &doc).await
    }

    /// Drop the cached global settings.
    pub fn invalidate_settings(&self) {
        self.settings.invalidate(&());
    }

    // -- group settings -----------------------------------------------------

    /// Settings for one group. Missing records are synthesized from the
    /// global settings and cached, but not written.
    pub async fn group_settings(&self, group_id: &str) -> Fetched<GroupSettings> {
        let key = group_id.to_string();
        if let Some(record) = self.groups.get(&key) {
            return Fetched::new(record, Source::Cache);
        }

        match self
            .docs
            .load::<GroupSettingsDocument>(DocumentKind::GroupSettings)
            .await
        {
            Ok(mut doc) => match doc.remove(group_id) {
                Some(record) => {
                    self.groups.insert(key, record.clone());
                    Fetched::new(record, Source::Storage)
                }
                None => {
                    let record = self.default_group_record().await;
                    self.groups.insert(key, record.clone());
                    Fetched::new(record, Source::Default)
                }
            },
            Err(e) => {
                warn!(group_id, error = %e, "group settings read failed");
                match self.groups.get_stale(&key) {
                    Some(stale) => Fetched::new(stale, Source::StaleCache),
                    None => Fetched::new(self.default_group_record().await, Source::Default),
                }
            }
        }
    }

    /// Read-modify-write one key of a group record.
    pub async fn update_group_setting(
        &self,
        group_id: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> WriteStatus {
        let value = value.into();
        let status = self.write_group_setting(group_id, key, value).await;
        self.groups.invalidate(&group_id.to_string());
        debug!(group_id, key, %status, "group setting updated");
        status
    }

    async fn write_group_setting(&self, group_id: &str, key: &str, value: SettingValue) -> WriteStatus {
        let _guard = self.lock(DocumentKind::GroupSettings).await;
        let mut doc = match self
            .docs
            .load::<GroupSettingsDocument>(DocumentKind::GroupSettings)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                warn!(group_id, error = %e, "group settings document unreadable, update dropped");
                return WriteStatus::Failed;
            }
        };

        let existing = doc.get(group_id).cloned();
        let mut record = match existing.clone() {
            Some(record) => record,
            None => self.default_group_record().await,
        };
        if let Err(e) = record.set(key, value) {
            warn!(group_id, key, error = %e, "group setting rejected");
            return WriteStatus::Failed;
        }
        if existing.as_ref() == Some(&record) {
            return WriteStatus::Unchanged;
        }

        doc.insert(group_id.to_string(), record);
        self.persist(DocumentKind::GroupSettings, &doc).await
    }

    async fn default_group_record(&self) -> GroupSettings {
        GroupSettings::inherit(&self.settings().await.value)
    }

    // -- user lists ---------------------------------------------------------

    pub async fn sudo_users(&self) -> Fetched<Vec<String>> {
        self.user_list(UserList::Sudo).await
    }

    pub async fn banned_users(&self) -> Fetched<Vec<String>> {
        self.user_list(UserList::Banned).await
    }

    pub async fn is_sudo(&self, user_id: &str) -> bool {
        self.sudo_users().await.value.iter().any(|u| u == user_id)
    }

    pub async fn is_banned(&self, user_id: &str) -> bool {
        self.banned_users().await.value.iter().any(|u| u == user_id)
    }

    pub async fn add_sudo_user(&self, user_id: &str) -> WriteStatus {
        self.modify_list(UserList::Sudo, user_id, true).await
    }

    pub async fn remove_sudo_user(&self, user_id: &str) -> WriteStatus {
        self.modify_list(UserList::Sudo, user_id, false).await
    }

    pub async fn ban_user(&self, user_id: &str) -> WriteStatus {
        self.modify_list(UserList::Banned, user_id, true).await
    }

    pub async fn unban_user(&self, user_id: &str) -> WriteStatus {
        self.modify_list(UserList::Banned, user_id, false).await
    }

    async fn user_list(&self, list: UserList) -> Fetched<Vec<String>> {
        if let Some(users) = self.user_lists.get(&list) {
            return Fetched::new(users, Source::Cache);
        }

        match self.docs.load::<Vec<String>>(list.document()).await {
            Ok(users) => {
                self.user_lists.insert(list, users.clone());
                Fetched::new(users, Source::Storage)
            }
            Err(e) => {
                warn!(document = list.document().name(), error = %e, "user list read failed");
                match self.user_lists.get_stale(&list) {
                    Some(stale) => Fetched::new(stale, Source::StaleCache),
                    None => Fetched::new(Vec::new(), Source::Default),
                }
            }
        }
    }

    async fn modify_list(&self, list: UserList, user_id: &str, present: bool) -> WriteStatus {
        let document = list.document();
        let guard = self.lock(document).await;
        let status = match self.docs.load::<Vec<String>>(document).await {
            Ok(mut users) => {
                let contains = users.iter().any(|u| u == user_id);
                match (present, contains) {
                    (true, true) | (false, false) => WriteStatus::Unchanged,
                    (true, false) => {
                        users.push(user_id.to_string());
                        self.persist(document, &users).await
                    }
                    (false, true) => {
                        users.retain(|u| u != user_id);
                        self.persist(document, &users).await
                    }
                }
            }
            Err(e) => {
                warn!(document = document.name(), user_id, error = %e, "user list unreadable, update dropped");
                WriteStatus::Failed
            }
        };
        drop(guard);
        self.user_lists.invalidate(&list);
        debug!(document = document.name(), user_id, present, %status, "user list updated");
        status
    }

    // -- conversations ------------------------------------------------------

    /// Append a transcript line stamped with the current UTC time.
    pub async fn save_conversation(&self, user_id: &str, role: &str, message: &str) -> WriteStatus {
        let _guard = self.lock(DocumentKind::Conversations).await;
        let mut doc = match self
            .docs
            .load::<ConversationDocument>(DocumentKind::Conversations)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                warn!(user_id, error = %e, "conversation log unreadable, message dropped");
                return WriteStatus::Failed;
            }
        };

        doc.entry(user_id.to_string())
            .or_default()
            .push(ConversationEntry {
                role: role.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            });
        self.persist(DocumentKind::Conversations, &doc).await
    }

    /// A user's transcript, oldest first.
    pub async fn recent_messages(&self, user_id: &str) -> Vec<ConversationEntry> {
        match self
            .docs
            .load::<ConversationDocument>(DocumentKind::Conversations)
            .await
        {
            Ok(mut doc) => doc.remove(user_id).unwrap_or_default(),
            Err(e) => {
                warn!(user_id, error = %e, "conversation log read failed");
                Vec::new()
            }
        }
    }

    pub async fn delete_user_history(&self, user_id: &str) -> WriteStatus {
        let _guard = self.lock(DocumentKind::Conversations).await;
        let mut doc = match self
            .docs
            .load::<ConversationDocument>(DocumentKind::Conversations)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                warn!(user_id, error = %e, "conversation log unreadable, delete dropped");
                return WriteStatus::Failed;
            }
        };

        if doc.remove(user_id).is_none() {
            return WriteStatus::Unchanged;
        }
        self.persist(DocumentKind::Conversations, &doc).await
    }

    // -- helpers ------------------------------------------------------------

    async fn lock(&self, kind: DocumentKind) -> MutexGuard<'_, ()> {
        self.write_locks[kind as usize].lock().await
    }

    async fn persist<T: Serialize + ?Sized>(&self, kind: DocumentKind, value: &T) -> WriteStatus {
        match self.docs.save(kind, value).await {
            Ok(()) => WriteStatus::Persisted,
            Err(e) => {
                warn!(document = kind.name(), error = %e, "document write failed");
                WriteStatus::Failed
            }
        }
    }

    /// One-line summary of every cache's hit/miss counters.
    pub fn cache_report(&self) -> String {
        format!(
            "settings[{}] groups[{}] user_lists[{}]",
            self.settings.stats(),
            self.groups.stats(),
            self.user_lists.stats()
        )
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("docs", &self.docs)
            .field("settings", &self.settings)
            .field("groups", &self.groups)
            .field("user_lists", &self.user_lists)
            .finish()
    }
}
