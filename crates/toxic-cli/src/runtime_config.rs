//! Effective process configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults, the TOML file
//! (`config/default.toml` unless `--config` says otherwise), the `.env`
//! file, and the process environment. `.env` is loaded into the process
//! environment by `main` before [`RuntimeConfig::load`] runs, and `dotenvy`
//! never overrides variables that are already set.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toxic_kernel::{LifecycleConfig, MaintenanceConfig, ReconnectPolicy};
use toxic_store::ConfigStoreOptions;
use toxic_web::WebConfig;
use url::Url;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which [`toxic_store::DocumentBackend`] holds the documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend `{other}` (expected json or sqlite)")),
        }
    }
}

/// `[store]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub backend: StoreBackend,
    pub settings_ttl_ms: u64,
    pub user_list_ttl_ms: u64,
    pub group_ttl_ms: u64,
    pub group_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backend: StoreBackend::Json,
            settings_ttl_ms: 30_000,
            user_list_ttl_ms: 60_000,
            group_ttl_ms: 60_000,
            group_capacity: 500,
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> ConfigStoreOptions {
        ConfigStoreOptions {
            settings_ttl: Duration::from_millis(self.settings_ttl_ms),
            user_list_ttl: Duration::from_millis(self.user_list_ttl_ms),
            group_ttl: Duration::from_millis(self.group_ttl_ms),
            group_capacity: self.group_capacity,
            ..ConfigStoreOptions::default()
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("toxic.db")
    }
}

/// `[gateway]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket endpoint of the messaging gateway.
    pub url: String,
    /// Directory holding pairing credentials and signal keys.
    pub session_dir: PathBuf,
    /// Name reported on the HTTP status page.
    pub bot_name: String,
    pub connect_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8088/gateway".into(),
            session_dir: PathBuf::from("Session"),
            bot_name: "Toxic-MD".into(),
            connect_timeout_secs: 20,
        }
    }
}

impl GatewayConfig {
    pub fn parsed_url(&self) -> Result<Url> {
        Url::parse(&self.url).with_context(|| format!("invalid gateway url `{}`", self.url))
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub lifecycle: ReconnectPolicy,
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
    pub web: WebConfig,
    pub gateway: GatewayConfig,
}

impl RuntimeConfig {
    /// Read `path`, apply process environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML file at `path`. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Apply overrides from `lookup`. Unset and empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource(lookup);

        let policy = &mut self.lifecycle;
        if let Some(ms) = env.parse::<u64>("RECONNECT_BASE_DELAY")? {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(growth) = env.parse::<f64>("RECONNECT_GROWTH")? {
            policy.transient_growth = growth;
        }
        if let Some(growth) = env.parse::<f64>("RECONNECT_UNKNOWN_GROWTH")? {
            policy.unknown_growth = growth;
        }
        if let Some(ms) = env.parse::<u64>("RECONNECT_DELAY_CAP")? {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(max) = env.parse::<u32>("MAX_RECONNECT_ATTEMPTS")? {
            policy.max_attempts = max;
        }
        if let Some(ms) = env.parse::<u64>("RECONNECT_COOLDOWN")? {
            policy.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("LOGGED_OUT_DELAY")? {
            policy.logged_out_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("RESTART_DELAY")? {
            policy.restart_delay = Duration::from_millis(ms);
        }

        let maintenance = &mut self.maintenance;
        if let Some(hours) = env.parse::<u64>("SESSION_CLEANUP_HOURS")? {
            let secs = hours
                .checked_mul(60 * 60)
                .with_context(|| format!("SESSION_CLEANUP_HOURS={hours} is too large"))?;
            maintenance.session_retention = Duration::from_secs(secs);
        }
        if let Some(mb) = env.parse::<u64>("MAX_MEMORY_MB")? {
            maintenance.memory_ceiling_mb = mb;
        }
        if let Some(ms) = env.parse::<u64>("STORE_WRITE_INTERVAL")? {
            maintenance.store_flush_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env.parse::<u64>("SETTINGS_CACHE_TTL")? {
            self.store.settings_ttl_ms = ms;
        }
        if let Some(dir) = env.get("TOXIC_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env.parse::<StoreBackend>("TOXIC_STORE_BACKEND")? {
            self.store.backend = backend;
        }

        if let Some(dir) = env.get("TOXIC_SESSION_DIR") {
            self.gateway.session_dir = PathBuf::from(dir);
        }
        if let Some(url) = env.get("TOXIC_GATEWAY_URL") {
            self.gateway.url = url;
        }
        if let Some(port) = env.parse::<u16>("PORT")? {
            self.web.port = port;
        }

        Ok(())
    }

    /// Reject values the reconnect policy or the epoch jobs cannot work with.
    pub fn validate(&self) -> Result<()> {
        let policy = &self.lifecycle;
        for (name, growth) in [
            ("transient_growth", policy.transient_growth),
            ("unknown_growth", policy.unknown_growth),
        ] {
            if !growth.is_finite() || growth < 1.0 {
                bail!("lifecycle.{name} must be a finite number >= 1.0, got {growth}");
            }
        }
        if policy.max_attempts == 0 {
            bail!("lifecycle.max_attempts must be at least 1");
        }
        if policy.max_delay < policy.base_delay {
            bail!(
                "lifecycle.max_delay ({} ms) is below base_delay ({} ms)",
                policy.max_delay.as_millis(),
                policy.base_delay.as_millis()
            );
        }
        let maintenance = &self.maintenance;
        for (name, interval) in [
            ("memory_check_interval", maintenance.memory_check_interval),
            ("janitor_interval", maintenance.janitor_interval),
            ("store_flush_interval_ms", maintenance.store_flush_interval),
        ] {
            if interval.is_zero() {
                bail!("maintenance.{name} must be greater than zero");
            }
        }
        self.gateway.parsed_url()?;
        Ok(())
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            policy: self.lifecycle.clone(),
            maintenance: self.maintenance.clone(),
            session_dir: self.gateway.session_dir.clone(),
        }
    }
}

struct EnvSource<F>(F);

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid value `{raw}` for {name}: {e}")),
        }
    }
}
