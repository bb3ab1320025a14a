//! Local session credential directory.
//!
//! The transport keeps its pairing credentials and signal keys as loose
//! files in one directory. Two operations touch it from the lifecycle side:
//! a full [`SessionFiles::wipe`] after a logout, and the periodic
//! [`SessionFiles::sweep`] that deletes stale non-credential files.
//!
//! Both use blocking `std::fs` calls. The directory holds at most a few
//! thousand small files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{KernelError, Result};

/// Exact file names that are always kept by the sweep.
const KEEP_NAMES: &[&str] = &["creds.json", "app-state-sync-version.json"];

/// File name prefixes that are always kept by the sweep.
const KEEP_PREFIXES: &[&str] = &["pre-key-", "session-", "sender-key-", "app-state-sync-key-"];

/// Whether `name` is credential material the sweep must never delete.
pub fn is_credential_file(name: &str) -> bool {
    KEEP_NAMES.contains(&name) || KEEP_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
}

/// Handle to the session directory.
#[derive(Debug, Clone)]
pub struct SessionFiles {
    dir: PathBuf,
}

impl SessionFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether pairing credentials are present.
    pub fn has_credentials(&self) -> bool {
        self.dir.join("creds.json").is_file()
    }

    /// Delete every file in the directory and leave it empty.
    ///
    /// A missing directory is not an error. Returns the number of entries
    /// that were removed.
    pub fn wipe(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries.count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "session directory already absent");
                return Ok(0);
            }
            Err(e) => return Err(KernelError::session_io(&self.dir, e)),
        };

        fs::remove_dir_all(&self.dir).map_err(|e| KernelError::session_io(&self.dir, e))?;
        fs::create_dir_all(&self.dir).map_err(|e| KernelError::session_io(&self.dir, e))?;
        info!(dir = %self.dir.display(), removed = entries, "session credentials wiped");
        Ok(entries)
    }

    /// Delete non-credential files last modified more than `retention`
    /// before `now`.
    ///
    /// Files that cannot be inspected or removed are skipped with a
    /// warning; only an unreadable directory fails the sweep.
    pub fn sweep(&self, retention: Duration, now: SystemTime) -> Result<SweepReport> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SweepReport::default()),
            Err(e) => return Err(KernelError::session_io(&self.dir, e)),
        };

        let mut report = SweepReport::default();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat session file");
                    continue;
                }
            };

            if is_credential_file(&name) {
                report.kept += 1;
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age <= retention {
                report.kept += 1;
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed += 1;
                    debug!(path = %path.display(), age_secs = age.as_secs(), "stale session file removed");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove session file"),
            }
        }

        if report.removed > 0 {
            info!(
                dir = %self.dir.display(),
                removed = report.removed,
                kept = report.kept,
                "session directory swept"
            );
        }
        Ok(report)
    }
}
