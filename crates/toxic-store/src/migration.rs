//! Schema migrations for the SQLite document backend.
//!
//! Versions are tracked in a `_migrations` table; each pending step runs in
//! its own transaction and is recorded on success, so reopening a database
//! is a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "documents: one JSON body per named document",
        sql: r#"
            CREATE TABLE documents (
                name       TEXT PRIMARY KEY,
                body       TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against `conn`.
///
/// Synchronous; call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;

    let current = current_version(conn)?;
    let mut applied = 0usize;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(current_version = current, "document schema is up to date");
    } else {
        info!(applied, from = current, "document schema migrated");
    }
    Ok(())
}

/// Latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: e.to_string(),
    };

    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // Dropping the transaction without commit rolls it back.
    let tx = conn.unchecked_transaction().map_err(fail)?;
    tx.execute_batch(migration.sql).map_err(fail)?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp()
        ],
    )
    .map_err(fail)?;
    tx.commit().map_err(fail)
}
