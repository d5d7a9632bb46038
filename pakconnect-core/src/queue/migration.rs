// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Queue Schema Migrations
//!
//! Versioned migrations applied in one exclusive transaction. Applied
//! versions are tracked in `schema_version`; a failing step rolls the whole
//! batch back.

use rusqlite::{params, Connection};

use super::QueueError;
use crate::clock::now_millis;

/// A single schema migration step.
pub struct Migration {
    /// Monotonically increasing version number (starting at 1).
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Runs schema migrations against a database connection.
pub struct MigrationRunner;

impl MigrationRunner {
    /// Applies every migration newer than the current schema version.
    pub fn run(conn: &Connection, migrations: &[Migration]) -> Result<(), QueueError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;

        let current_version = Self::current_version(conn)?;
        let pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| m.version > current_version)
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        for window in pending.windows(2) {
            if window[0].version >= window[1].version {
                return Err(QueueError::Migration(format!(
                    "Migrations are not in order: v{} before v{}",
                    window[0].version, window[1].version
                )));
            }
        }

        conn.execute_batch("BEGIN EXCLUSIVE TRANSACTION;")?;

        for migration in &pending {
            let result = conn
                .execute_batch(migration.sql)
                .map_err(|e| {
                    format!(
                        "Migration v{} '{}' failed: {}",
                        migration.version, migration.name, e
                    )
                })
                .and_then(|()| {
                    conn.execute(
                        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                        params![migration.version, now_millis() as i64],
                    )
                    .map(|_| ())
                    .map_err(|e| {
                        format!("Failed to record migration v{}: {}", migration.version, e)
                    })
                });

            if let Err(message) = result {
                conn.execute_batch("ROLLBACK;")?;
                return Err(QueueError::Migration(message));
            }
        }

        conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    /// Returns the current schema version, or 0 if nothing was applied.
    pub fn current_version(conn: &Connection) -> Result<u32, QueueError> {
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        let version: Option<u32> =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })?;

        Ok(version.unwrap_or(0))
    }
}

/// Every queue migration in version order. New migrations are appended.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "outbound_queue",
            sql: MIGRATION_V1_OUTBOUND_QUEUE,
        },
        Migration {
            version: 2,
            name: "dispatch_indexes",
            sql: MIGRATION_V2_DISPATCH_INDEXES,
        },
    ]
}

const MIGRATION_V1_OUTBOUND_QUEUE: &str = "
    CREATE TABLE IF NOT EXISTS outbound_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        chat_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        payload BLOB NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        next_retry_at INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        expires_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        last_error TEXT,
        is_favorite INTEGER NOT NULL DEFAULT 0
    );
";

const MIGRATION_V2_DISPATCH_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_queue_recipient ON outbound_queue(recipient_id, status);
    CREATE INDEX IF NOT EXISTS idx_queue_dispatch ON outbound_queue(status, priority DESC, seq);
    CREATE INDEX IF NOT EXISTS idx_queue_expiry ON outbound_queue(expires_at);
";
