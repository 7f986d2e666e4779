// crates/context-relay-store-sqlite/src/migrations.rs
// ============================================================================
// Module: Schema Migrations
// Description: Numbered, idempotent schema migration sequence.
// Purpose: Bring a relay database to the current schema version at open.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! The `store_meta` table carries a single schema version row. At open the
//! store applies every migration above the stored version, in order, each in
//! its own transaction, and records the new version in the same transaction.
//! Opening a database from a future schema version fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::store::StoreError;

// ============================================================================
// SECTION: Migration Table
// ============================================================================

/// Current schema version produced by the migration sequence.
pub const SCHEMA_VERSION: i64 = 3;

/// A single schema migration step.
struct Migration {
    /// Version this step migrates the schema to.
    version: i64,
    /// Batch SQL applied for the step.
    sql: &'static str,
}

/// All migrations in order. Append new steps at the end and bump
/// [`SCHEMA_VERSION`]; never edit an applied step.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "CREATE TABLE documents (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  doc_type TEXT NOT NULL,
                  name TEXT NOT NULL,
                  project TEXT NOT NULL DEFAULT '',
                  content BLOB NOT NULL,
                  metadata TEXT NOT NULL DEFAULT '{}',
                  cached_at INTEGER NOT NULL,
                  last_accessed_at INTEGER NOT NULL,
                  is_critical INTEGER NOT NULL DEFAULT 0,
                  size_bytes INTEGER NOT NULL,
                  UNIQUE (doc_type, name, project)
              );
              CREATE INDEX idx_documents_lru
                  ON documents (is_critical, last_accessed_at, id);
              CREATE TABLE memories (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  name TEXT NOT NULL,
                  project TEXT NOT NULL DEFAULT '',
                  content BLOB NOT NULL,
                  metadata TEXT NOT NULL DEFAULT '{}',
                  cached_at INTEGER NOT NULL,
                  last_accessed_at INTEGER NOT NULL,
                  size_bytes INTEGER NOT NULL,
                  UNIQUE (name, project)
              );
              CREATE INDEX idx_memories_lru
                  ON memories (last_accessed_at, id);
              CREATE TABLE sync_queue (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  operation TEXT NOT NULL,
                  payload TEXT NOT NULL,
                  created_at INTEGER NOT NULL,
                  status TEXT NOT NULL DEFAULT 'pending',
                  attempts INTEGER NOT NULL DEFAULT 0,
                  last_attempt_at INTEGER,
                  last_error TEXT
              );
              CREATE INDEX idx_sync_queue_status
                  ON sync_queue (status, created_at, id);",
    },
    Migration {
        version: 2,
        sql: "CREATE TABLE connection_log (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  timestamp_ms INTEGER NOT NULL,
                  state TEXT NOT NULL,
                  latency_ms INTEGER,
                  error_message TEXT
              );
              CREATE INDEX idx_connection_log_time
                  ON connection_log (timestamp_ms);",
    },
    // Documents and memories share one logical LRU, but their AUTOINCREMENT
    // ids are independent sequences, so id cannot break access-time ties
    // across the two tables. insert_seq is a global insertion counter drawn
    // from row_sequence inside each insert transaction; upserts keep the
    // original value. Legacy rows are backfilled into disjoint ranges.
    Migration {
        version: 3,
        sql: "CREATE TABLE row_sequence (
                  next_seq INTEGER NOT NULL
              );
              INSERT INTO row_sequence (next_seq) VALUES (0);
              ALTER TABLE documents ADD COLUMN insert_seq INTEGER NOT NULL DEFAULT 0;
              ALTER TABLE memories ADD COLUMN insert_seq INTEGER NOT NULL DEFAULT 0;
              UPDATE documents SET insert_seq = id;
              UPDATE memories SET insert_seq =
                  id + COALESCE((SELECT MAX(id) FROM documents), 0);
              UPDATE row_sequence SET next_seq = MAX(
                  COALESCE((SELECT MAX(insert_seq) FROM documents), 0),
                  COALESCE((SELECT MAX(insert_seq) FROM memories), 0));
              DROP INDEX IF EXISTS idx_documents_lru;
              DROP INDEX IF EXISTS idx_memories_lru;
              CREATE INDEX idx_documents_lru
                  ON documents (is_critical, last_accessed_at, insert_seq);
              CREATE INDEX idx_memories_lru
                  ON memories (last_accessed_at, insert_seq);",
    },
];

// ============================================================================
// SECTION: Application
// ============================================================================

/// Applies pending migrations and validates the stored schema version.
///
/// # Errors
///
/// Returns [`StoreError::VersionMismatch`] for databases written by a newer
/// relay, and [`StoreError::Db`] when a migration step fails.
pub fn apply_migrations(connection: &mut Connection) -> Result<(), StoreError> {
    connection
        .execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| StoreError::Db(err.to_string()))?;
    let stored = current_version(connection)?;
    if stored > SCHEMA_VERSION {
        return Err(StoreError::VersionMismatch(format!(
            "database schema version {stored} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    for migration in MIGRATIONS {
        if migration.version <= stored {
            continue;
        }
        let tx = connection.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        tx.execute_batch(migration.sql).map_err(|err| {
            StoreError::Db(format!("migration {} failed: {err}", migration.version))
        })?;
        record_version(&tx, migration.version)?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
    }
    Ok(())
}

/// Reads the stored schema version; zero when the database is fresh.
fn current_version(connection: &Connection) -> Result<i64, StoreError> {
    let version: Option<i64> = connection
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| StoreError::Db(err.to_string()))?;
    match version {
        None => Ok(0),
        Some(value) if value >= 0 => Ok(value),
        Some(value) => {
            Err(StoreError::Corrupt(format!("invalid stored schema version: {value}")))
        }
    }
}

/// Writes the schema version inside the migration transaction.
fn record_version(tx: &rusqlite::Transaction<'_>, version: i64) -> Result<(), StoreError> {
    let updated = tx
        .execute("UPDATE store_meta SET version = ?1", params![version])
        .map_err(|err| StoreError::Db(err.to_string()))?;
    if updated == 0 {
        tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![version])
            .map_err(|err| StoreError::Db(err.to_string()))?;
    }
    Ok(())
}
