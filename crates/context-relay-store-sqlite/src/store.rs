// crates/context-relay-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Relay Store
// Description: Durable row store backed by SQLite WAL.
// Purpose: Persist cache tiers, the sync queue, and the connection log with
//          transactional primitives for the engine layer.
// Dependencies: context-relay-core, rusqlite, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements the relay's only shared mutable state. A single
//! WAL-journaled connection is guarded by a mutex; each public operation runs
//! in one short transaction, so concurrent engine callers interleave at
//! operation granularity and never observe partial rows. The dynamic-tier
//! eviction scan executes inside the same transaction as the insert it makes
//! room for, keeping the budget invariant atomic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use context_relay_core::CacheRow;
use context_relay_core::CacheStats;
use context_relay_core::HealthSample;
use context_relay_core::QueueOperation;
use context_relay_core::QueueRow;
use context_relay_core::QueueStats;
use context_relay_core::QueueStatus;
use context_relay_core::RowKind;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::migrations::apply_migrations;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the relay store.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// Sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Builds a config with defaults for the given database path.
    #[must_use]
    pub fn for_path(path: PathBuf) -> Self {
        Self {
            path,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for store connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Relay store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("store db error: {0}")]
    Db(String),
    /// Store corruption detected.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("store invalid data: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Upsert Inputs
// ============================================================================

/// Inputs for a document insert-or-update.
#[derive(Debug, Clone, Copy)]
pub struct DocumentUpsert<'a> {
    /// Document type identifier.
    pub doc_type: &'a str,
    /// Document name.
    pub name: &'a str,
    /// Owning project; empty string denotes the global scope.
    pub project: &'a str,
    /// Document content.
    pub content: &'a str,
    /// Metadata serialized as a JSON object string.
    pub metadata: &'a str,
    /// Whether the row belongs to the critical tier.
    pub is_critical: bool,
    /// Write timestamp in unix milliseconds.
    pub now_ms: i64,
}

/// Inputs for a memory insert-or-update. Memories are always dynamic-tier.
#[derive(Debug, Clone, Copy)]
pub struct MemoryUpsert<'a> {
    /// Memory name.
    pub name: &'a str,
    /// Owning project; empty string denotes the global scope.
    pub project: &'a str,
    /// Memory content.
    pub content: &'a str,
    /// Metadata serialized as a JSON object string.
    pub metadata: &'a str,
    /// Write timestamp in unix milliseconds.
    pub now_ms: i64,
}

/// Summary of rows removed by a dynamic-tier eviction scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Number of rows evicted.
    pub evicted_rows: u64,
    /// Bytes freed by the eviction.
    pub evicted_bytes: u64,
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed relay store with WAL support.
#[derive(Clone)]
pub struct SqliteStore {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens the relay store, creating and migrating the database as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened, a pragma
    /// fails, or a schema migration fails.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, StoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        apply_migrations(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.connection.lock().map_err(|_| StoreError::Db("mutex poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Cache Rows
// ============================================================================

impl SqliteStore {
    /// Inserts or updates a document row.
    ///
    /// For dynamic-tier rows (`dynamic_budget` present) the eviction scan
    /// runs in the same transaction as the write, so the budget invariant
    /// holds atomically. Critical rows are written without a capacity check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn upsert_document(
        &self,
        row: &DocumentUpsert<'_>,
        dynamic_budget: Option<u64>,
    ) -> Result<EvictionOutcome, StoreError> {
        let size_bytes = content_size(row.content)?;
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let outcome = match dynamic_budget {
            Some(budget) if !row.is_critical => {
                ensure_capacity(&tx, size_bytes.try_into().unwrap_or(0), budget)?
            }
            _ => EvictionOutcome::default(),
        };
        let insert_seq = next_row_sequence(&tx)?;
        // insert_seq is never part of DO UPDATE: an upsert keeps the row's
        // original insertion order, exactly like its AUTOINCREMENT id.
        tx.execute(
            "INSERT INTO documents (doc_type, name, project, content, metadata, cached_at, \
             last_accessed_at, is_critical, size_bytes, insert_seq) VALUES (?1, ?2, ?3, ?4, ?5, \
             ?6, ?6, ?7, ?8, ?9) ON CONFLICT(doc_type, name, project) DO UPDATE SET content = \
             excluded.content, metadata = excluded.metadata, cached_at = excluded.cached_at, \
             last_accessed_at = excluded.last_accessed_at, is_critical = excluded.is_critical, \
             size_bytes = excluded.size_bytes",
            params![
                row.doc_type,
                row.name,
                row.project,
                row.content.as_bytes(),
                row.metadata,
                row.now_ms,
                i64::from(row.is_critical),
                size_bytes,
                insert_seq
            ],
        )
        .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(outcome)
    }

    /// Inserts or updates a memory row with the dynamic-tier capacity check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn upsert_memory(
        &self,
        row: &MemoryUpsert<'_>,
        dynamic_budget: u64,
    ) -> Result<EvictionOutcome, StoreError> {
        let size_bytes = content_size(row.content)?;
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let outcome = ensure_capacity(&tx, size_bytes.try_into().unwrap_or(0), dynamic_budget)?;
        let insert_seq = next_row_sequence(&tx)?;
        tx.execute(
            "INSERT INTO memories (name, project, content, metadata, cached_at, \
             last_accessed_at, size_bytes, insert_seq) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7) \
             ON CONFLICT(name, project) DO UPDATE SET content = excluded.content, metadata = \
             excluded.metadata, cached_at = excluded.cached_at, last_accessed_at = \
             excluded.last_accessed_at, size_bytes = excluded.size_bytes",
            params![
                row.name,
                row.project,
                row.content.as_bytes(),
                row.metadata,
                row.now_ms,
                size_bytes,
                insert_seq
            ],
        )
        .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(outcome)
    }

    /// Reads a document row, updating its access timestamp atomically with
    /// the read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails or the row no
    /// longer parses.
    pub fn get_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
        now_ms: i64,
    ) -> Result<Option<CacheRow>, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let touched = tx
            .execute(
                "UPDATE documents SET last_accessed_at = ?1 WHERE doc_type = ?2 AND name = ?3 \
                 AND project = ?4",
                params![now_ms, doc_type, name, project],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        if touched == 0 {
            tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
            return Ok(None);
        }
        let row = tx
            .query_row(
                "SELECT doc_type, name, project, content, metadata, cached_at, \
                 last_accessed_at, is_critical, size_bytes FROM documents WHERE doc_type = ?1 \
                 AND name = ?2 AND project = ?3",
                params![doc_type, name, project],
                map_document_row,
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        decode_cache_row(row).map(Some)
    }

    /// Reads a memory row, updating its access timestamp atomically with the
    /// read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails or the row no
    /// longer parses.
    pub fn get_memory(
        &self,
        name: &str,
        project: &str,
        now_ms: i64,
    ) -> Result<Option<CacheRow>, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let touched = tx
            .execute(
                "UPDATE memories SET last_accessed_at = ?1 WHERE name = ?2 AND project = ?3",
                params![now_ms, name, project],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        if touched == 0 {
            tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
            return Ok(None);
        }
        let row = tx
            .query_row(
                "SELECT name, project, content, metadata, cached_at, last_accessed_at, \
                 size_bytes FROM memories WHERE name = ?1 AND project = ?2",
                params![name, project],
                map_memory_row,
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        decode_cache_row(row).map(Some)
    }

    /// Deletes a document row; missing rows are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn delete_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let deleted = guard
            .execute(
                "DELETE FROM documents WHERE doc_type = ?1 AND name = ?2 AND project = ?3",
                params![doc_type, name, project],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(deleted > 0)
    }

    /// Deletes a memory row; missing rows are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn delete_memory(&self, name: &str, project: &str) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let deleted = guard
            .execute(
                "DELETE FROM memories WHERE name = ?1 AND project = ?2",
                params![name, project],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(deleted > 0)
    }

    /// Returns aggregate cache statistics per tier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the aggregate queries fail.
    pub fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let (critical_count, critical_bytes) = tier_totals(
            &tx,
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM documents WHERE is_critical = 1",
        )?;
        let (dynamic_doc_count, dynamic_doc_bytes) = tier_totals(
            &tx,
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM documents WHERE is_critical = 0",
        )?;
        let (memory_count, memory_bytes) =
            tier_totals(&tx, "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM memories")?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        let dynamic_count = dynamic_doc_count + memory_count;
        let dynamic_bytes = dynamic_doc_bytes + memory_bytes;
        Ok(CacheStats {
            critical_count,
            critical_bytes,
            dynamic_count,
            dynamic_bytes,
            total_count: critical_count + dynamic_count,
            total_bytes: critical_bytes + dynamic_bytes,
        })
    }

    /// Deletes every cache row (both tiers). Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn clear_cache(&self) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let documents = tx
            .execute("DELETE FROM documents", params![])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let memories = tx
            .execute("DELETE FROM memories", params![])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(documents as u64 + memories as u64)
    }

    /// Deletes every cache row belonging to a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn clear_project(&self, project: &str) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let documents = tx
            .execute("DELETE FROM documents WHERE project = ?1", params![project])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let memories = tx
            .execute("DELETE FROM memories WHERE project = ?1", params![project])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(documents as u64 + memories as u64)
    }
}

// ============================================================================
// SECTION: Sync Queue
// ============================================================================

impl SqliteStore {
    /// Appends a pending mutation to the sync queue. Returns the row id once
    /// the write is durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn queue_append(
        &self,
        operation: QueueOperation,
        payload: &str,
        now_ms: i64,
    ) -> Result<i64, StoreError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO sync_queue (operation, payload, created_at, status, attempts) \
                 VALUES (?1, ?2, ?3, 'pending', 0)",
                params![operation.as_str(), payload, now_ms],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(guard.last_insert_rowid())
    }

    /// Selects all pending rows in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or a row no longer
    /// parses.
    pub fn queue_pending(&self) -> Result<Vec<QueueRow>, StoreError> {
        self.queue_rows_with_status(QueueStatus::Pending)
    }

    /// Counts rows awaiting replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    pub fn queue_pending_count(&self) -> Result<u64, StoreError> {
        let guard = self.lock()?;
        let count: i64 = guard
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
                params![],
                |row| row.get(0),
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(count.max(0) as u64)
    }

    /// Marks a row completed at the end of a successful replay attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    pub fn queue_mark_completed(&self, id: i64, now_ms: i64) -> Result<(), StoreError> {
        let guard = self.lock()?;
        guard
            .execute(
                "UPDATE sync_queue SET status = 'completed', attempts = attempts + 1, \
                 last_attempt_at = ?2, last_error = NULL WHERE id = ?1",
                params![id, now_ms],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(())
    }

    /// Deletes all completed rows; called at the end of each replay pass.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn queue_delete_completed(&self) -> Result<u64, StoreError> {
        let guard = self.lock()?;
        let deleted = guard
            .execute("DELETE FROM sync_queue WHERE status = 'completed'", params![])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(deleted as u64)
    }

    /// Records a failed replay attempt, keeping the row pending or marking
    /// it terminally failed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    pub fn queue_record_attempt(
        &self,
        id: i64,
        now_ms: i64,
        error: &str,
        terminal: bool,
    ) -> Result<(), StoreError> {
        let status = if terminal { "failed" } else { "pending" };
        let guard = self.lock()?;
        guard
            .execute(
                "UPDATE sync_queue SET status = ?2, attempts = attempts + 1, last_attempt_at = \
                 ?3, last_error = ?4 WHERE id = ?1",
                params![id, status, now_ms, error],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(())
    }

    /// Lists terminally failed rows in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or a row no longer
    /// parses.
    pub fn queue_failed(&self) -> Result<Vec<QueueRow>, StoreError> {
        self.queue_rows_with_status(QueueStatus::Failed)
    }

    /// Resets a failed row back to pending. Returns false for unknown or
    /// non-failed ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    pub fn queue_retry(&self, id: i64) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let updated = guard
            .execute(
                "UPDATE sync_queue SET status = 'pending', attempts = 0, last_error = NULL \
                 WHERE id = ?1 AND status = 'failed'",
                params![id],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(updated > 0)
    }

    /// Deletes all terminally failed rows. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn queue_clear_failed(&self) -> Result<u64, StoreError> {
        let guard = self.lock()?;
        let deleted = guard
            .execute("DELETE FROM sync_queue WHERE status = 'failed'", params![])
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(deleted as u64)
    }

    /// Returns aggregate queue statistics.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the queries fail.
    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| StoreError::Db(err.to_string()))?;
        let pending: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
                params![],
                |row| row.get(0),
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let failed: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'",
                params![],
                |row| row.get(0),
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let total: i64 = tx
            .query_row("SELECT COUNT(*) FROM sync_queue", params![], |row| row.get(0))
            .map_err(|err| StoreError::Db(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(QueueStats {
            pending: pending.max(0) as u64,
            failed: failed.max(0) as u64,
            total: total.max(0) as u64,
        })
    }

    /// Selects queue rows with the given status in submission order.
    fn queue_rows_with_status(&self, status: QueueStatus) -> Result<Vec<QueueRow>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT id, operation, payload, created_at, status, attempts, last_attempt_at, \
                 last_error FROM sync_queue WHERE status = ?1 ORDER BY created_at ASC, id ASC",
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let rows = stmt
            .query_map(params![status.as_str()], map_queue_row)
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let mut decoded = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| StoreError::Db(err.to_string()))?;
            decoded.push(decode_queue_row(raw)?);
        }
        Ok(decoded)
    }
}

// ============================================================================
// SECTION: Connection Log
// ============================================================================

impl SqliteStore {
    /// Appends a health sample to the connection log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn log_connection(&self, sample: &HealthSample) -> Result<(), StoreError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO connection_log (timestamp_ms, state, latency_ms, error_message) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    sample.timestamp_ms,
                    sample.state.as_str(),
                    sample.latency_ms.map(|value| value as i64),
                    sample.error_message
                ],
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        Ok(())
    }

    /// Returns the most recent health samples, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    pub fn recent_connection_log(&self, limit: u32) -> Result<Vec<HealthSample>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT timestamp_ms, state, latency_ms, error_message FROM connection_log \
                 ORDER BY timestamp_ms DESC, id DESC LIMIT ?1",
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let timestamp_ms: i64 = row.get(0)?;
                let state: String = row.get(1)?;
                let latency_ms: Option<i64> = row.get(2)?;
                let error_message: Option<String> = row.get(3)?;
                Ok((timestamp_ms, state, latency_ms, error_message))
            })
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let mut samples = Vec::new();
        for row in rows {
            let (timestamp_ms, state, latency_ms, error_message) =
                row.map_err(|err| StoreError::Db(err.to_string()))?;
            samples.push(HealthSample {
                timestamp_ms,
                state: parse_connection_state(&state)?,
                latency_ms: latency_ms.and_then(|value| u64::try_from(value).ok()),
                error_message,
            });
        }
        Ok(samples)
    }
}

// ============================================================================
// SECTION: Eviction
// ============================================================================

/// A dynamic-tier row candidate in the shared LRU ordering.
struct EvictionCandidate {
    /// Owning table.
    kind: RowKind,
    /// Row id within its table.
    id: i64,
    /// Row size in bytes.
    size_bytes: i64,
}

/// Frees dynamic-tier capacity for an incoming row of `required` bytes.
///
/// Documents and memories share one logical LRU ordering (ascending
/// `last_accessed_at`, ties by ascending `insert_seq`, the global insertion
/// counter; per-table ids restart independently and cannot order rows across
/// the two tables). A single row larger than the budget is still admitted;
/// the scan removes everything else instead of refusing the write. Critical
/// rows are never inspected.
fn ensure_capacity(
    tx: &Transaction<'_>,
    required: u64,
    budget: u64,
) -> Result<EvictionOutcome, StoreError> {
    let dynamic = dynamic_bytes(tx)?;
    if dynamic.saturating_add(required) <= budget {
        return Ok(EvictionOutcome::default());
    }
    let to_free = dynamic.saturating_add(required) - budget;
    let candidates = {
        let mut stmt = tx
            .prepare(
                "SELECT kind, id, size_bytes FROM (SELECT 'document' AS kind, id, size_bytes, \
                 last_accessed_at, insert_seq FROM documents WHERE is_critical = 0 UNION ALL \
                 SELECT 'memory' AS kind, id, size_bytes, last_accessed_at, insert_seq FROM \
                 memories) ORDER BY last_accessed_at ASC, insert_seq ASC",
            )
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let rows = stmt
            .query_map(params![], |row| {
                let kind: String = row.get(0)?;
                let id: i64 = row.get(1)?;
                let size_bytes: i64 = row.get(2)?;
                Ok((kind, id, size_bytes))
            })
            .map_err(|err| StoreError::Db(err.to_string()))?;
        let mut candidates = Vec::new();
        for row in rows {
            let (kind, id, size_bytes) = row.map_err(|err| StoreError::Db(err.to_string()))?;
            let kind = match kind.as_str() {
                "document" => RowKind::Document,
                "memory" => RowKind::Memory,
                other => {
                    return Err(StoreError::Corrupt(format!("unknown eviction kind: {other}")));
                }
            };
            candidates.push(EvictionCandidate {
                kind,
                id,
                size_bytes,
            });
        }
        candidates
    };
    let mut outcome = EvictionOutcome::default();
    let mut freed: u64 = 0;
    for candidate in candidates {
        if freed >= to_free {
            break;
        }
        let sql = match candidate.kind {
            RowKind::Document => "DELETE FROM documents WHERE id = ?1",
            RowKind::Memory => "DELETE FROM memories WHERE id = ?1",
        };
        tx.execute(sql, params![candidate.id]).map_err(|err| StoreError::Db(err.to_string()))?;
        freed = freed.saturating_add(candidate.size_bytes.max(0) as u64);
        outcome.evicted_rows += 1;
    }
    outcome.evicted_bytes = freed;
    Ok(outcome)
}

/// Draws the next value from the global insertion counter.
///
/// Runs inside the caller's insert transaction so concurrent inserts observe
/// strictly increasing values across both cache tables.
fn next_row_sequence(tx: &Transaction<'_>) -> Result<i64, StoreError> {
    tx.execute("UPDATE row_sequence SET next_seq = next_seq + 1", params![])
        .map_err(|err| StoreError::Db(err.to_string()))?;
    tx.query_row("SELECT next_seq FROM row_sequence LIMIT 1", params![], |row| row.get(0))
        .map_err(|err| StoreError::Db(err.to_string()))
}

/// Sums dynamic-tier bytes across documents and memories.
fn dynamic_bytes(tx: &Transaction<'_>) -> Result<u64, StoreError> {
    let documents: i64 = tx
        .query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM documents WHERE is_critical = 0",
            params![],
            |row| row.get(0),
        )
        .map_err(|err| StoreError::Db(err.to_string()))?;
    let memories: i64 = tx
        .query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM memories", params![], |row| {
            row.get(0)
        })
        .map_err(|err| StoreError::Db(err.to_string()))?;
    Ok(documents.max(0) as u64 + memories.max(0) as u64)
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw cache row as read from either table.
struct RawCacheRow {
    kind: RowKind,
    doc_type: Option<String>,
    name: String,
    project: String,
    content: Vec<u8>,
    metadata: String,
    cached_at: i64,
    last_accessed_at: i64,
    is_critical: bool,
    size_bytes: i64,
}

/// Maps a documents row into its raw form.
fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCacheRow> {
    Ok(RawCacheRow {
        kind: RowKind::Document,
        doc_type: Some(row.get(0)?),
        name: row.get(1)?,
        project: row.get(2)?,
        content: row.get(3)?,
        metadata: row.get(4)?,
        cached_at: row.get(5)?,
        last_accessed_at: row.get(6)?,
        is_critical: row.get::<_, i64>(7)? != 0,
        size_bytes: row.get(8)?,
    })
}

/// Maps a memories row into its raw form.
fn map_memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCacheRow> {
    Ok(RawCacheRow {
        kind: RowKind::Memory,
        doc_type: None,
        name: row.get(0)?,
        project: row.get(1)?,
        content: row.get(2)?,
        metadata: row.get(3)?,
        cached_at: row.get(4)?,
        last_accessed_at: row.get(5)?,
        is_critical: false,
        size_bytes: row.get(6)?,
    })
}

/// Decodes a raw cache row, failing closed on unparseable content.
fn decode_cache_row(raw: RawCacheRow) -> Result<CacheRow, StoreError> {
    let content = String::from_utf8(raw.content)
        .map_err(|_| StoreError::Invalid("cache row content is not valid utf-8".to_string()))?;
    let metadata: Value = serde_json::from_str(&raw.metadata)
        .map_err(|err| StoreError::Invalid(format!("cache row metadata invalid: {err}")))?;
    let size_bytes = u64::try_from(raw.size_bytes)
        .map_err(|_| StoreError::Corrupt("negative cache row size".to_string()))?;
    Ok(CacheRow {
        kind: raw.kind,
        doc_type: raw.doc_type,
        name: raw.name,
        project: raw.project,
        content,
        metadata,
        cached_at: raw.cached_at,
        last_accessed_at: raw.last_accessed_at,
        is_critical: raw.is_critical,
        size_bytes,
    })
}

/// Raw queue row as read from the sync queue.
type RawQueueRow = (i64, String, String, i64, String, i64, Option<i64>, Option<String>);

/// Maps a sync queue row into its raw form.
fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQueueRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

/// Decodes a raw queue row, failing closed on unknown labels.
fn decode_queue_row(raw: RawQueueRow) -> Result<QueueRow, StoreError> {
    let (id, operation, payload, created_at, status, attempts, last_attempt_at, last_error) = raw;
    let operation = QueueOperation::parse(&operation)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown queue operation: {operation}")))?;
    let status = QueueStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown queue status: {status}")))?;
    let payload: Value = serde_json::from_str(&payload)
        .map_err(|err| StoreError::Invalid(format!("queue payload invalid: {err}")))?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| StoreError::Corrupt("negative queue attempts".to_string()))?;
    Ok(QueueRow {
        id,
        operation,
        payload,
        created_at,
        status,
        attempts,
        last_attempt_at,
        last_error,
    })
}

/// Parses a stored connection state label.
fn parse_connection_state(label: &str) -> Result<context_relay_core::ConnectionState, StoreError> {
    match label {
        "disconnected" => Ok(context_relay_core::ConnectionState::Disconnected),
        "connected" => Ok(context_relay_core::ConnectionState::Connected),
        "reconnecting" => Ok(context_relay_core::ConnectionState::Reconnecting),
        "offline" => Ok(context_relay_core::ConnectionState::Offline),
        other => Err(StoreError::Corrupt(format!("unknown connection state: {other}"))),
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Aggregates (count, bytes) totals for a tier query.
fn tier_totals(tx: &Transaction<'_>, sql: &str) -> Result<(u64, u64), StoreError> {
    let (count, bytes): (i64, i64) = tx
        .query_row(sql, params![], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|err| StoreError::Db(err.to_string()))?;
    Ok((count.max(0) as u64, bytes.max(0) as u64))
}

/// Returns the content size in bytes as stored in `size_bytes`.
fn content_size(content: &str) -> Result<i64, StoreError> {
    i64::try_from(content.len())
        .map_err(|_| StoreError::Invalid("content exceeds addressable size".to_string()))
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Err(StoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(StoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(StoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(StoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens a connection with durability pragmas applied.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| StoreError::Db(err.to_string()))?;
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|err| StoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| StoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| StoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| StoreError::Db(err.to_string()))?;
    Ok(connection)
}
