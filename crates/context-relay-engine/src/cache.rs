// crates/context-relay-engine/src/cache.rs
// ============================================================================
// Module: Cache Engine
// Description: Two-tier persistent cache with LRU eviction and invalidation.
// Purpose: Serve reads, absorb writes, enforce the dynamic-tier budget, and
//          accept push-driven invalidations.
// Dependencies: context-relay-core, context-relay-store-sqlite, serde_json
// ============================================================================

//! ## Overview
//! The cache holds documents and memories in one database. Documents of the
//! pinned types (workflow, rule, agent, template) form the critical tier:
//! never evicted, never counted against the budget. Everything else is the
//! dynamic tier, bounded by `max_dynamic_bytes` with LRU eviction ordered by
//! last access across both row families. The engine owns tier policy; the
//! store executes each operation in a single transaction so a concurrent
//! eviction can never select a row that was just observed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use context_relay_core::CacheStats;
use context_relay_core::CachedItem;
use context_relay_core::Clock;
use context_relay_core::is_critical_doc_type;
use context_relay_store_sqlite::DocumentUpsert;
use context_relay_store_sqlite::EvictionOutcome;
use context_relay_store_sqlite::MemoryUpsert;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::StoreError;
use serde_json::Value;

// ============================================================================
// SECTION: Cache Engine
// ============================================================================

/// Two-tier persistent cache engine.
#[derive(Clone)]
pub struct CacheEngine {
    /// Durable row store.
    store: Arc<SqliteStore>,
    /// Clock used for access bookkeeping.
    clock: Arc<dyn Clock>,
    /// Dynamic-tier size budget in bytes.
    max_dynamic_bytes: u64,
}

impl CacheEngine {
    /// Builds a cache engine over the given store.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, clock: Arc<dyn Clock>, max_dynamic_bytes: u64) -> Self {
        Self {
            store,
            clock,
            max_dynamic_bytes,
        }
    }

    /// Returns the configured dynamic-tier budget in bytes.
    #[must_use]
    pub const fn max_dynamic_bytes(&self) -> u64 {
        self.max_dynamic_bytes
    }

    /// Looks up a document, updating its access time atomically with the
    /// read. Returns the row plus its age in seconds.
    ///
    /// # Errors
    ///
    /// Fails only on store errors; a miss is `Ok(None)`.
    pub fn get_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<Option<CachedItem>, StoreError> {
        let now = self.clock.now_millis();
        let row = self.store.get_document(doc_type, name, project, now)?;
        Ok(row.map(|row| annotate_age(row, now)))
    }

    /// Looks up a memory, updating its access time atomically with the read.
    ///
    /// # Errors
    ///
    /// Fails only on store errors; a miss is `Ok(None)`.
    pub fn get_memory(&self, name: &str, project: &str) -> Result<Option<CachedItem>, StoreError> {
        let now = self.clock.now_millis();
        let row = self.store.get_memory(name, project, now)?;
        Ok(row.map(|row| annotate_age(row, now)))
    }

    /// Inserts or updates a document.
    ///
    /// Criticality is recomputed from the document type on every write;
    /// non-critical writes make room in the dynamic tier first, atomically
    /// with the insert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn set_document(
        &self,
        doc_type: &str,
        name: &str,
        content: &str,
        project: &str,
        metadata: &Value,
    ) -> Result<EvictionOutcome, StoreError> {
        let is_critical = is_critical_doc_type(doc_type);
        let metadata = encode_metadata(metadata)?;
        let upsert = DocumentUpsert {
            doc_type,
            name,
            project,
            content,
            metadata: &metadata,
            is_critical,
            now_ms: self.clock.now_millis(),
        };
        self.store.upsert_document(&upsert, Some(self.max_dynamic_bytes))
    }

    /// Inserts or updates a memory. Memories are always dynamic-tier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn set_memory(
        &self,
        name: &str,
        content: &str,
        project: &str,
        metadata: &Value,
    ) -> Result<EvictionOutcome, StoreError> {
        let metadata = encode_metadata(metadata)?;
        let upsert = MemoryUpsert {
            name,
            project,
            content,
            metadata: &metadata,
            now_ms: self.clock.now_millis(),
        };
        self.store.upsert_memory(&upsert, self.max_dynamic_bytes)
    }

    /// Hard-deletes a document; deleting a missing row is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn invalidate_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<bool, StoreError> {
        self.store.delete_document(doc_type, name, project)
    }

    /// Hard-deletes a memory; deleting a missing row is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn invalidate_memory(&self, name: &str, project: &str) -> Result<bool, StoreError> {
        self.store.delete_memory(name, project)
    }

    /// Returns aggregate statistics per tier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the aggregate queries fail.
    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        self.store.cache_stats()
    }

    /// Administrative clear of every cache row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn clear_all(&self) -> Result<u64, StoreError> {
        self.store.clear_cache()
    }

    /// Administrative clear of one project's cache rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails.
    pub fn clear_project(&self, project: &str) -> Result<u64, StoreError> {
        self.store.clear_project(project)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Annotates a row with its age relative to the read time.
fn annotate_age(row: context_relay_core::CacheRow, now_ms: i64) -> CachedItem {
    let age_seconds = now_ms.saturating_sub(row.cached_at).max(0) / 1_000;
    CachedItem {
        row,
        age_seconds,
    }
}

/// Serializes a metadata map for storage.
fn encode_metadata(metadata: &Value) -> Result<String, StoreError> {
    serde_json::to_string(metadata)
        .map_err(|err| StoreError::Invalid(format!("metadata serialization failed: {err}")))
}
