// crates/context-relay-engine/src/queue.rs
// ============================================================================
// Module: Write Queue
// Description: Durable FIFO of pending mutations with bounded-retry replay.
// Purpose: Record mutations performed while the upstream is unreachable and
//          replay them in submission order once it returns.
// Dependencies: context-relay-core, context-relay-store-sqlite, serde, tokio
// ============================================================================

//! ## Overview
//! Queued mutations are durable before `enqueue` returns. Replay is strictly
//! sequential in submission order: a row that fails but remains pending ends
//! the pass so that later mutations are never applied ahead of it, while a
//! row that reaches terminal failure leaves the pending set and unblocks the
//! rows behind it. A single in-process guard prevents overlapping passes;
//! `enqueue` may interleave with a pass and its rows wait for the next one.
//! Replay assumes upstream mutations are idempotent or safe to retry; on a
//! flaky link duplicates are possible and this is a documented operator
//! limitation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use context_relay_core::Clock;
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::QueueOperation;
use context_relay_core::QueueRow;
use context_relay_core::QueueStats;
use context_relay_core::ReplaySummary;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::StoreError;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default bound on replay attempts per row.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// SECTION: Payload Shapes
// ============================================================================

/// Arguments recorded for document deletes.
#[derive(Debug, Deserialize)]
struct DeleteDocumentArgs {
    /// Document type identifier.
    doc_type: String,
    /// Document name.
    name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
}

/// Arguments recorded for memory deletes.
#[derive(Debug, Deserialize)]
struct DeleteMemoryArgs {
    /// Memory name.
    name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Failure for a single replayed row.
#[derive(Debug, Error)]
enum ReplayRowError {
    /// The recorded payload no longer parses for its operation.
    #[error("queue payload invalid: {0}")]
    Payload(String),
    /// The upstream call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

// ============================================================================
// SECTION: Write Queue
// ============================================================================

/// Durable write-ahead queue with bounded-retry replay.
pub struct WriteQueue {
    /// Durable row store.
    store: Arc<SqliteStore>,
    /// Upstream client used during replay.
    upstream: Arc<dyn UpstreamClient>,
    /// Clock for attempt timestamps.
    clock: Arc<dyn Clock>,
    /// Bound on attempts per row.
    max_attempts: u32,
    /// Guard ensuring at most one replay pass per process.
    replaying: AtomicBool,
}

impl WriteQueue {
    /// Builds a write queue over the given store and upstream.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        upstream: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            upstream,
            clock,
            max_attempts: max_attempts.max(1),
            replaying: AtomicBool::new(false),
        }
    }

    /// Appends a mutation; returns its row id after the write is durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn enqueue(&self, operation: QueueOperation, payload: &Value) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(payload)
            .map_err(|err| StoreError::Invalid(format!("queue payload serialization: {err}")))?;
        self.store.queue_append(operation, &payload, self.clock.now_millis())
    }

    /// Counts rows awaiting replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the count query fails.
    pub fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.queue_pending_count()
    }

    /// Replays pending rows in submission order.
    ///
    /// Skips (returning zeros) when a pass is already in progress. A pass
    /// ends early when a row fails but stays pending, so causal order is
    /// preserved across passes; terminally failed rows leave the pending set
    /// and do not block the rows behind them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when queue bookkeeping fails mid-pass.
    pub async fn replay(&self) -> Result<ReplaySummary, StoreError> {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(ReplaySummary::default());
        }
        let result = self.replay_pass().await;
        self.replaying.store(false, Ordering::SeqCst);
        result
    }

    /// Runs one replay pass over the rows pending at its start.
    async fn replay_pass(&self) -> Result<ReplaySummary, StoreError> {
        let rows = self.store.queue_pending()?;
        let mut summary = ReplaySummary::default();
        for row in rows {
            match self.send_row(&row).await {
                Ok(()) => {
                    self.store.queue_mark_completed(row.id, self.clock.now_millis())?;
                    summary.synced += 1;
                }
                Err(err) => {
                    let attempts_after = row.attempts.saturating_add(1);
                    let terminal = attempts_after >= self.max_attempts;
                    self.store.queue_record_attempt(
                        row.id,
                        self.clock.now_millis(),
                        &err.to_string(),
                        terminal,
                    )?;
                    if terminal {
                        summary.failed += 1;
                        continue;
                    }
                    break;
                }
            }
        }
        self.store.queue_delete_completed()?;
        Ok(summary)
    }

    /// Dispatches one queued row to the matching upstream operation.
    async fn send_row(&self, row: &QueueRow) -> Result<(), ReplayRowError> {
        match row.operation {
            QueueOperation::CreateDocument => {
                let document: DocumentPayload = decode(&row.payload)?;
                self.upstream.create_document(&document).await?;
            }
            QueueOperation::UpdateDocument => {
                let document: DocumentPayload = decode(&row.payload)?;
                self.upstream.update_document(&document).await?;
            }
            QueueOperation::DeleteDocument => {
                let args: DeleteDocumentArgs = decode(&row.payload)?;
                let result =
                    self.upstream.delete_document(&args.doc_type, &args.name, &args.project).await;
                match result {
                    // Already gone upstream; the delete is applied.
                    Ok(()) | Err(UpstreamError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            QueueOperation::SetMemory => {
                let memory: MemoryPayload = decode(&row.payload)?;
                self.upstream.set_memory(&memory).await?;
            }
            QueueOperation::UpdateMemory => {
                let memory: MemoryPayload = decode(&row.payload)?;
                self.upstream.update_memory(&memory).await?;
            }
            QueueOperation::DeleteMemory => {
                let args: DeleteMemoryArgs = decode(&row.payload)?;
                match self.upstream.delete_memory(&args.name, &args.project).await {
                    // Already gone upstream; the delete is applied.
                    Ok(()) | Err(UpstreamError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Lists terminally failed rows for the operator surface.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    pub fn list_failed(&self) -> Result<Vec<QueueRow>, StoreError> {
        self.store.queue_failed()
    }

    /// Resets a failed row back to pending with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    pub fn retry(&self, id: i64) -> Result<bool, StoreError> {
        self.store.queue_retry(id)
    }

    /// Bulk-deletes all terminally failed rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn clear_failed(&self) -> Result<u64, StoreError> {
        self.store.queue_clear_failed()
    }

    /// Returns aggregate queue statistics.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the queries fail.
    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.queue_stats()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Decodes a recorded payload into the shape its operation expects.
fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ReplayRowError> {
    serde_json::from_value(payload.clone()).map_err(|err| ReplayRowError::Payload(err.to_string()))
}
