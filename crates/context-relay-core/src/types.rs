// crates/context-relay-core/src/types.rs
// ============================================================================
// Module: Relay Data Model
// Description: Cache rows, queue rows, connection lifecycle, and time.
// Purpose: Provide the canonical row and state types shared by the store,
//          engine, and dispatch layers.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The relay persists two families of rows: cache rows (documents and
//! memories, split into a critical tier and an LRU-evicted dynamic tier) and
//! queue rows (mutations captured while the upstream is unreachable).
//! Connection lifecycle states and events defined here drive the engine's
//! event-driven sync. Timestamps are unix-epoch milliseconds supplied through
//! the [`Clock`] seam so that eviction ordering stays testable.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Document types pinned to the critical tier.
///
/// Rows of these types hold durable, rarely-changing content and are exempt
/// from LRU eviction and from the dynamic-bytes budget.
pub const CRITICAL_DOC_TYPES: [&str; 4] = ["workflow", "rule", "agent", "template"];

/// Returns true when the document type belongs to the critical tier.
#[must_use]
pub fn is_critical_doc_type(doc_type: &str) -> bool {
    CRITICAL_DOC_TYPES.contains(&doc_type)
}

// ============================================================================
// SECTION: Cache Rows
// ============================================================================

/// Cache row family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// Typed document row, keyed by (doc_type, name, project).
    Document,
    /// Memory row, keyed by (name, project).
    Memory,
}

impl RowKind {
    /// Returns the stable wire label for the row kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted cache row.
///
/// # Invariants
/// - `cached_at <= last_accessed_at`.
/// - `size_bytes` equals the content length at insert time.
/// - `is_critical` is derived from `doc_type` at insert and never flipped in
///   place; memories are always non-critical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    /// Row family (document or memory).
    pub kind: RowKind,
    /// Document type; present only for documents.
    pub doc_type: Option<String>,
    /// Row name within its type and project.
    pub name: String,
    /// Owning project; empty string denotes the global scope.
    pub project: String,
    /// Row content (UTF-8 text in practice).
    pub content: String,
    /// Opaque metadata map.
    pub metadata: Value,
    /// Unix milliseconds of the last write.
    pub cached_at: i64,
    /// Unix milliseconds of the last successful read or write.
    pub last_accessed_at: i64,
    /// Whether the row lives in the critical tier.
    pub is_critical: bool,
    /// Content length in bytes at insert time.
    pub size_bytes: u64,
}

/// A cache row returned from a read, annotated with its age.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    /// The stored row.
    pub row: CacheRow,
    /// Seconds elapsed since the row was last written.
    pub age_seconds: i64,
}

/// Aggregate cache statistics per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of critical-tier rows.
    pub critical_count: u64,
    /// Total bytes held by critical-tier rows.
    pub critical_bytes: u64,
    /// Number of dynamic-tier rows.
    pub dynamic_count: u64,
    /// Total bytes held by dynamic-tier rows.
    pub dynamic_bytes: u64,
    /// Number of rows across both tiers.
    pub total_count: u64,
    /// Total bytes across both tiers.
    pub total_bytes: u64,
}

// ============================================================================
// SECTION: Queue Rows
// ============================================================================

/// Mutation kinds captured by the write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    /// Create a document upstream.
    CreateDocument,
    /// Update a document upstream.
    UpdateDocument,
    /// Delete a document upstream.
    DeleteDocument,
    /// Set a memory upstream.
    SetMemory,
    /// Update a memory upstream.
    UpdateMemory,
    /// Delete a memory upstream.
    DeleteMemory,
}

impl QueueOperation {
    /// Returns the stable wire label for the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateDocument => "create_document",
            Self::UpdateDocument => "update_document",
            Self::DeleteDocument => "delete_document",
            Self::SetMemory => "set_memory",
            Self::UpdateMemory => "update_memory",
            Self::DeleteMemory => "delete_memory",
        }
    }

    /// Parses an operation from its wire label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "create_document" => Some(Self::CreateDocument),
            "update_document" => Some(Self::UpdateDocument),
            "delete_document" => Some(Self::DeleteDocument),
            "set_memory" => Some(Self::SetMemory),
            "update_memory" => Some(Self::UpdateMemory),
            "delete_memory" => Some(Self::DeleteMemory),
            _ => None,
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Awaiting replay.
    Pending,
    /// Replayed successfully; deleted at the end of the pass.
    Completed,
    /// Terminally failed; retained until operator action.
    Failed,
}

impl QueueStatus {
    /// Returns the stable wire label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from its wire label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable queued mutation.
///
/// # Invariants
/// - `attempts` never exceeds the configured maximum; at the maximum the
///   status is [`QueueStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    /// Monotonic row identifier.
    pub id: i64,
    /// Mutation kind.
    pub operation: QueueOperation,
    /// Serialized mutation arguments.
    pub payload: Value,
    /// Unix milliseconds when the mutation was captured.
    pub created_at: i64,
    /// Lifecycle status.
    pub status: QueueStatus,
    /// Number of replay attempts so far.
    pub attempts: u32,
    /// Unix milliseconds of the last attempt, if any.
    pub last_attempt_at: Option<i64>,
    /// Error message from the last failed attempt, if any.
    pub last_error: Option<String>,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Rows replayed successfully during the pass.
    pub synced: u64,
    /// Rows that reached terminal failure during the pass.
    pub failed: u64,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Rows awaiting replay.
    pub pending: u64,
    /// Rows retained after terminal failure.
    pub failed: u64,
    /// All rows currently in the queue table.
    pub total: u64,
}

// ============================================================================
// SECTION: Connection Lifecycle
// ============================================================================

/// Authoritative upstream reachability states.
///
/// The single-shot connecting phase is modeled as a transition, not a
/// durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state before the first probe completes.
    Disconnected,
    /// Upstream reachable; periodic probes are running.
    Connected,
    /// Upstream lost; backoff reconnection in progress.
    Reconnecting,
    /// Terminal until restarted by the operator.
    Offline,
}

impl ConnectionState {
    /// Returns the stable wire label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events published by the connection supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The supervisor moved between states.
    StateChange {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A probe succeeded and the supervisor is Connected.
    Connected {
        /// Probe round-trip latency in milliseconds.
        latency_ms: u64,
    },
    /// The upstream was lost.
    Disconnected {
        /// Failure description.
        error: String,
    },
    /// A reconnect attempt has been scheduled.
    Reconnecting {
        /// Consecutive failure count for this outage.
        attempt: u32,
        /// Delay before the next probe in milliseconds.
        delay_ms: u64,
    },
    /// The reconnect budget is exhausted; the supervisor is Offline.
    MaxAttemptsReached,
}

impl ConnectionEvent {
    /// Returns the stable event label used in logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "state_change",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::MaxAttemptsReached => "max_attempts_reached",
        }
    }
}

/// Best-effort connection health record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    /// Unix milliseconds when the sample was taken.
    pub timestamp_ms: i64,
    /// Supervisor state at sample time.
    pub state: ConnectionState,
    /// Probe latency in milliseconds, when known.
    pub latency_ms: Option<u64>,
    /// Failure description, when present.
    pub error_message: Option<String>,
}

// ============================================================================
// SECTION: Time
// ============================================================================

/// Clock seam for cache bookkeeping.
///
/// Eviction ordering depends on access timestamps, so the engine reads time
/// through this trait instead of the wall clock directly.
pub trait Clock: Send + Sync {
    /// Returns the current time as unix-epoch milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        unix_millis()
    }
}

/// Returns the current unix epoch in milliseconds.
#[must_use]
pub fn unix_millis() -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_tier_covers_exactly_the_pinned_types() {
        for doc_type in ["workflow", "rule", "agent", "template"] {
            assert!(is_critical_doc_type(doc_type), "{doc_type} should be critical");
        }
        for doc_type in ["design", "frd", "memory", "WORKFLOW", ""] {
            assert!(!is_critical_doc_type(doc_type), "{doc_type} should be dynamic");
        }
    }

    #[test]
    fn queue_operation_labels_round_trip() {
        let all = [
            QueueOperation::CreateDocument,
            QueueOperation::UpdateDocument,
            QueueOperation::DeleteDocument,
            QueueOperation::SetMemory,
            QueueOperation::UpdateMemory,
            QueueOperation::DeleteMemory,
        ];
        for op in all {
            assert_eq!(QueueOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(QueueOperation::parse("drop_table"), None);
    }

    #[test]
    fn connection_state_labels_are_stable() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
        assert_eq!(ConnectionState::Offline.as_str(), "offline");
    }
}
