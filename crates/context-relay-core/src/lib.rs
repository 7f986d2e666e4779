// crates/context-relay-core/src/lib.rs
// ============================================================================
// Module: Context Relay Core
// Description: Shared types and contracts for the context-relay sidecar.
// Purpose: Define cache rows, the tool catalog, the response envelope, and
//          the upstream client contract used by every other crate.
// Dependencies: serde, serde_json, async-trait, thiserror
// ============================================================================

//! ## Overview
//! Core vocabulary for context-relay. The relay interposes between a
//! tool-calling client and a remote knowledge server; this crate defines the
//! data model that survives across that boundary: cache rows and their two
//! tiers, queued mutations, connection lifecycle states and events, the
//! uniform response envelope, the static tool catalog, and the
//! [`UpstreamClient`] trait the transport crates implement.
//! Security posture: all wire payloads are untrusted and validated at parse
//! boundaries; this crate performs no I/O.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod catalog;
pub mod envelope;
pub mod types;
pub mod upstream;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use catalog::ToolDefinition;
pub use catalog::ToolName;
pub use catalog::ToolRoute;
pub use catalog::tool_definitions;
pub use envelope::ErrorBody;
pub use envelope::ResponseEnvelope;
pub use envelope::ResponseMetadata;
pub use envelope::ResponseSource;
pub use envelope::error_code;
pub use types::CacheRow;
pub use types::CacheStats;
pub use types::CachedItem;
pub use types::Clock;
pub use types::ConnectionEvent;
pub use types::ConnectionState;
pub use types::HealthSample;
pub use types::QueueOperation;
pub use types::QueueRow;
pub use types::QueueStats;
pub use types::QueueStatus;
pub use types::ReplaySummary;
pub use types::RowKind;
pub use types::SystemClock;
pub use types::is_critical_doc_type;
pub use types::unix_millis;
pub use upstream::DocumentPayload;
pub use upstream::MemoryPayload;
pub use upstream::UpstreamClient;
pub use upstream::UpstreamError;
