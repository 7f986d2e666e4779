// crates/context-relay-core/src/upstream.rs
// ============================================================================
// Module: Upstream Client Contract
// Description: Abstract tool-invocation client for the remote knowledge server.
// Purpose: Give the engine one seam for fetches, mutations, pass-through
//          calls, and liveness probes across interchangeable transports.
// Dependencies: async-trait, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! The relay talks to exactly one upstream through this trait. Concrete
//! transports (HTTP, SSE-framed HTTP, child-process stdio) live in
//! `context-relay-upstream`; tests script the trait directly. Failures are
//! classified by transport error only; there is no status-code-aware retry
//! logic at this seam.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Payloads
// ============================================================================

/// Document payload exchanged with the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Document type identifier (workflow, rule, design, ...).
    pub doc_type: String,
    /// Document name within its type and project.
    pub name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    pub project: String,
    /// Document content.
    pub content: String,
    /// Opaque metadata map.
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

/// Memory payload exchanged with the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPayload {
    /// Memory name within its project.
    pub name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    pub project: String,
    /// Memory content.
    pub content: String,
    /// Opaque metadata map.
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

/// Default metadata value for payloads that omit it.
fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Upstream client failures.
///
/// # Invariants
/// - Variants are stable for programmatic handling by the dispatcher.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Client configuration is invalid.
    #[error("upstream config error: {0}")]
    Config(String),
    /// The transport failed before a response was produced.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// The response could not be parsed.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// The upstream accepted the call but reported a tool-level failure.
    #[error("upstream tool error: {0}")]
    Tool(String),
    /// The upstream answered but does not hold the requested resource.
    ///
    /// This is a completed round-trip, never a connectivity failure: fetch
    /// operations translate it into a `None` miss, and deletes may treat it
    /// as already applied.
    #[error("upstream resource not found: {0}")]
    NotFound(String),
}

// ============================================================================
// SECTION: Client Trait
// ============================================================================

/// Abstract tool-invocation client for the remote knowledge server.
///
/// Fetches return `None` for rows the upstream does not hold; transports
/// that learn this through a typed answer (an HTTP 404 becomes
/// [`UpstreamError::NotFound`]) translate it before returning. Mutations are
/// assumed idempotent or safe to retry; the write queue replays them on that
/// assumption.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetches a document by composite key.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn fetch_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<Option<DocumentPayload>, UpstreamError>;

    /// Lists all documents of a type, used by the preload sweep.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn list_documents(&self, doc_type: &str) -> Result<Vec<DocumentPayload>, UpstreamError>;

    /// Creates a document upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn create_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError>;

    /// Updates a document upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn update_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError>;

    /// Deletes a document upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn delete_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<(), UpstreamError>;

    /// Fetches a memory by key.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn fetch_memory(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<MemoryPayload>, UpstreamError>;

    /// Sets a memory upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn set_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError>;

    /// Updates a memory upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn update_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError>;

    /// Deletes a memory upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails.
    async fn delete_memory(&self, name: &str, project: &str) -> Result<(), UpstreamError>;

    /// Invokes an arbitrary tool by name (pass-through path).
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport or protocol fails, or
    /// [`UpstreamError::Tool`] when the upstream reports a tool failure.
    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError>;

    /// Minimal liveness probe used by the connection supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the upstream is unreachable.
    async fn health_check(&self) -> Result<(), UpstreamError>;
}
