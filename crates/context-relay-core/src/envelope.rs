// crates/context-relay-core/src/envelope.rs
// ============================================================================
// Module: Response Envelope
// Description: Uniform response shape returned by every dispatched tool call.
// Purpose: Annotate every result with its source, age, and connection status
//          so clients can reason about freshness while offline.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every tool call terminates with a well-formed envelope: a `data` payload
//! on success or an `error` body on failure, plus `_metadata` carrying the
//! answer's source and the supervisor's current connection status. No
//! exception escapes the dispatcher boundary; failures are encoded here.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::types::ConnectionState;

// ============================================================================
// SECTION: Error Codes
// ============================================================================

/// Stable error codes carried in [`ErrorBody::code`].
pub mod error_code {
    /// Upstream not connected and no cached answer.
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    /// A pass-through tool was requested while not connected.
    pub const OFFLINE: &str = "OFFLINE";
    /// The upstream returned an error, or the transport failed mid-call.
    pub const TOOL_ERROR: &str = "TOOL_ERROR";
}

// ============================================================================
// SECTION: Envelope Types
// ============================================================================

/// Where the answer in an envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Served by a live upstream call.
    Live,
    /// Served from the local cache (or queued locally).
    Cache,
    /// Retained for envelope compatibility; not produced by the current
    /// read path, which has no freshness distinction.
    StaleCache,
}

/// Structured error body for failed tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code (see [`error_code`]).
    pub code: String,
    /// Human-readable failure description.
    pub message: String,
    /// Actionable hints for the caller.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Envelope metadata present on every response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Where the answer came from.
    pub source: ResponseSource,
    /// Age of a cached answer in seconds; absent for live answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
    /// The supervisor's connection state at response time.
    pub status: ConnectionState,
    /// Optional operator-facing warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The uniform response returned by every dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Tool-specific payload, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error body, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Source, age, status, and warning annotations.
    #[serde(rename = "_metadata")]
    pub metadata: ResponseMetadata,
}

// ============================================================================
// SECTION: Constructors
// ============================================================================

impl ResponseEnvelope {
    /// Builds a success envelope for a live upstream answer.
    #[must_use]
    pub fn live(data: Value, status: ConnectionState) -> Self {
        Self {
            data: Some(data),
            error: None,
            metadata: ResponseMetadata {
                source: ResponseSource::Live,
                age_seconds: None,
                status,
                warning: None,
            },
        }
    }

    /// Builds a success envelope for a cache hit.
    #[must_use]
    pub fn cache_hit(data: Value, age_seconds: i64, status: ConnectionState) -> Self {
        Self {
            data: Some(data),
            error: None,
            metadata: ResponseMetadata {
                source: ResponseSource::Cache,
                age_seconds: Some(age_seconds),
                status,
                warning: None,
            },
        }
    }

    /// Builds a success envelope for a locally applied, queued write.
    #[must_use]
    pub fn queued(data: Value, status: ConnectionState, warning: impl Into<String>) -> Self {
        Self {
            data: Some(data),
            error: None,
            metadata: ResponseMetadata {
                source: ResponseSource::Cache,
                age_seconds: None,
                status,
                warning: Some(warning.into()),
            },
        }
    }

    /// Builds a failure envelope with the given code and suggestions.
    #[must_use]
    pub fn failure(
        code: &str,
        message: impl Into<String>,
        suggestions: Vec<String>,
        source: ResponseSource,
        status: ConnectionState,
    ) -> Self {
        Self {
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
                suggestions,
            }),
            metadata: ResponseMetadata {
                source,
                age_seconds: None,
                status,
                warning: None,
            },
        }
    }

    /// Builds an UNAVAILABLE envelope for a read with no usable answer.
    #[must_use]
    pub fn unavailable(
        message: impl Into<String>,
        suggestions: Vec<String>,
        status: ConnectionState,
    ) -> Self {
        Self::failure(
            error_code::UNAVAILABLE,
            message,
            suggestions,
            ResponseSource::Cache,
            status,
        )
    }

    /// Builds an OFFLINE envelope for a pass-through call while disconnected.
    #[must_use]
    pub fn offline(message: impl Into<String>, status: ConnectionState) -> Self {
        Self::failure(
            error_code::OFFLINE,
            message,
            vec![
                "check connection".to_string(),
                "wait for reconnection".to_string(),
                "cached tools work offline".to_string(),
            ],
            ResponseSource::Cache,
            status,
        )
    }

    /// Builds a TOOL_ERROR envelope for an upstream or internal failure.
    #[must_use]
    pub fn tool_error(message: impl Into<String>, status: ConnectionState) -> Self {
        Self::failure(
            error_code::TOOL_ERROR,
            message,
            Vec::new(),
            ResponseSource::Live,
            status,
        )
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
