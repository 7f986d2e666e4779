// crates/context-relay-upstream/src/lib.rs
// ============================================================================
// Module: Context Relay Upstream Transports
// Description: Interchangeable UpstreamClient transports.
// Purpose: Implement the upstream contract over plain HTTP, SSE-framed HTTP,
//          and a child process speaking framed JSON-RPC on its stdio.
// Dependencies: context-relay-core, context-relay-config, reqwest, tokio
// ============================================================================

//! ## Overview
//! Three transports implement [`context_relay_core::UpstreamClient`]. The
//! HTTP transport posts JSON bodies to `/mcp/document`, `/mcp/memory`, and
//! `/mcp/tool` and probes `GET /health`; the event-stream variant is the
//! same surface with SSE-framed response bodies. The child-process
//! transport spawns the configured command and speaks Content-Length framed
//! JSON-RPC 2.0 over its standard streams, probing with `ping`. Security
//! posture: server responses are untrusted; bodies are size-limited and
//! parsing fails closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod http;
pub mod stdio;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use context_relay_config::UpstreamConfig;
use context_relay_config::UpstreamMode;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;

pub use http::HttpUpstreamClient;
pub use stdio::ChildProcessUpstreamClient;

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Builds the upstream client selected by configuration.
///
/// # Errors
///
/// Returns [`UpstreamError`] when the configuration is incomplete for the
/// selected mode or transport setup fails.
pub fn build_upstream_client(
    config: &UpstreamConfig,
) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
    match config.mode {
        UpstreamMode::Http => Ok(Arc::new(HttpUpstreamClient::new(config, false)?)),
        UpstreamMode::EventStream => Ok(Arc::new(HttpUpstreamClient::new(config, true)?)),
        UpstreamMode::ChildProcess => Ok(Arc::new(ChildProcessUpstreamClient::spawn(config)?)),
    }
}
