// crates/context-relay-mcp/src/lib.rs
// ============================================================================
// Module: Context Relay MCP
// Description: Front-side MCP server and request dispatcher.
// Purpose: Expose the static tool catalog to clients and route every call
//          through the offline-resilience engine.
// Dependencies: context-relay-core, context-relay-engine, axum, tokio
// ============================================================================

//! ## Overview
//! The dispatcher fuses the static tool catalog, the cache engine, the write
//! queue, the upstream client, and the connection supervisor to serve each
//! tool call with a uniform, metadata-annotated envelope. The server speaks
//! JSON-RPC 2.0 to the end-user client over stdio or HTTP, and the runtime
//! wires the whole sidecar together with LIFO shutdown. Security posture:
//! client requests are untrusted; no exception escapes the dispatcher
//! boundary.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod dispatcher;
pub mod runtime;
pub mod server;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use dispatcher::Dispatcher;
pub use dispatcher::QUEUED_WARNING;
pub use runtime::RelayRuntime;
pub use runtime::RuntimeError;
pub use server::ServeError;
pub use server::serve_http;
pub use server::serve_stdio;
