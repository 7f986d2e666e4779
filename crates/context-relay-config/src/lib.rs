// crates/context-relay-config/src/lib.rs
// ============================================================================
// Module: Context Relay Configuration
// Description: Configuration loading and validation for the relay.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: serde, toml, url, directories
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path
//! limits. Missing or invalid configuration fails closed. Security posture:
//! config inputs are untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::BackoffConfig;
pub use config::CacheConfig;
pub use config::ConfigError;
pub use config::ConnectionConfig;
pub use config::RelayConfig;
pub use config::ServerConfig;
pub use config::ServerTransport;
pub use config::UpstreamConfig;
pub use config::UpstreamMode;
pub use config::preload_doc_type;
