// crates/context-relay-store-sqlite/src/lib.rs
// ============================================================================
// Module: Context Relay SQLite Store
// Description: Durable store for cache rows, queue rows, and the health log.
// Purpose: Persist relay state in one WAL-journaled SQLite file with
//          transactional row primitives.
// Dependencies: context-relay-core, rusqlite, serde_json, thiserror
// ============================================================================

//! ## Overview
//! One embedded database file holds four tables: `documents`, `memories`,
//! `sync_queue`, and `connection_log`. Every state change that touches more
//! than one row runs inside a single transaction, including the LRU eviction
//! scan that accompanies a dynamic-tier insert. Schema evolution is a
//! numbered migration sequence applied idempotently at open; a migration
//! failure is fatal to startup. Security posture: database contents are
//! untrusted; reads fail closed on rows that no longer parse.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod migrations;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use migrations::SCHEMA_VERSION;
pub use store::DocumentUpsert;
pub use store::EvictionOutcome;
pub use store::MemoryUpsert;
pub use store::SqliteJournalMode;
pub use store::SqliteStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteSyncMode;
pub use store::StoreError;
