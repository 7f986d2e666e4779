// crates/context-relay-engine/src/lib.rs
// ============================================================================
// Module: Context Relay Engine
// Description: Offline-resilience engine behind the relay dispatcher.
// Purpose: Provide the cache engine, durable write queue, connection
//          supervisor, and push-invalidation listener.
// Dependencies: context-relay-core, context-relay-store-sqlite, reqwest, tokio
// ============================================================================

//! ## Overview
//! The engine is what makes the relay survive network interruptions: the
//! [`CacheEngine`] serves reads from the persistent two-tier cache, the
//! [`WriteQueue`] captures mutations while the upstream is unreachable and
//! replays them in order, the [`ConnectionSupervisor`] arbitrates
//! reachability with backoff reconnection and publishes lifecycle events,
//! and the [`InvalidationListener`] consumes the upstream's push stream to
//! drop cache rows that changed remotely.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod cache;
pub mod events;
pub mod listener;
pub mod queue;
pub mod supervisor;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use cache::CacheEngine;
pub use events::ConnectionEventSink;
pub use events::FileEventSink;
pub use events::NoopEventSink;
pub use events::StderrEventSink;
pub use events::StoreEventSink;
pub use events::emit_runtime_event;
pub use listener::InvalidationListener;
pub use listener::ListenerConfig;
pub use listener::ListenerError;
pub use queue::DEFAULT_MAX_ATTEMPTS;
pub use queue::WriteQueue;
pub use supervisor::ConnectionSupervisor;
pub use supervisor::ExecuteError;
pub use supervisor::SupervisorConfig;
pub use supervisor::backoff_delay;
