// crates/context-relay-mcp/src/runtime.rs
// ============================================================================
// Module: Relay Runtime
// Description: Process lifecycle wiring for the sidecar.
// Purpose: Build the store, engine, upstream, supervisor, listener, and
//          dispatcher from configuration; stop in LIFO order.
// Dependencies: context-relay-config, context-relay-engine, context-relay-upstream
// ============================================================================

//! ## Overview
//! `start()` opens and migrates the store, builds the engine over it,
//! constructs the configured upstream transport, starts the connection
//! supervisor (which schedules the immediate probe), and, when the upstream
//! mode is event-stream, starts the invalidation listener. `stop()` reverses
//! in LIFO order and is idempotent; the cache remains usable after stop.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use context_relay_config::ConnectionConfig;
use context_relay_config::RelayConfig;
use context_relay_config::ServerTransport;
use context_relay_config::UpstreamMode;
use context_relay_core::SystemClock;
use context_relay_core::UpstreamError;
use context_relay_engine::CacheEngine;
use context_relay_engine::ConnectionSupervisor;
use context_relay_engine::DEFAULT_MAX_ATTEMPTS;
use context_relay_engine::InvalidationListener;
use context_relay_engine::ListenerConfig;
use context_relay_engine::ListenerError;
use context_relay_engine::StderrEventSink;
use context_relay_engine::StoreEventSink;
use context_relay_engine::SupervisorConfig;
use context_relay_engine::WriteQueue;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::SqliteStoreConfig;
use context_relay_store_sqlite::StoreError;
use context_relay_upstream::build_upstream_client;
use thiserror::Error;

use crate::dispatcher::Dispatcher;
use crate::server::ServeError;
use crate::server::serve_http;
use crate::server::serve_stdio;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Runtime lifecycle failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Store open or migration failed; fatal at startup.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Upstream transport setup failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Invalidation listener setup failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// Front-side server failed.
    #[error(transparent)]
    Serve(#[from] ServeError),
}

// ============================================================================
// SECTION: Runtime
// ============================================================================

/// Wired sidecar runtime.
pub struct RelayRuntime {
    /// Loaded configuration.
    config: RelayConfig,
    /// Two-tier cache engine.
    cache: Arc<CacheEngine>,
    /// Durable write queue.
    queue: Arc<WriteQueue>,
    /// Connection supervisor.
    supervisor: Arc<ConnectionSupervisor>,
    /// Invalidation listener; present in event-stream mode.
    listener: Option<InvalidationListener>,
    /// Request dispatcher.
    dispatcher: Arc<Dispatcher>,
    /// Guard making stop() idempotent.
    stopped: AtomicBool,
}

impl RelayRuntime {
    /// Builds and starts the sidecar. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the store cannot be opened or migrated,
    /// or the upstream transport cannot be built.
    pub fn start(config: RelayConfig) -> Result<Self, RuntimeError> {
        let store =
            Arc::new(SqliteStore::open(&SqliteStoreConfig::for_path(config.cache.database_path()))?);
        let clock = Arc::new(SystemClock);
        let cache = Arc::new(CacheEngine::new(
            Arc::clone(&store),
            clock.clone(),
            config.cache.max_dynamic_bytes,
        ));
        let upstream = build_upstream_client(&config.upstream)?;
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&store),
            Arc::clone(&upstream),
            clock,
            DEFAULT_MAX_ATTEMPTS,
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&upstream),
            supervisor_config(&config.connection),
        ));
        supervisor.subscribe(Arc::new(StderrEventSink));
        supervisor.subscribe(Arc::new(StoreEventSink::new(Arc::clone(&store))));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            upstream,
            Arc::clone(&supervisor),
            config.cache.preload.clone(),
        ));
        dispatcher.attach_to_supervisor();
        supervisor.start();
        let listener = if config.upstream.mode == UpstreamMode::EventStream {
            let listener_config = ListenerConfig::new(
                config.upstream.url.clone().unwrap_or_default(),
                config.upstream.api_key.clone(),
            );
            let listener = InvalidationListener::new(Arc::clone(&cache), listener_config)?;
            listener.start();
            Some(listener)
        } else {
            None
        };
        Ok(Self {
            config,
            cache,
            queue,
            supervisor,
            listener,
            dispatcher,
            stopped: AtomicBool::new(false),
        })
    }

    /// Runs the configured front-side server until the client disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the server fails.
    pub async fn serve(&self) -> Result<(), RuntimeError> {
        match self.config.server.transport {
            ServerTransport::Stdio => {
                serve_stdio(Arc::clone(&self.dispatcher), self.config.server.max_body_bytes)
                    .await?;
            }
            ServerTransport::Http => {
                let bind = self.config.server.bind.clone().ok_or_else(|| {
                    ServeError::Config("server.bind is required for http".to_string())
                })?;
                serve_http(
                    Arc::clone(&self.dispatcher),
                    &bind,
                    self.config.server.max_body_bytes,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Stops the sidecar in LIFO order. Idempotent; the cache stays usable.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        self.supervisor.stop().await;
    }

    /// Returns the request dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Returns the cache engine.
    #[must_use]
    pub fn cache(&self) -> Arc<CacheEngine> {
        Arc::clone(&self.cache)
    }

    /// Returns the write queue.
    #[must_use]
    pub fn queue(&self) -> Arc<WriteQueue> {
        Arc::clone(&self.queue)
    }

    /// Returns the connection supervisor.
    #[must_use]
    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        Arc::clone(&self.supervisor)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Maps connection configuration onto supervisor timing.
fn supervisor_config(config: &ConnectionConfig) -> SupervisorConfig {
    SupervisorConfig {
        health_check_interval: Duration::from_millis(config.health_check_interval_ms),
        probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        max_reconnect_attempts: config.max_reconnect_attempts,
        backoff_initial: Duration::from_millis(config.backoff.initial_ms),
        backoff_multiplier: config.backoff.multiplier,
        backoff_max: Duration::from_millis(config.backoff.max_ms),
    }
}
