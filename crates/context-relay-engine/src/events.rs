// crates/context-relay-engine/src/events.rs
// ============================================================================
// Module: Connection Event Sinks
// Description: Structured JSON-line sinks for connection lifecycle events.
// Purpose: Route supervisor events to stderr, a file, or the store's
//          connection log without hard dependencies.
// Dependencies: context-relay-core, context-relay-store-sqlite, serde_json
// ============================================================================

//! ## Overview
//! The supervisor publishes lifecycle events through a synchronous sink
//! registry; sinks here cover the common destinations. All sinks are
//! best-effort: a sink that cannot record an event swallows the failure so
//! event delivery never disturbs the state machine.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use context_relay_core::ConnectionEvent;
use context_relay_core::ConnectionState;
use context_relay_core::HealthSample;
use context_relay_core::unix_millis;
use context_relay_store_sqlite::SqliteStore;
use serde_json::json;

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Sink for connection lifecycle events.
pub trait ConnectionEventSink: Send + Sync {
    /// Records a lifecycle event.
    fn on_event(&self, event: &ConnectionEvent);
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl ConnectionEventSink for StderrEventSink {
    fn on_event(&self, event: &ConnectionEvent) {
        if let Ok(payload) = serde_json::to_string(&event_record(event)) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Sink that logs JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the event log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ConnectionEventSink for FileEventSink {
    fn on_event(&self, event: &ConnectionEvent) {
        if let Ok(payload) = serde_json::to_string(&event_record(event))
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// Sink that appends health samples to the store's connection log.
pub struct StoreEventSink {
    /// Relay store receiving the samples.
    store: Arc<SqliteStore>,
}

impl StoreEventSink {
    /// Builds a store-backed sink.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
        }
    }
}

impl ConnectionEventSink for StoreEventSink {
    fn on_event(&self, event: &ConnectionEvent) {
        let sample = match event {
            ConnectionEvent::StateChange { to, .. } => HealthSample {
                timestamp_ms: unix_millis(),
                state: *to,
                latency_ms: None,
                error_message: None,
            },
            ConnectionEvent::Connected { latency_ms } => HealthSample {
                timestamp_ms: unix_millis(),
                state: ConnectionState::Connected,
                latency_ms: Some(*latency_ms),
                error_message: None,
            },
            ConnectionEvent::Disconnected { error } => HealthSample {
                timestamp_ms: unix_millis(),
                state: ConnectionState::Reconnecting,
                latency_ms: None,
                error_message: Some(error.clone()),
            },
            // Per-attempt scheduling is too noisy for the durable log.
            ConnectionEvent::Reconnecting { .. } => return,
            ConnectionEvent::MaxAttemptsReached => HealthSample {
                timestamp_ms: unix_millis(),
                state: ConnectionState::Offline,
                latency_ms: None,
                error_message: Some("max reconnect attempts reached".to_string()),
            },
        };
        let _ = self.store.log_connection(&sample);
    }
}

/// No-op sink.
pub struct NoopEventSink;

impl ConnectionEventSink for NoopEventSink {
    fn on_event(&self, _event: &ConnectionEvent) {}
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Builds the JSON record emitted for a lifecycle event.
fn event_record(event: &ConnectionEvent) -> serde_json::Value {
    let mut record = json!({
        "event": event.label(),
        "timestamp_ms": unix_millis(),
    });
    match event {
        ConnectionEvent::StateChange { from, to } => {
            record["from"] = json!(from.as_str());
            record["to"] = json!(to.as_str());
        }
        ConnectionEvent::Connected { latency_ms } => {
            record["latency_ms"] = json!(latency_ms);
        }
        ConnectionEvent::Disconnected { error } => {
            record["error"] = json!(error);
        }
        ConnectionEvent::Reconnecting { attempt, delay_ms } => {
            record["attempt"] = json!(attempt);
            record["delay_ms"] = json!(delay_ms);
        }
        ConnectionEvent::MaxAttemptsReached => {}
    }
    record
}

/// Emits a one-off runtime event as a JSON line on stderr.
///
/// Used by components without a sink registry (listener reconnects, preload
/// failures, parse errors that are logged and swallowed).
pub fn emit_runtime_event(event: &str, detail: &str) {
    let record = json!({
        "event": event,
        "timestamp_ms": unix_millis(),
        "detail": detail,
    });
    if let Ok(payload) = serde_json::to_string(&record) {
        let _ = writeln!(std::io::stderr(), "{payload}");
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
