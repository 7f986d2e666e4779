// crates/context-relay-engine/tests/common/mod.rs
// ============================================================================
// Module: Engine Test Support
// Description: Scripted upstream, manual clock, and event capture helpers.
// ============================================================================

#![allow(dead_code, reason = "Each test binary uses a subset of the helpers.")]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use context_relay_core::Clock;
use context_relay_core::ConnectionEvent;
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use context_relay_engine::ConnectionEventSink;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Manual Clock
// ============================================================================

/// Test clock advanced explicitly by the test body.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start_ms)))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SECTION: Scripted Upstream
// ============================================================================

/// In-memory upstream with scriptable health and write failures.
#[derive(Default)]
pub struct MockUpstream {
    /// Whether health probes succeed.
    pub healthy: AtomicBool,
    /// Number of upcoming mutations that fail (consumed per call).
    pub write_failures: AtomicU32,
    /// When set, every mutation fails.
    pub fail_all_writes: AtomicBool,
    /// Stored documents keyed by (doc_type, name, project).
    pub documents: Mutex<HashMap<(String, String, String), DocumentPayload>>,
    /// Stored memories keyed by (name, project).
    pub memories: Mutex<HashMap<(String, String), MemoryPayload>>,
    /// List responses keyed by doc_type.
    pub lists: Mutex<HashMap<String, Vec<DocumentPayload>>>,
    /// Recorded non-probe invocations in call order.
    pub invocations: Mutex<Vec<(String, Value)>>,
    /// Number of health probes observed.
    pub probes: AtomicU32,
}

impl MockUpstream {
    pub fn healthy_by_default() -> Arc<Self> {
        let mock = Arc::new(Self::default());
        mock.healthy.store(true, Ordering::SeqCst);
        mock
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Names of recorded invocations, in call order.
    pub fn invocation_names(&self) -> Vec<String> {
        self.invocations.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Recorded invocations matching one operation name.
    pub fn invocations_named(&self, name: &str) -> Vec<Value> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == name)
            .map(|(_, args)| args.clone())
            .collect()
    }

    fn record(&self, name: &str, args: Value) {
        self.invocations.lock().unwrap().push((name.to_string(), args));
    }

    fn write_result(&self) -> Result<(), UpstreamError> {
        if self.fail_all_writes.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("scripted write failure".to_string()));
        }
        let remaining = self.write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(UpstreamError::Transport("scripted write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn fetch_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<Option<DocumentPayload>, UpstreamError> {
        self.record(
            "fetch_document",
            json!({ "doc_type": doc_type, "name": name, "project": project }),
        );
        let key = (doc_type.to_string(), name.to_string(), project.to_string());
        Ok(self.documents.lock().unwrap().get(&key).cloned())
    }

    async fn list_documents(&self, doc_type: &str) -> Result<Vec<DocumentPayload>, UpstreamError> {
        self.record("list_documents", json!({ "doc_type": doc_type }));
        Ok(self.lists.lock().unwrap().get(doc_type).cloned().unwrap_or_default())
    }

    async fn create_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        self.record("create_document", serde_json::to_value(document).unwrap());
        self.write_result()?;
        let key =
            (document.doc_type.clone(), document.name.clone(), document.project.clone());
        self.documents.lock().unwrap().insert(key, document.clone());
        Ok(())
    }

    async fn update_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        self.record("update_document", serde_json::to_value(document).unwrap());
        self.write_result()?;
        let key =
            (document.doc_type.clone(), document.name.clone(), document.project.clone());
        self.documents.lock().unwrap().insert(key, document.clone());
        Ok(())
    }

    async fn delete_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<(), UpstreamError> {
        self.record(
            "delete_document",
            json!({ "doc_type": doc_type, "name": name, "project": project }),
        );
        self.write_result()?;
        let key = (doc_type.to_string(), name.to_string(), project.to_string());
        self.documents.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn fetch_memory(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<MemoryPayload>, UpstreamError> {
        self.record("fetch_memory", json!({ "name": name, "project": project }));
        let key = (name.to_string(), project.to_string());
        Ok(self.memories.lock().unwrap().get(&key).cloned())
    }

    async fn set_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        self.record("set_memory", serde_json::to_value(memory).unwrap());
        self.write_result()?;
        let key = (memory.name.clone(), memory.project.clone());
        self.memories.lock().unwrap().insert(key, memory.clone());
        Ok(())
    }

    async fn update_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        self.record("update_memory", serde_json::to_value(memory).unwrap());
        self.write_result()?;
        let key = (memory.name.clone(), memory.project.clone());
        self.memories.lock().unwrap().insert(key, memory.clone());
        Ok(())
    }

    async fn delete_memory(&self, name: &str, project: &str) -> Result<(), UpstreamError> {
        self.record("delete_memory", json!({ "name": name, "project": project }));
        self.write_result()?;
        let key = (name.to_string(), project.to_string());
        self.memories.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        self.record(name, arguments.clone());
        Ok(json!({ "tool": name, "arguments": arguments }))
    }

    async fn health_check(&self) -> Result<(), UpstreamError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(UpstreamError::Transport("scripted probe failure".to_string()))
        }
    }
}

// ============================================================================
// SECTION: Event Capture
// ============================================================================

/// Sink that records every lifecycle event.
#[derive(Default)]
pub struct RecordingSink {
    /// Captured events in delivery order.
    pub events: Mutex<Vec<ConnectionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<ConnectionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionEventSink for RecordingSink {
    fn on_event(&self, event: &ConnectionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// SECTION: Waiting
// ============================================================================

/// Polls a condition until it holds; panics after a bounded number of turns.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0 .. 2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached: {description}");
}
