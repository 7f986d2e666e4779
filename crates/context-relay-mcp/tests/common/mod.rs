// crates/context-relay-mcp/tests/common/mod.rs
// ============================================================================
// Module: Dispatcher Test Support
// Description: Scripted upstream, manual clock, and a wired relay harness.
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
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use context_relay_engine::CacheEngine;
use context_relay_engine::ConnectionSupervisor;
use context_relay_engine::SupervisorConfig;
use context_relay_engine::WriteQueue;
use context_relay_mcp::Dispatcher;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::SqliteStoreConfig;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

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
// SECTION: Wired Harness
// ============================================================================

/// A dispatcher wired over real engine components and the scripted upstream.
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Arc<CacheEngine>,
    pub queue: Arc<WriteQueue>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub upstream: Arc<MockUpstream>,
    pub clock: Arc<ManualClock>,
    _temp: TempDir,
}

impl Harness {
    /// Builds the harness without preload kinds.
    pub fn new(upstream: Arc<MockUpstream>) -> Self {
        Self::with_preload(upstream, Vec::new())
    }

    /// Builds the harness with the given preload kinds.
    pub fn with_preload(upstream: Arc<MockUpstream>, preload: Vec<String>) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::open(&SqliteStoreConfig::for_path(temp.path().join("cache.db")))
                .expect("store open"),
        );
        let clock = ManualClock::new(1_000);
        let cache = Arc::new(CacheEngine::new(Arc::clone(&store), clock.clone(), 1024 * 1024));
        let queue = Arc::new(WriteQueue::new(
            store,
            upstream.clone() as Arc<dyn UpstreamClient>,
            clock.clone(),
            3,
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            upstream.clone() as Arc<dyn UpstreamClient>,
            fast_supervisor_config(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            upstream.clone() as Arc<dyn UpstreamClient>,
            Arc::clone(&supervisor),
            preload,
        ));
        dispatcher.attach_to_supervisor();
        Self {
            dispatcher,
            cache,
            queue,
            supervisor,
            upstream,
            clock,
            _temp: temp,
        }
    }

    /// Starts the supervisor and waits for the Connected state.
    pub async fn start_connected(&self) {
        self.supervisor.start();
        wait_until("connected", || {
            self.supervisor.state() == context_relay_core::ConnectionState::Connected
        })
        .await;
    }

    /// Starts the supervisor against an unreachable upstream and waits for
    /// the Reconnecting state.
    pub async fn start_reconnecting(&self) {
        self.supervisor.start();
        wait_until("reconnecting", || {
            self.supervisor.state() == context_relay_core::ConnectionState::Reconnecting
        })
        .await;
    }
}

/// Short timings so paused-clock tests converge quickly.
fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        health_check_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(100),
        max_reconnect_attempts: 1_000,
        backoff_initial: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        backoff_max: Duration::from_millis(200),
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

/// Serializes an envelope for JSON-level assertions.
pub fn to_json(envelope: &context_relay_core::ResponseEnvelope) -> Value {
    serde_json::to_value(envelope).expect("envelope serializes")
}
