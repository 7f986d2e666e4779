// crates/context-relay-engine/tests/listener.rs
// ============================================================================
// Module: Invalidation Listener Tests
// Description: End-to-end push-invalidation tests against a local SSE server.
// Purpose: Validate stream consumption, batch dispatch, malformed-event
//          tolerance, and idempotent start/stop.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use axum::Router;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use common::ManualClock;
use context_relay_engine::CacheEngine;
use context_relay_engine::InvalidationListener;
use context_relay_engine::ListenerConfig;
use context_relay_store_sqlite::SqliteStore;
use context_relay_store_sqlite::SqliteStoreConfig;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn engine_in(temp: &TempDir) -> Arc<CacheEngine> {
    let store = Arc::new(
        SqliteStore::open(&SqliteStoreConfig::for_path(temp.path().join("cache.db")))
            .expect("store open"),
    );
    Arc::new(CacheEngine::new(store, ManualClock::new(0), 1024 * 1024))
}

/// Serves a fixed SSE body at the well-known invalidation path.
async fn serve_sse_body(body: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/sse/cache-invalidation",
        get(move || async move {
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn listener_for(cache: Arc<CacheEngine>, addr: SocketAddr) -> InvalidationListener {
    let mut config = ListenerConfig::new(format!("http://{addr}"), None);
    config.reconnect_delay = Duration::from_millis(200);
    InvalidationListener::new(cache, config).expect("listener")
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// SECTION: Stream Consumption
// ============================================================================

#[tokio::test]
async fn document_invalidate_event_drops_the_cached_row() {
    let temp = TempDir::new().unwrap();
    let cache = engine_in(&temp);
    cache
        .set_document("rule", "WRITING-STYLE", "use plain prose", "", &json!({}))
        .unwrap();

    let addr = serve_sse_body(
        "event: document:invalidate\n\
         data: {\"type\":\"document\",\"docType\":\"rule\",\"name\":\"WRITING-STYLE\"}\n\n",
    )
    .await;
    let listener = listener_for(cache.clone(), addr);
    listener.start();

    wait_for(
        || cache.get_document("rule", "WRITING-STYLE", "").unwrap().is_none(),
        "document invalidation",
    )
    .await;
    listener.stop();
    assert!(!listener.is_listening());
}

#[tokio::test]
async fn batch_event_drops_documents_and_memories() {
    let temp = TempDir::new().unwrap();
    let cache = engine_in(&temp);
    cache.set_document("frd", "checkout", "spec", "shop", &json!({})).unwrap();
    cache.set_memory("session", "ctx", "shop", &json!({})).unwrap();

    let addr = serve_sse_body(
        "event: cache:invalidate:batch\n\
         data: [{\"type\":\"document\",\"docType\":\"frd\",\"name\":\"checkout\",\"project\":\"shop\"},\
         {\"type\":\"memory\",\"name\":\"session\",\"project\":\"shop\"}]\n\n",
    )
    .await;
    let listener = listener_for(cache.clone(), addr);
    listener.start();

    wait_for(
        || {
            cache.get_document("frd", "checkout", "shop").unwrap().is_none()
                && cache.get_memory("session", "shop").unwrap().is_none()
        },
        "batch invalidation",
    )
    .await;
    listener.stop();
}

#[tokio::test]
async fn malformed_and_partial_events_never_kill_the_stream() {
    let temp = TempDir::new().unwrap();
    let cache = engine_in(&temp);
    cache.set_memory("keep", "v", "", &json!({})).unwrap();
    cache.set_memory("drop", "v", "", &json!({})).unwrap();

    // A document event missing docType and a garbage payload precede the
    // valid memory invalidation; both are logged and skipped.
    let addr = serve_sse_body(
        "event: document:invalidate\n\
         data: {\"type\":\"document\",\"name\":\"no-doc-type\"}\n\n\
         event: memory:invalidate\n\
         data: not json at all\n\n\
         event: memory:invalidate\n\
         data: {\"type\":\"memory\",\"name\":\"drop\"}\n\n",
    )
    .await;
    let listener = listener_for(cache.clone(), addr);
    listener.start();

    wait_for(|| cache.get_memory("drop", "").unwrap().is_none(), "valid event applied").await;
    assert!(cache.get_memory("keep", "").unwrap().is_some());
    listener.stop();
}

// ============================================================================
// SECTION: Lifecycle
// ============================================================================

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let temp = TempDir::new().unwrap();
    let cache = engine_in(&temp);
    let addr = serve_sse_body("event: memory:invalidate\ndata: {\"type\":\"memory\",\"name\":\"x\"}\n\n").await;
    let listener = listener_for(cache, addr);

    listener.start();
    listener.start();
    listener.stop();
    listener.stop();
    assert!(!listener.is_listening());
}

#[tokio::test]
async fn listener_reconnects_after_the_stream_closes() {
    let temp = TempDir::new().unwrap();
    let cache = engine_in(&temp);
    cache.set_memory("first", "v", "", &json!({})).unwrap();

    let addr = serve_sse_body(
        "event: memory:invalidate\ndata: {\"type\":\"memory\",\"name\":\"first\"}\n\n",
    )
    .await;
    let listener = listener_for(cache.clone(), addr);
    listener.start();
    wait_for(|| cache.get_memory("first", "").unwrap().is_none(), "first pass").await;

    // The server closes each response; after the fixed delay the listener
    // reconnects and applies the (idempotent) event again.
    cache.set_memory("first", "v2", "", &json!({})).unwrap();
    wait_for(|| cache.get_memory("first", "").unwrap().is_none(), "second pass").await;
    listener.stop();
}
