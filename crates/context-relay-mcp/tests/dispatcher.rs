// crates/context-relay-mcp/tests/dispatcher.rs
// ============================================================================
// Module: Dispatcher Tests
// Description: Envelope-level tests for the relay's tool routing.
// Purpose: Validate the read, write, and pass-through paths across
//          connection states, replay on reconnect, and preload.
// ============================================================================

//! ## Overview
//! Each test wires the dispatcher over real engine components (SQLite store,
//! cache, queue, supervisor) and a scripted upstream, then asserts on the
//! serialized envelopes:
//! - read-after-write while connected returns live then cache sources
//! - offline writes queue, then replay exactly once on reconnect
//! - invalidation makes the next connected read fetch fresh
//! - pass-through tools answer OFFLINE while reconnecting
//! - every envelope carries `_metadata.status`

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::atomic::Ordering;

use common::Harness;
use common::MockUpstream;
use common::to_json;
use common::wait_until;
use context_relay_core::DocumentPayload;
use serde_json::json;

// ============================================================================
// SECTION: Scenario A — read after write while connected
// ============================================================================

#[tokio::test(start_paused = true)]
async fn read_after_write_while_connected() {
    let harness = Harness::new(MockUpstream::healthy_by_default());
    harness.start_connected().await;

    let write = harness
        .dispatcher
        .handle_tool_call(
            "set_memory",
            json!({ "name": "ctx", "content": "hello", "project": "proj" }),
        )
        .await;
    let write = to_json(&write);
    assert_eq!(write["data"]["success"], true);
    assert_eq!(write["_metadata"]["source"], "live");
    assert_eq!(write["_metadata"]["status"], "connected");

    let read = harness
        .dispatcher
        .handle_tool_call("get_memory", json!({ "name": "ctx", "project": "proj" }))
        .await;
    let read = to_json(&read);
    assert_eq!(read["data"]["name"], "ctx");
    assert_eq!(read["data"]["project"], "proj");
    assert_eq!(read["data"]["content"], "hello");
    assert_eq!(read["_metadata"]["source"], "cache");
    assert_eq!(read["_metadata"]["age_seconds"], 0);

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Scenario B — offline write then reconnect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn offline_write_replays_once_on_reconnect() {
    let upstream = MockUpstream::unreachable();
    let harness = Harness::new(upstream.clone());
    harness.start_reconnecting().await;

    let write = harness
        .dispatcher
        .handle_tool_call(
            "create_document",
            json!({ "doc_type": "workflow", "name": "feat", "content": "<md>" }),
        )
        .await;
    let write = to_json(&write);
    assert_eq!(write["data"]["success"], true);
    assert_eq!(write["data"]["queued"], true);
    assert_eq!(write["_metadata"]["source"], "cache");
    let warning = write["_metadata"]["warning"].as_str().expect("warning present");
    assert!(warning.starts_with("Operation queued"));
    assert_eq!(harness.queue.pending_count().unwrap(), 1);
    assert!(upstream.invocations_named("create_document").is_empty());

    upstream.healthy.store(true, Ordering::SeqCst);
    wait_until("queue drained", || harness.queue.pending_count().unwrap() == 0).await;

    let creates = upstream.invocations_named("create_document");
    assert_eq!(creates.len(), 1, "replayed exactly once");
    assert_eq!(creates[0]["doc_type"], "workflow");
    assert_eq!(creates[0]["name"], "feat");
    assert_eq!(creates[0]["content"], "<md>");

    let stats = harness.cache.stats().unwrap();
    assert_eq!(stats.critical_count, 1, "workflow row cached as critical");

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn connected_write_failure_falls_back_to_the_queue() {
    let upstream = MockUpstream::healthy_by_default();
    let harness = Harness::new(upstream.clone());
    harness.start_connected().await;
    upstream.fail_all_writes.store(true, Ordering::SeqCst);

    let write = harness
        .dispatcher
        .handle_tool_call(
            "update_document",
            json!({ "doc_type": "frd", "name": "spec", "content": "v2" }),
        )
        .await;
    let write = to_json(&write);
    assert_eq!(write["data"]["queued"], true);
    assert_eq!(harness.queue.pending_count().unwrap(), 1);
    // The local cache already reflects the write.
    let row = harness.cache.get_document("frd", "spec", "").unwrap().expect("cached");
    assert_eq!(row.row.content, "v2");

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Scenario E — invalidation forces a fresh fetch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalidated_row_is_refetched_live_while_connected() {
    let upstream = MockUpstream::healthy_by_default();
    upstream.documents.lock().unwrap().insert(
        ("rule".to_string(), "WRITING-STYLE".to_string(), String::new()),
        DocumentPayload {
            doc_type: "rule".to_string(),
            name: "WRITING-STYLE".to_string(),
            project: String::new(),
            content: "fresh upstream copy".to_string(),
            metadata: json!({}),
        },
    );
    let harness = Harness::new(upstream.clone());
    harness.start_connected().await;
    harness.cache.set_document("rule", "WRITING-STYLE", "stale local copy", "", &json!({})).unwrap();

    harness.cache.invalidate_document("rule", "WRITING-STYLE", "").unwrap();
    assert!(harness.cache.get_document("rule", "WRITING-STYLE", "").unwrap().is_none());

    let read = harness
        .dispatcher
        .handle_tool_call("get_document", json!({ "doc_type": "rule", "name": "WRITING-STYLE" }))
        .await;
    let read = to_json(&read);
    assert_eq!(read["_metadata"]["source"], "live");
    assert_eq!(read["data"]["content"], "fresh upstream copy");
    assert_eq!(upstream.invocations_named("fetch_document").len(), 1);

    // The fresh fetch repopulated the cache.
    let cached = harness.cache.get_document("rule", "WRITING-STYLE", "").unwrap().expect("row");
    assert_eq!(cached.row.content, "fresh upstream copy");

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Scenario F — pass-through offline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pass_through_while_reconnecting_returns_offline() {
    let upstream = MockUpstream::unreachable();
    let harness = Harness::new(upstream.clone());
    harness.start_reconnecting().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("search_codebase", json!({ "query": "retry policy" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["error"]["code"], "OFFLINE");
    assert_eq!(envelope["_metadata"]["status"], "reconnecting");
    assert!(upstream.invocations_named("search_codebase").is_empty(), "upstream never invoked");

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pass_through_while_connected_forwards_and_wraps() {
    let upstream = MockUpstream::healthy_by_default();
    let harness = Harness::new(upstream.clone());
    harness.start_connected().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("search_codebase", json!({ "query": "retry policy" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["data"]["tool"], "search_codebase");
    assert_eq!(envelope["data"]["arguments"]["query"], "retry policy");
    assert_eq!(envelope["_metadata"]["source"], "live");

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Read Path Details
// ============================================================================

#[tokio::test(start_paused = true)]
async fn read_miss_while_offline_is_unavailable_with_hints() {
    let harness = Harness::new(MockUpstream::unreachable());
    harness.start_reconnecting().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("get_workflow", json!({ "name": "release" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["error"]["code"], "UNAVAILABLE");
    assert_eq!(envelope["_metadata"]["source"], "cache");
    let suggestions = envelope["error"]["suggestions"].as_array().expect("suggestions");
    assert!(suggestions.iter().any(|hint| hint.as_str().unwrap().contains("connection")));
    assert!(
        suggestions.iter().any(|hint| hint.as_str().unwrap().contains("workflow")),
        "workflow reads carry a fallback hint"
    );

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cached_reads_work_in_every_connection_state() {
    let upstream = MockUpstream::unreachable();
    let harness = Harness::new(upstream.clone());
    harness.cache.set_document("workflow", "release", "steps", "", &json!({})).unwrap();
    harness.start_reconnecting().await;

    harness.clock.advance(9_000);
    let envelope = harness
        .dispatcher
        .handle_tool_call("get_workflow", json!({ "name": "release" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["data"]["content"], "steps");
    assert_eq!(envelope["_metadata"]["source"], "cache");
    assert_eq!(envelope["_metadata"]["age_seconds"], 9);
    assert_eq!(envelope["_metadata"]["status"], "reconnecting");

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn live_fetch_miss_returns_unavailable() {
    let harness = Harness::new(MockUpstream::healthy_by_default());
    harness.start_connected().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("get_document", json!({ "doc_type": "frd", "name": "ghost" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["error"]["code"], "UNAVAILABLE");

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Envelope Properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn every_envelope_carries_a_status() {
    let harness = Harness::new(MockUpstream::unreachable());
    harness.start_reconnecting().await;

    let calls = [
        ("get_memory", json!({ "name": "missing" })),
        ("get_memory", json!({ "not-the-right": "shape" })),
        ("unknown_tool", json!({})),
        ("delete_memory", json!({ "name": "anything" })),
    ];
    for (tool, arguments) in calls {
        let envelope =
            to_json(&harness.dispatcher.handle_tool_call(tool, arguments.clone()).await);
        let status = envelope["_metadata"]["status"].as_str();
        assert!(status.is_some(), "{tool} envelope must carry a status");
    }

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_arguments_yield_tool_error() {
    let harness = Harness::new(MockUpstream::healthy_by_default());
    harness.start_connected().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("create_document", json!({ "name": "missing doc_type" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["error"]["code"], "TOOL_ERROR");
    assert_eq!(harness.queue.pending_count().unwrap(), 0, "nothing queued for bad input");

    harness.supervisor.stop().await;
}

// ============================================================================
// SECTION: Deletes and Preload
// ============================================================================

#[tokio::test(start_paused = true)]
async fn offline_delete_invalidates_locally_and_queues() {
    let upstream = MockUpstream::unreachable();
    let harness = Harness::new(upstream.clone());
    harness.cache.set_memory("ctx", "v", "proj", &json!({})).unwrap();
    harness.start_reconnecting().await;

    let envelope = harness
        .dispatcher
        .handle_tool_call("delete_memory", json!({ "name": "ctx", "project": "proj" }))
        .await;
    let envelope = to_json(&envelope);
    assert_eq!(envelope["data"]["queued"], true);
    assert!(harness.cache.get_memory("ctx", "proj").unwrap().is_none(), "applied locally first");
    assert_eq!(harness.queue.pending_count().unwrap(), 1);

    upstream.healthy.store(true, Ordering::SeqCst);
    wait_until("delete replayed", || harness.queue.pending_count().unwrap() == 0).await;
    let deletes = upstream.invocations_named("delete_memory");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0]["name"], "ctx");
    assert_eq!(deletes[0]["project"], "proj");

    harness.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn preload_sweep_fills_the_critical_tier_on_connect() {
    let upstream = MockUpstream::healthy_by_default();
    upstream.lists.lock().unwrap().insert(
        "workflow".to_string(),
        vec![
            DocumentPayload {
                doc_type: "workflow".to_string(),
                name: "build".to_string(),
                project: String::new(),
                content: "steps".to_string(),
                metadata: json!({}),
            },
            DocumentPayload {
                doc_type: "workflow".to_string(),
                name: "release".to_string(),
                project: String::new(),
                content: "steps".to_string(),
                metadata: json!({}),
            },
        ],
    );
    let harness = Harness::with_preload(
        upstream.clone(),
        vec!["workflows".to_string(), "rules".to_string()],
    );
    harness.start_connected().await;

    wait_until("preload finished", || {
        harness.cache.stats().map(|stats| stats.critical_count == 2).unwrap_or(false)
    })
    .await;
    assert!(harness.cache.get_document("workflow", "build", "").unwrap().is_some());
    assert_eq!(upstream.invocations_named("list_documents").len(), 2, "one sweep per kind");

    harness.supervisor.stop().await;
}
