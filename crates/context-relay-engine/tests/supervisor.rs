// crates/context-relay-engine/tests/supervisor.rs
// ============================================================================
// Module: Connection Supervisor Tests
// Description: State machine, backoff, and execute-gating tests.
// Purpose: Validate probe-driven transitions, the bounded reconnect budget,
//          event emission, and the execute check-and-run contract.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::MockUpstream;
use common::RecordingSink;
use common::wait_until;
use context_relay_core::ConnectionEvent;
use context_relay_core::ConnectionState;
use context_relay_core::UpstreamError;
use context_relay_engine::ConnectionSupervisor;
use context_relay_engine::ExecuteError;
use context_relay_engine::SupervisorConfig;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn fast_config(max_reconnect_attempts: u32) -> SupervisorConfig {
    SupervisorConfig {
        health_check_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(100),
        max_reconnect_attempts,
        backoff_initial: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        backoff_max: Duration::from_millis(400),
    }
}

fn supervisor_with(
    upstream: Arc<MockUpstream>,
    config: SupervisorConfig,
) -> (Arc<ConnectionSupervisor>, Arc<RecordingSink>) {
    let supervisor = Arc::new(ConnectionSupervisor::new(upstream, config));
    let sink = RecordingSink::new();
    supervisor.subscribe(sink.clone());
    (supervisor, sink)
}

// ============================================================================
// SECTION: Transitions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn successful_probe_moves_disconnected_to_connected() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, sink) = supervisor_with(upstream, fast_config(10));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    let events = sink.snapshot();
    assert!(events.iter().any(|event| matches!(
        event,
        ConnectionEvent::StateChange {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connected,
        }
    )));
    assert!(events.iter().any(|event| matches!(event, ConnectionEvent::Connected { .. })));

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ConnectionState::Offline);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_budget_goes_offline_once() {
    let upstream = MockUpstream::unreachable();
    let (supervisor, sink) = supervisor_with(upstream.clone(), fast_config(3));

    supervisor.start();
    wait_until("offline", || supervisor.state() == ConnectionState::Offline).await;

    assert_eq!(upstream.probes.load(Ordering::SeqCst), 3, "one probe per allowed attempt");
    let events = sink.snapshot();
    let max_reached = events
        .iter()
        .filter(|event| matches!(event, ConnectionEvent::MaxAttemptsReached))
        .count();
    assert_eq!(max_reached, 1, "MaxAttemptsReached emitted exactly once");

    let delays: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Reconnecting { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![50, 100], "geometric backoff before the terminal attempt");
}

#[tokio::test(start_paused = true)]
async fn lost_upstream_recovers_through_reconnecting() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, sink) = supervisor_with(upstream.clone(), fast_config(10));
    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    upstream.healthy.store(false, Ordering::SeqCst);
    wait_until("reconnecting", || supervisor.state() == ConnectionState::Reconnecting).await;

    upstream.healthy.store(true, Ordering::SeqCst);
    wait_until("reconnected", || supervisor.state() == ConnectionState::Connected).await;

    let events = sink.snapshot();
    assert!(events.iter().any(|event| matches!(event, ConnectionEvent::Disconnected { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        ConnectionEvent::StateChange {
            from: ConnectionState::Reconnecting,
            to: ConnectionState::Connected,
        }
    )));
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_terminal() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, _sink) = supervisor_with(upstream.clone(), fast_config(10));
    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), ConnectionState::Offline);

    let probes_at_stop = upstream.probes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        upstream.probes.load(Ordering::SeqCst),
        probes_at_stop,
        "timers cancelled after stop"
    );
}

// ============================================================================
// SECTION: Execute Gating
// ============================================================================

#[tokio::test(start_paused = true)]
async fn execute_refuses_when_not_connected() {
    let upstream = MockUpstream::unreachable();
    let (supervisor, _sink) = supervisor_with(upstream, fast_config(10));
    let ran = Arc::new(AtomicBool::new(false));

    let ran_flag = Arc::clone(&ran);
    let result: Result<(), ExecuteError> = supervisor
        .execute(move || async move {
            ran_flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(ExecuteError::NotConnected(ConnectionState::Disconnected))));
    assert!(!ran.load(Ordering::SeqCst), "operation never dispatched");
}

#[tokio::test(start_paused = true)]
async fn execute_failure_records_and_rethrows() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, sink) = supervisor_with(upstream.clone(), fast_config(10));
    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    // Keep probes failing so the recorded failure does not immediately heal.
    upstream.healthy.store(false, Ordering::SeqCst);
    let result: Result<(), ExecuteError> = supervisor
        .execute(|| async { Err(UpstreamError::Transport("mid-call drop".to_string())) })
        .await;
    assert!(matches!(result, Err(ExecuteError::Upstream(_))), "error is rethrown");

    wait_until("reconnecting", || supervisor.state() == ConnectionState::Reconnecting).await;
    let events = sink.snapshot();
    assert!(events.iter().any(|event| matches!(
        event,
        ConnectionEvent::Disconnected { error } if error.contains("mid-call drop")
    )));
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn not_found_results_do_not_trip_the_state_machine() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, sink) = supervisor_with(upstream, fast_config(10));
    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    let result: Result<(), ExecuteError> = supervisor
        .execute(|| async { Err(UpstreamError::NotFound("ghost row".to_string())) })
        .await;
    assert!(matches!(
        result,
        Err(ExecuteError::Upstream(UpstreamError::NotFound(_)))
    ));

    // A missing resource is a completed round-trip; the connection holds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    let events = sink.snapshot();
    assert!(
        !events.iter().any(|event| matches!(event, ConnectionEvent::Disconnected { .. })),
        "no disconnect recorded for a not-found answer"
    );
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_probe_detects_a_silent_drop() {
    let upstream = MockUpstream::healthy_by_default();
    let (supervisor, _sink) = supervisor_with(upstream.clone(), fast_config(10));
    supervisor.start();
    wait_until("connected", || supervisor.state() == ConnectionState::Connected).await;

    // No execute traffic; only the periodic probe can notice the drop.
    upstream.healthy.store(false, Ordering::SeqCst);
    wait_until("reconnecting", || supervisor.state() == ConnectionState::Reconnecting).await;
    supervisor.stop().await;
}
