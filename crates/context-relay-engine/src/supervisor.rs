// crates/context-relay-engine/src/supervisor.rs
// ============================================================================
// Module: Connection Supervisor
// Description: Upstream reachability state machine with backoff reconnection.
// Purpose: Maintain the authoritative connection state, probe the upstream,
//          and publish lifecycle events that drive the engine's sync.
// Dependencies: context-relay-core, tokio, thiserror
// ============================================================================

//! ## Overview
//! State mutations follow a single-writer principle: one driver task owns
//! the state machine and processes a command mailbox, so probe results,
//! failure reports, and stop requests are serialized. Observers read the
//! current state through a cheap snapshot accessor backed by the same lock
//! the driver writes, which keeps [`ConnectionSupervisor::execute`]'s
//! check-and-run consistent with transitions already decided.
//!
//! States: Disconnected (initial) -> Connected <-> Reconnecting -> Offline.
//! The single-shot connecting phase is a transition, not a durable state.
//! Backoff: `delay_n = min(initial * multiplier^n, max)` with n the 0-based
//! attempt counter; after `max_reconnect_attempts` consecutive failures the
//! supervisor goes Offline and emits `MaxAttemptsReached` exactly once.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use context_relay_core::ConnectionEvent;
use context_relay_core::ConnectionState;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::ConnectionEventSink;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Supervisor timing and retry configuration.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Periodic probe interval while Connected.
    pub health_check_interval: Duration,
    /// Probe cancellation timeout.
    pub probe_timeout: Duration,
    /// Consecutive failures tolerated before going Offline.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay.
    pub backoff_initial: Duration,
    /// Multiplier applied per failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on the reconnect delay.
    pub backoff_max: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            backoff_initial: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Computes the reconnect delay for a 0-based attempt counter.
#[must_use]
pub fn backoff_delay(config: &SupervisorConfig, attempt: u32) -> Duration {
    let initial_ms = config.backoff_initial.as_millis() as f64;
    let max_ms = config.backoff_max.as_millis() as f64;
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay_ms = initial_ms * config.backoff_multiplier.powi(exponent);
    if !delay_ms.is_finite() || delay_ms >= max_ms {
        return config.backoff_max;
    }
    Duration::from_millis(delay_ms as u64)
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Failures surfaced by [`ConnectionSupervisor::execute`].
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The supervisor is not in the Connected state.
    #[error("upstream not connected (state: {0})")]
    NotConnected(ConnectionState),
    /// The operation failed; the failure was recorded with the supervisor.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

// ============================================================================
// SECTION: Supervisor
// ============================================================================

/// Commands processed by the driver task.
enum Command {
    /// Run a probe now.
    Probe,
    /// An `execute` call observed an upstream failure.
    RecordFailure(String),
    /// Cancel all timers and go Offline.
    Stop,
}

/// Shared state between the supervisor handle and its driver task.
struct Shared {
    /// Authoritative connection state.
    state: Mutex<ConnectionState>,
    /// Registered lifecycle event sinks.
    sinks: Mutex<Vec<Arc<dyn ConnectionEventSink>>>,
}

impl Shared {
    /// Returns a snapshot of the current state.
    fn state(&self) -> ConnectionState {
        self.state.lock().map_or(ConnectionState::Offline, |guard| *guard)
    }

    /// Replaces the state, returning the previous value.
    fn swap_state(&self, next: ConnectionState) -> ConnectionState {
        self.state.lock().map_or(ConnectionState::Offline, |mut guard| {
            std::mem::replace(&mut *guard, next)
        })
    }

    /// Delivers an event to every registered sink.
    fn emit(&self, event: &ConnectionEvent) {
        let sinks: Vec<Arc<dyn ConnectionEventSink>> =
            self.sinks.lock().map_or_else(|_| Vec::new(), |guard| guard.clone());
        for sink in sinks {
            sink.on_event(event);
        }
    }
}

/// Upstream reachability supervisor.
pub struct ConnectionSupervisor {
    /// Probed upstream client.
    upstream: Arc<dyn UpstreamClient>,
    /// Timing and retry configuration.
    config: SupervisorConfig,
    /// State shared with the driver task.
    shared: Arc<Shared>,
    /// Command mailbox into the driver; present while started.
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    /// Driver task handle; present while started.
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Builds a supervisor in the Disconnected state.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamClient>, config: SupervisorConfig) -> Self {
        Self {
            upstream,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                sinks: Mutex::new(Vec::new()),
            }),
            commands: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    /// Registers a lifecycle event sink. Sinks registered after start receive
    /// only subsequent events.
    pub fn subscribe(&self, sink: Arc<dyn ConnectionEventSink>) {
        if let Ok(mut sinks) = self.shared.sinks.lock() {
            sinks.push(sink);
        }
    }

    /// Returns a snapshot of the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Starts the driver task: an immediate probe plus the periodic probe
    /// timer. Idempotent; must be called within a tokio runtime.
    pub fn start(&self) {
        let Ok(mut commands) = self.commands.lock() else {
            return;
        };
        if commands.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(16);
        let driver = Driver {
            upstream: Arc::clone(&self.upstream),
            config: self.config,
            shared: Arc::clone(&self.shared),
            probe_tx: tx.clone(),
            attempts: 0,
            reconnect_timer: None,
        };
        let handle = tokio::spawn(driver.run(rx));
        *commands = Some(tx);
        if let Ok(mut slot) = self.driver.lock() {
            *slot = Some(handle);
        }
    }

    /// Stops the supervisor: cancels all timers and transitions Offline.
    /// Idempotent.
    pub async fn stop(&self) {
        let tx = self.commands.lock().ok().and_then(|mut guard| guard.take());
        match tx {
            Some(tx) => {
                let _ = tx.send(Command::Stop).await;
            }
            None => {
                // Never started (or already stopped): go Offline directly.
                let previous = self.shared.swap_state(ConnectionState::Offline);
                if previous != ConnectionState::Offline {
                    self.shared.emit(&ConnectionEvent::StateChange {
                        from: previous,
                        to: ConnectionState::Offline,
                    });
                }
            }
        }
        let handle = self.driver.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Reports an upstream failure observed outside a probe.
    pub fn record_failure(&self, error: String) {
        if let Ok(guard) = self.commands.lock()
            && let Some(tx) = guard.as_ref()
        {
            let _ = tx.try_send(Command::RecordFailure(error));
        }
    }

    /// Runs `op` if and only if the supervisor is Connected.
    ///
    /// On failure the error is recorded (triggering the Connected ->
    /// Reconnecting transition) and re-thrown. The state check reads the
    /// authoritative snapshot the driver writes, so an operation is never
    /// dispatched into a state that has already decided to reconnect.
    /// [`UpstreamError::NotFound`] is a completed round-trip, not a
    /// connectivity failure; it is re-thrown without being recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::NotConnected`] when not Connected, or the
    /// re-thrown [`UpstreamError`].
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ExecuteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ExecuteError::NotConnected(state));
        }
        match op().await {
            Ok(value) => Ok(value),
            Err(err) => {
                if !matches!(&err, UpstreamError::NotFound(_)) {
                    self.record_failure(err.to_string());
                }
                Err(ExecuteError::Upstream(err))
            }
        }
    }
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Single-writer owner of the state machine.
struct Driver {
    /// Probed upstream client.
    upstream: Arc<dyn UpstreamClient>,
    /// Timing and retry configuration.
    config: SupervisorConfig,
    /// State shared with the supervisor handle.
    shared: Arc<Shared>,
    /// Sender used by reconnect timers to request probes.
    probe_tx: mpsc::Sender<Command>,
    /// Consecutive failures in the current outage.
    attempts: u32,
    /// Pending reconnect timer, if any.
    reconnect_timer: Option<JoinHandle<()>>,
}

impl Driver {
    /// Runs the driver until stopped.
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.probe().await;
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.health_check_interval,
            self.config.health_check_interval,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None | Some(Command::Stop) => {
                        self.shutdown();
                        break;
                    }
                    Some(Command::Probe) => self.probe().await,
                    Some(Command::RecordFailure(error)) => self.handle_failure(error),
                },
                _ = interval.tick() => {
                    if self.shared.state() == ConnectionState::Connected {
                        self.probe().await;
                    }
                }
            }
        }
    }

    /// Probes the upstream with the configured timeout.
    async fn probe(&mut self) {
        if self.shared.state() == ConnectionState::Offline {
            return;
        }
        let started = Instant::now();
        let result =
            tokio::time::timeout(self.config.probe_timeout, self.upstream.health_check()).await;
        match result {
            Ok(Ok(())) => self.handle_success(started.elapsed()),
            Ok(Err(err)) => self.handle_failure(err.to_string()),
            Err(_) => self.handle_failure(format!(
                "probe timed out after {} ms",
                self.config.probe_timeout.as_millis()
            )),
        }
    }

    /// Handles a successful probe.
    fn handle_success(&mut self, latency: Duration) {
        self.attempts = 0;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        let previous = self.shared.swap_state(ConnectionState::Connected);
        if previous != ConnectionState::Connected {
            self.shared.emit(&ConnectionEvent::StateChange {
                from: previous,
                to: ConnectionState::Connected,
            });
        }
        self.shared.emit(&ConnectionEvent::Connected {
            latency_ms: latency.as_millis().min(u128::from(u64::MAX)) as u64,
        });
    }

    /// Handles a probe failure or an external failure report.
    fn handle_failure(&mut self, error: String) {
        match self.shared.state() {
            ConnectionState::Offline => {}
            ConnectionState::Connected | ConnectionState::Disconnected => {
                self.attempts = 1;
                let previous = self.shared.swap_state(ConnectionState::Reconnecting);
                self.shared.emit(&ConnectionEvent::StateChange {
                    from: previous,
                    to: ConnectionState::Reconnecting,
                });
                self.shared.emit(&ConnectionEvent::Disconnected {
                    error,
                });
                self.after_failure();
            }
            ConnectionState::Reconnecting => {
                self.attempts = self.attempts.saturating_add(1);
                self.after_failure();
            }
        }
    }

    /// Schedules the next reconnect probe or exhausts the attempt budget.
    fn after_failure(&mut self) {
        if self.attempts >= self.config.max_reconnect_attempts {
            self.go_offline();
            return;
        }
        let delay = backoff_delay(&self.config, self.attempts.saturating_sub(1));
        self.shared.emit(&ConnectionEvent::Reconnecting {
            attempt: self.attempts,
            delay_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
        });
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        let tx = self.probe_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::Probe).await;
        }));
    }

    /// Exhausts the reconnect budget: Offline, MaxAttemptsReached once.
    fn go_offline(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        let previous = self.shared.swap_state(ConnectionState::Offline);
        if previous != ConnectionState::Offline {
            self.shared.emit(&ConnectionEvent::StateChange {
                from: previous,
                to: ConnectionState::Offline,
            });
            self.shared.emit(&ConnectionEvent::MaxAttemptsReached);
        }
    }

    /// Stop path: cancel timers and transition Offline.
    fn shutdown(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        let previous = self.shared.swap_state(ConnectionState::Offline);
        if previous != ConnectionState::Offline {
            self.shared.emit(&ConnectionEvent::StateChange {
                from: previous,
                to: ConnectionState::Offline,
            });
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
