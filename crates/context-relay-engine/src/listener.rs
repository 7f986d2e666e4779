// crates/context-relay-engine/src/listener.rs
// ============================================================================
// Module: Invalidation Listener
// Description: Push-invalidation consumer for the upstream SSE stream.
// Purpose: Translate server-originated invalidation events into cache
//          deletions, reconnecting automatically on stream errors.
// Dependencies: context-relay-core, reqwest, serde, tokio
// ============================================================================

//! ## Overview
//! The listener holds a long-lived event-stream request against
//! `/sse/cache-invalidation` on the upstream base URL. Three named events
//! arrive with JSON payloads: `document:invalidate`, `memory:invalidate`,
//! and `cache:invalidate:batch`. Parse failures are logged and swallowed so
//! they never crash the stream; document events missing their type are
//! skipped the same way. Batch members are dispatched concurrently. When the
//! stream errors or closes, the listener reconnects after a fixed delay
//! unless it has been stopped. Start and stop are idempotent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::ACCEPT;
use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

use crate::cache::CacheEngine;
use crate::events::emit_runtime_event;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Well-known push-invalidation path on the upstream base URL.
pub const INVALIDATION_PATH: &str = "/sse/cache-invalidation";
/// Default delay before reconnecting a broken stream.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Connect timeout for opening the stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// SECTION: Configuration and Errors
// ============================================================================

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Upstream base URL (no trailing slash required).
    pub base_url: String,
    /// Optional bearer token sent at stream open.
    pub api_key: Option<String>,
    /// Delay before reconnecting a broken stream.
    pub reconnect_delay: Duration,
}

impl ListenerConfig {
    /// Builds a config with the default reconnect delay.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Listener construction failures.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The HTTP client could not be built.
    #[error("invalidation client error: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Invalidation Payloads
// ============================================================================

/// A single invalidation notice from the upstream.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InvalidationNotice {
    /// Drop one document row.
    Document {
        /// Document type; events missing it are logged and skipped.
        #[serde(rename = "docType", default)]
        doc_type: Option<String>,
        /// Document name.
        name: String,
        /// Owning project; empty string denotes the global scope.
        #[serde(default)]
        project: String,
    },
    /// Drop one memory row.
    Memory {
        /// Memory name.
        name: String,
        /// Owning project; empty string denotes the global scope.
        #[serde(default)]
        project: String,
    },
}

// ============================================================================
// SECTION: Listener
// ============================================================================

/// Push-invalidation stream consumer.
pub struct InvalidationListener {
    /// Cache engine receiving invalidations.
    cache: Arc<CacheEngine>,
    /// Stream endpoint configuration.
    config: ListenerConfig,
    /// HTTP client for the stream.
    client: Client,
    /// True between start() and stop().
    running: Arc<AtomicBool>,
    /// True while the underlying stream is open.
    listening: Arc<AtomicBool>,
    /// Stream task handle; present while started.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationListener {
    /// Builds a listener for the given cache and upstream.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] when the HTTP client cannot be built.
    pub fn new(cache: Arc<CacheEngine>, config: ListenerConfig) -> Result<Self, ListenerError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| ListenerError::Client(err.to_string()))?;
        Ok(Self {
            cache,
            config,
            client,
            running: Arc::new(AtomicBool::new(false)),
            listening: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Connects the stream and begins consuming events. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let config = self.config.clone();
        let client = self.client.clone();
        let running = Arc::clone(&self.running);
        let listening = Arc::clone(&self.listening);
        let handle = tokio::spawn(run_stream_loop(cache, config, client, running, listening));
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(handle);
        }
    }

    /// Closes the stream and stops reconnecting. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.task.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }

    /// True while the underlying stream is open and stop() has not been
    /// called.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SECTION: Stream Loop
// ============================================================================

/// Connect-consume-reconnect loop for the invalidation stream.
async fn run_stream_loop(
    cache: Arc<CacheEngine>,
    config: ListenerConfig,
    client: Client,
    running: Arc<AtomicBool>,
    listening: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match open_stream(&client, &config).await {
            Ok(response) => {
                listening.store(true, Ordering::SeqCst);
                if let Err(error) = consume_stream(response, &cache).await {
                    emit_runtime_event("invalidation_stream_error", &error);
                }
                listening.store(false, Ordering::SeqCst);
            }
            Err(error) => {
                emit_runtime_event("invalidation_connect_error", &error);
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Opens the event stream with the optional bearer header.
async fn open_stream(client: &Client, config: &ListenerConfig) -> Result<reqwest::Response, String> {
    let url = format!("{}{INVALIDATION_PATH}", config.base_url.trim_end_matches('/'));
    let mut request =
        client.get(url).header(ACCEPT, HeaderValue::from_static("text/event-stream"));
    if let Some(token) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| "invalid bearer token header".to_string())?;
        request = request.header(AUTHORIZATION, value);
    }
    let response = request.send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("invalidation stream status {}", status.as_u16()));
    }
    Ok(response)
}

/// Consumes the stream until the server closes it or the transport fails.
async fn consume_stream(
    mut response: reqwest::Response,
    cache: &Arc<CacheEngine>,
) -> Result<(), String> {
    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await.map_err(|err| err.to_string())? {
        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
        while let Some(boundary) = buffer.find("\n\n") {
            let frame: String = buffer.drain(.. boundary + 2).collect();
            if let Some((event, data)) = parse_frame(&frame) {
                handle_event(cache, &event, &data).await;
            }
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Frame Handling
// ============================================================================

/// Parses one SSE frame into its event name and joined data payload.
fn parse_frame(frame: &str) -> Option<(String, String)> {
    let mut event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
    }
    if event.is_empty() || data_lines.is_empty() {
        return None;
    }
    Some((event, data_lines.join("\n")))
}

/// Dispatches one named event to the cache engine.
async fn handle_event(cache: &Arc<CacheEngine>, event: &str, data: &str) {
    match event {
        "document:invalidate" | "memory:invalidate" => {
            match serde_json::from_str::<InvalidationNotice>(data) {
                Ok(notice) => apply_notice(cache, notice),
                Err(err) => {
                    emit_runtime_event("invalidation_parse_error", &err.to_string());
                }
            }
        }
        "cache:invalidate:batch" => match serde_json::from_str::<Vec<InvalidationNotice>>(data) {
            Ok(notices) => {
                let mut tasks = JoinSet::new();
                for notice in notices {
                    let cache = Arc::clone(cache);
                    tasks.spawn(async move { apply_notice(&cache, notice) });
                }
                while tasks.join_next().await.is_some() {}
            }
            Err(err) => {
                emit_runtime_event("invalidation_parse_error", &err.to_string());
            }
        },
        _ => {}
    }
}

/// Applies one invalidation notice; failures are logged and swallowed.
fn apply_notice(cache: &CacheEngine, notice: InvalidationNotice) {
    let result = match notice {
        InvalidationNotice::Document {
            doc_type: None, ..
        } => {
            emit_runtime_event("invalidation_skipped", "document event missing docType");
            return;
        }
        InvalidationNotice::Document {
            doc_type: Some(doc_type),
            name,
            project,
        } => cache.invalidate_document(&doc_type, &name, &project),
        InvalidationNotice::Memory {
            name,
            project,
        } => cache.invalidate_memory(&name, &project),
    };
    if let Err(err) = result {
        emit_runtime_event("invalidation_store_error", &err.to_string());
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
