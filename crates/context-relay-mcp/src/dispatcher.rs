// crates/context-relay-mcp/src/dispatcher.rs
// ============================================================================
// Module: Request Dispatcher
// Description: Tool routing over the cache, write queue, and upstream.
// Purpose: Serve every tool call with a uniform envelope: cacheable reads
//          from the local store, durable writes applied locally and synced,
//          everything else passed through while connected.
// Dependencies: context-relay-core, context-relay-engine, serde, tokio
// ============================================================================

//! ## Overview
//! Read path: cache hit returns immediately with an age annotation; a miss
//! while Connected fetches live, populates the cache, and returns the
//! payload; a miss otherwise returns a structured UNAVAILABLE envelope.
//! Write path: the mutation is applied to the cache first, then either
//! executed upstream or enqueued for replay with a queued warning. On the
//! supervisor's transition into Connected the dispatcher fires queue replay
//! and the preload sweep as detached tasks. The back-reference from the
//! supervisor into the dispatcher is a weak callback, so ownership stays
//! acyclic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Weak;

use context_relay_config::preload_doc_type;
use context_relay_core::CacheRow;
use context_relay_core::ConnectionEvent;
use context_relay_core::ConnectionState;
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::QueueOperation;
use context_relay_core::ResponseEnvelope;
use context_relay_core::RowKind;
use context_relay_core::ToolDefinition;
use context_relay_core::ToolName;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use context_relay_core::tool_definitions;
use context_relay_engine::CacheEngine;
use context_relay_engine::ConnectionEventSink;
use context_relay_engine::ConnectionSupervisor;
use context_relay_engine::ExecuteError;
use context_relay_engine::WriteQueue;
use context_relay_engine::emit_runtime_event;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Warning attached to write envelopes that were queued for replay.
pub const QUEUED_WARNING: &str = "Operation queued — will sync when connection restored";

// ============================================================================
// SECTION: Argument Shapes
// ============================================================================

/// Arguments for name + optional project tools.
#[derive(Debug, Deserialize)]
struct NameProjectArgs {
    /// Row name.
    name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
}

/// Arguments for `get_document` and `delete_document`.
#[derive(Debug, Deserialize)]
struct DocumentKeyArgs {
    /// Document type identifier.
    doc_type: String,
    /// Document name.
    name: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
}

/// Arguments for document write tools.
#[derive(Debug, Deserialize)]
struct DocumentWriteArgs {
    /// Document type identifier.
    doc_type: String,
    /// Document name.
    name: String,
    /// Document content.
    content: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
    /// Opaque metadata map.
    #[serde(default = "empty_object")]
    metadata: Value,
}

/// Arguments for memory write tools.
#[derive(Debug, Deserialize)]
struct MemoryWriteArgs {
    /// Memory name.
    name: String,
    /// Memory content.
    content: String,
    /// Owning project; empty string denotes the global scope.
    #[serde(default)]
    project: String,
    /// Opaque metadata map.
    #[serde(default = "empty_object")]
    metadata: Value,
}

/// Default metadata for writes that omit it.
fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ============================================================================
// SECTION: Dispatcher
// ============================================================================

/// Tool-call router over the offline-resilience engine.
pub struct Dispatcher {
    /// Two-tier cache engine.
    cache: Arc<CacheEngine>,
    /// Durable write queue.
    queue: Arc<WriteQueue>,
    /// Upstream client for live calls.
    upstream: Arc<dyn UpstreamClient>,
    /// Connection supervisor consulted for every envelope.
    supervisor: Arc<ConnectionSupervisor>,
    /// Document-type kinds preloaded after reconnect.
    preload: Vec<String>,
}

impl Dispatcher {
    /// Builds a dispatcher over the engine components.
    #[must_use]
    pub fn new(
        cache: Arc<CacheEngine>,
        queue: Arc<WriteQueue>,
        upstream: Arc<dyn UpstreamClient>,
        supervisor: Arc<ConnectionSupervisor>,
        preload: Vec<String>,
    ) -> Self {
        Self {
            cache,
            queue,
            upstream,
            supervisor,
            preload,
        }
    }

    /// Registers the connected-transition hook with the supervisor.
    ///
    /// The sink holds only a weak reference, so the supervisor never keeps
    /// the dispatcher alive.
    pub fn attach_to_supervisor(self: &Arc<Self>) {
        let sink = Arc::new(ConnectedTasksSink {
            dispatcher: Arc::downgrade(self),
        });
        self.supervisor.subscribe(sink);
    }

    /// Returns the static tool catalog, identical in every connection state.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }

    /// Routes one tool call; always terminates with a well-formed envelope.
    pub async fn handle_tool_call(&self, name: &str, arguments: Value) -> ResponseEnvelope {
        match ToolName::parse(name) {
            Some(ToolName::GetWorkflow) => match decode::<NameProjectArgs>(arguments) {
                Ok(args) => self.read_document("workflow", &args.name, &args.project).await,
                Err(message) => self.invalid_arguments(name, &message),
            },
            Some(ToolName::GetDocument) => match decode::<DocumentKeyArgs>(arguments) {
                Ok(args) => self.read_document(&args.doc_type, &args.name, &args.project).await,
                Err(message) => self.invalid_arguments(name, &message),
            },
            Some(ToolName::GetMemory) => match decode::<NameProjectArgs>(arguments) {
                Ok(args) => self.read_memory(&args.name, &args.project).await,
                Err(message) => self.invalid_arguments(name, &message),
            },
            Some(ToolName::CreateDocument) => {
                self.write_document(QueueOperation::CreateDocument, name, arguments).await
            }
            Some(ToolName::UpdateDocument) => {
                self.write_document(QueueOperation::UpdateDocument, name, arguments).await
            }
            Some(ToolName::SetMemory) => {
                self.write_memory(QueueOperation::SetMemory, name, arguments).await
            }
            Some(ToolName::UpdateMemory) => {
                self.write_memory(QueueOperation::UpdateMemory, name, arguments).await
            }
            Some(ToolName::DeleteDocument) => self.delete_document(name, arguments).await,
            Some(ToolName::DeleteMemory) => self.delete_memory(name, arguments).await,
            None => self.pass_through(name, arguments).await,
        }
    }

    /// Builds a TOOL_ERROR envelope for malformed arguments.
    fn invalid_arguments(&self, tool: &str, message: &str) -> ResponseEnvelope {
        ResponseEnvelope::tool_error(
            format!("invalid arguments for {tool}: {message}"),
            self.supervisor.state(),
        )
    }
}

// ============================================================================
// SECTION: Read Paths
// ============================================================================

impl Dispatcher {
    /// Read path for documents and workflows.
    async fn read_document(&self, doc_type: &str, name: &str, project: &str) -> ResponseEnvelope {
        let status = self.supervisor.state();
        match self.cache.get_document(doc_type, name, project) {
            Ok(Some(item)) => {
                ResponseEnvelope::cache_hit(row_data(&item.row), item.age_seconds, status)
            }
            Ok(None) if status == ConnectionState::Connected => {
                let fetch = self
                    .supervisor
                    .execute(|| self.upstream.fetch_document(doc_type, name, project))
                    .await;
                match fetch {
                    Ok(Some(payload)) => {
                        if let Err(err) = self.cache.set_document(
                            &payload.doc_type,
                            &payload.name,
                            &payload.content,
                            &payload.project,
                            &payload.metadata,
                        ) {
                            return ResponseEnvelope::tool_error(
                                err.to_string(),
                                self.supervisor.state(),
                            );
                        }
                        ResponseEnvelope::live(document_data(&payload), self.supervisor.state())
                    }
                    Ok(None)
                    | Err(ExecuteError::Upstream(UpstreamError::NotFound(_))) => {
                        ResponseEnvelope::unavailable(
                            format!("document {doc_type}/{name} not found upstream"),
                            read_suggestions(doc_type),
                            self.supervisor.state(),
                        )
                    }
                    Err(err) => ResponseEnvelope::unavailable(
                        err.to_string(),
                        read_suggestions(doc_type),
                        self.supervisor.state(),
                    ),
                }
            }
            Ok(None) => ResponseEnvelope::unavailable(
                format!("upstream not connected and no cached copy of {doc_type}/{name}"),
                read_suggestions(doc_type),
                status,
            ),
            Err(err) => ResponseEnvelope::tool_error(err.to_string(), status),
        }
    }

    /// Read path for memories.
    async fn read_memory(&self, name: &str, project: &str) -> ResponseEnvelope {
        let status = self.supervisor.state();
        match self.cache.get_memory(name, project) {
            Ok(Some(item)) => {
                ResponseEnvelope::cache_hit(row_data(&item.row), item.age_seconds, status)
            }
            Ok(None) if status == ConnectionState::Connected => {
                let fetch =
                    self.supervisor.execute(|| self.upstream.fetch_memory(name, project)).await;
                match fetch {
                    Ok(Some(payload)) => {
                        if let Err(err) = self.cache.set_memory(
                            &payload.name,
                            &payload.content,
                            &payload.project,
                            &payload.metadata,
                        ) {
                            return ResponseEnvelope::tool_error(
                                err.to_string(),
                                self.supervisor.state(),
                            );
                        }
                        ResponseEnvelope::live(memory_data(&payload), self.supervisor.state())
                    }
                    Ok(None)
                    | Err(ExecuteError::Upstream(UpstreamError::NotFound(_))) => {
                        ResponseEnvelope::unavailable(
                            format!("memory {name} not found upstream"),
                            read_suggestions("memory"),
                            self.supervisor.state(),
                        )
                    }
                    Err(err) => ResponseEnvelope::unavailable(
                        err.to_string(),
                        read_suggestions("memory"),
                        self.supervisor.state(),
                    ),
                }
            }
            Ok(None) => ResponseEnvelope::unavailable(
                format!("upstream not connected and no cached copy of memory {name}"),
                read_suggestions("memory"),
                status,
            ),
            Err(err) => ResponseEnvelope::tool_error(err.to_string(), status),
        }
    }
}

// ============================================================================
// SECTION: Write Paths
// ============================================================================

impl Dispatcher {
    /// Write path for `create_document` and `update_document`.
    async fn write_document(
        &self,
        operation: QueueOperation,
        tool: &str,
        arguments: Value,
    ) -> ResponseEnvelope {
        let args = match decode::<DocumentWriteArgs>(arguments) {
            Ok(args) => args,
            Err(message) => return self.invalid_arguments(tool, &message),
        };
        if let Err(err) = self.cache.set_document(
            &args.doc_type,
            &args.name,
            &args.content,
            &args.project,
            &args.metadata,
        ) {
            return ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state());
        }
        let payload = DocumentPayload {
            doc_type: args.doc_type,
            name: args.name,
            project: args.project,
            content: args.content,
            metadata: args.metadata,
        };
        if self.supervisor.state() == ConnectionState::Connected {
            let result = self
                .supervisor
                .execute(|| async {
                    match operation {
                        QueueOperation::CreateDocument => {
                            self.upstream.create_document(&payload).await
                        }
                        _ => self.upstream.update_document(&payload).await,
                    }
                })
                .await;
            if result.is_ok() {
                return ResponseEnvelope::live(json!({ "success": true }), self.supervisor.state());
            }
        }
        self.enqueue_write(operation, &payload_value(&payload))
    }

    /// Write path for `set_memory` and `update_memory`.
    async fn write_memory(
        &self,
        operation: QueueOperation,
        tool: &str,
        arguments: Value,
    ) -> ResponseEnvelope {
        let args = match decode::<MemoryWriteArgs>(arguments) {
            Ok(args) => args,
            Err(message) => return self.invalid_arguments(tool, &message),
        };
        if let Err(err) =
            self.cache.set_memory(&args.name, &args.content, &args.project, &args.metadata)
        {
            return ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state());
        }
        let payload = MemoryPayload {
            name: args.name,
            project: args.project,
            content: args.content,
            metadata: args.metadata,
        };
        if self.supervisor.state() == ConnectionState::Connected {
            let result = self
                .supervisor
                .execute(|| async {
                    match operation {
                        QueueOperation::SetMemory => self.upstream.set_memory(&payload).await,
                        _ => self.upstream.update_memory(&payload).await,
                    }
                })
                .await;
            if result.is_ok() {
                return ResponseEnvelope::live(json!({ "success": true }), self.supervisor.state());
            }
        }
        self.enqueue_write(operation, &payload_value(&payload))
    }

    /// Write path for `delete_document`.
    async fn delete_document(&self, tool: &str, arguments: Value) -> ResponseEnvelope {
        let args = match decode::<DocumentKeyArgs>(arguments) {
            Ok(args) => args,
            Err(message) => return self.invalid_arguments(tool, &message),
        };
        if let Err(err) = self.cache.invalidate_document(&args.doc_type, &args.name, &args.project)
        {
            return ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state());
        }
        if self.supervisor.state() == ConnectionState::Connected {
            let result = self
                .supervisor
                .execute(|| {
                    self.upstream.delete_document(&args.doc_type, &args.name, &args.project)
                })
                .await;
            // A row the upstream never held is an already-applied delete.
            if matches!(
                result,
                Ok(()) | Err(ExecuteError::Upstream(UpstreamError::NotFound(_)))
            ) {
                return ResponseEnvelope::live(json!({ "success": true }), self.supervisor.state());
            }
        }
        let payload = json!({
            "doc_type": args.doc_type,
            "name": args.name,
            "project": args.project,
        });
        self.enqueue_write(QueueOperation::DeleteDocument, &payload)
    }

    /// Write path for `delete_memory`.
    async fn delete_memory(&self, tool: &str, arguments: Value) -> ResponseEnvelope {
        let args = match decode::<NameProjectArgs>(arguments) {
            Ok(args) => args,
            Err(message) => return self.invalid_arguments(tool, &message),
        };
        if let Err(err) = self.cache.invalidate_memory(&args.name, &args.project) {
            return ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state());
        }
        if self.supervisor.state() == ConnectionState::Connected {
            let result = self
                .supervisor
                .execute(|| self.upstream.delete_memory(&args.name, &args.project))
                .await;
            // A row the upstream never held is an already-applied delete.
            if matches!(
                result,
                Ok(()) | Err(ExecuteError::Upstream(UpstreamError::NotFound(_)))
            ) {
                return ResponseEnvelope::live(json!({ "success": true }), self.supervisor.state());
            }
        }
        let payload = json!({ "name": args.name, "project": args.project });
        self.enqueue_write(QueueOperation::DeleteMemory, &payload)
    }

    /// Queues a mutation and builds the queued-success envelope.
    fn enqueue_write(&self, operation: QueueOperation, payload: &Value) -> ResponseEnvelope {
        match self.queue.enqueue(operation, payload) {
            Ok(_) => ResponseEnvelope::queued(
                json!({ "success": true, "queued": true }),
                self.supervisor.state(),
                QUEUED_WARNING,
            ),
            Err(err) => ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state()),
        }
    }
}

// ============================================================================
// SECTION: Pass-Through
// ============================================================================

impl Dispatcher {
    /// Forwards an uncatalogued tool while connected, else answers OFFLINE.
    async fn pass_through(&self, name: &str, arguments: Value) -> ResponseEnvelope {
        let status = self.supervisor.state();
        if status != ConnectionState::Connected {
            return ResponseEnvelope::offline(
                format!("tool {name} requires a live upstream connection"),
                status,
            );
        }
        let result =
            self.supervisor.execute(|| self.upstream.invoke_tool(name, arguments)).await;
        match result {
            Ok(value) => ResponseEnvelope::live(value, self.supervisor.state()),
            Err(ExecuteError::NotConnected(state)) => ResponseEnvelope::offline(
                format!("tool {name} requires a live upstream connection"),
                state,
            ),
            Err(ExecuteError::Upstream(err)) => {
                ResponseEnvelope::tool_error(err.to_string(), self.supervisor.state())
            }
        }
    }
}

// ============================================================================
// SECTION: Connected Hooks
// ============================================================================

/// Sink that fires replay and preload on the Connected transition.
struct ConnectedTasksSink {
    /// Weak back-reference; the supervisor never owns the dispatcher.
    dispatcher: Weak<Dispatcher>,
}

impl ConnectionEventSink for ConnectedTasksSink {
    fn on_event(&self, event: &ConnectionEvent) {
        let is_connected_transition = matches!(
            event,
            ConnectionEvent::StateChange {
                to: ConnectionState::Connected,
                ..
            }
        );
        if !is_connected_transition {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            let queue = Arc::clone(&dispatcher.queue);
            tokio::spawn(async move {
                if let Err(err) = queue.replay().await {
                    emit_runtime_event("replay_error", &err.to_string());
                }
            });
            tokio::spawn(async move {
                dispatcher.preload_critical().await;
            });
        }
    }
}

impl Dispatcher {
    /// Preload sweep: fetch the configured critical lists and cache them.
    /// Failures are logged and never fatal.
    async fn preload_critical(&self) {
        for kind in &self.preload {
            let Some(doc_type) = preload_doc_type(kind) else {
                emit_runtime_event("preload_skipped", &format!("unknown preload kind: {kind}"));
                continue;
            };
            let listed =
                self.supervisor.execute(|| self.upstream.list_documents(doc_type)).await;
            match listed {
                Ok(documents) => {
                    for document in documents {
                        if let Err(err) = self.cache.set_document(
                            &document.doc_type,
                            &document.name,
                            &document.content,
                            &document.project,
                            &document.metadata,
                        ) {
                            emit_runtime_event("preload_store_error", &err.to_string());
                        }
                    }
                }
                Err(err) => {
                    emit_runtime_event(
                        "preload_fetch_error",
                        &format!("{doc_type}: {err}"),
                    );
                }
            }
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Decodes tool arguments into their expected shape.
fn decode<T: DeserializeOwned>(arguments: Value) -> Result<T, String> {
    serde_json::from_value(arguments).map_err(|err| err.to_string())
}

/// Suggestions attached to UNAVAILABLE read envelopes.
fn read_suggestions(doc_type: &str) -> Vec<String> {
    let mut suggestions =
        vec!["check connection".to_string(), "wait for reconnection".to_string()];
    if doc_type == "workflow" {
        suggestions.push("fall back to a previously exported workflow copy".to_string());
    }
    suggestions
}

/// Builds the data payload for a cached row.
fn row_data(row: &CacheRow) -> Value {
    match row.kind {
        RowKind::Document => json!({
            "doc_type": row.doc_type,
            "name": row.name,
            "project": row.project,
            "content": row.content,
            "metadata": row.metadata,
        }),
        RowKind::Memory => json!({
            "name": row.name,
            "project": row.project,
            "content": row.content,
            "metadata": row.metadata,
        }),
    }
}

/// Builds the data payload for a live document fetch.
fn document_data(payload: &DocumentPayload) -> Value {
    json!({
        "doc_type": payload.doc_type,
        "name": payload.name,
        "project": payload.project,
        "content": payload.content,
        "metadata": payload.metadata,
    })
}

/// Builds the data payload for a live memory fetch.
fn memory_data(payload: &MemoryPayload) -> Value {
    json!({
        "name": payload.name,
        "project": payload.project,
        "content": payload.content,
        "metadata": payload.metadata,
    })
}

/// Serializes a payload for queue storage.
fn payload_value<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
