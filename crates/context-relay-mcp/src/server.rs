// crates/context-relay-mcp/src/server.rs
// ============================================================================
// Module: Front-Side MCP Server
// Description: JSON-RPC 2.0 server over stdio and HTTP transports.
// Purpose: Expose the dispatcher to the end-user client; every tool result
//          is one text content block carrying the serialized envelope.
// Dependencies: context-relay-core, axum, serde, tokio
// ============================================================================

//! ## Overview
//! The front side is request/response per invocation: `initialize`, `ping`,
//! `tools/list`, and `tools/call`. The stdio transport reads Content-Length
//! framed requests in a blocking loop on the tokio blocking pool; the HTTP
//! transport serves POST /rpc through axum. Responses are emitted in request
//! order. Notifications (requests without an id) receive no response.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use context_relay_core::ToolDefinition;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::dispatcher::Dispatcher;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Front-side server failures.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Server configuration is invalid.
    #[error("serve config error: {0}")]
    Config(String),
    /// Transport failure.
    #[error("serve transport error: {0}")]
    Transport(String),
}

// ============================================================================
// SECTION: JSON-RPC Structures
// ============================================================================

/// Incoming JSON-RPC request payload.
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    /// JSON-RPC protocol version.
    jsonrpc: String,
    /// Request identifier; absent for notifications.
    #[serde(default)]
    id: Option<Value>,
    /// Method name.
    method: String,
    /// Optional parameters payload.
    #[serde(default)]
    params: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    /// JSON-RPC protocol version.
    jsonrpc: &'static str,
    /// Request identifier.
    id: Value,
    /// Successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    /// Error payload when the request fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcErrorBody>,
}

/// JSON-RPC error payload.
#[derive(Debug, Serialize)]
struct JsonRpcErrorBody {
    /// Error code.
    code: i64,
    /// Human-readable error message.
    message: String,
}

/// Tool call parameters for `tools/call`.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    /// Tool name.
    name: String,
    /// Raw JSON arguments.
    #[serde(default)]
    arguments: Value,
}

/// Tool list response payload.
#[derive(Debug, Serialize)]
struct ToolListResult {
    /// Catalog tool definitions.
    tools: Vec<ToolDefinition>,
}

// ============================================================================
// SECTION: Request Handling
// ============================================================================

/// Dispatches one JSON-RPC request; notifications return no response.
async fn handle_request(
    dispatcher: &Arc<Dispatcher>,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if request.jsonrpc != "2.0" {
        return Some(error_response(
            request.id.unwrap_or(Value::Null),
            -32600,
            "invalid json-rpc version",
        ));
    }
    let Some(id) = request.id else {
        // Notification (e.g. notifications/initialized): nothing to answer.
        return None;
    };
    match request.method.as_str() {
        "initialize" => Some(success_response(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "context-relay",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )),
        "ping" => Some(success_response(id, json!({}))),
        "tools/list" => {
            let result = ToolListResult {
                tools: dispatcher.list_tools(),
            };
            match serde_json::to_value(result) {
                Ok(value) => Some(success_response(id, value)),
                Err(_) => Some(error_response(id, -32603, "serialization failed")),
            }
        }
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let Ok(call) = serde_json::from_value::<ToolCallParams>(params) else {
                return Some(error_response(id, -32602, "invalid tool params"));
            };
            let envelope = dispatcher.handle_tool_call(&call.name, call.arguments).await;
            match serde_json::to_string(&envelope) {
                Ok(text) => Some(success_response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                    }),
                )),
                Err(_) => Some(error_response(id, -32603, "serialization failed")),
            }
        }
        _ => Some(error_response(id, -32601, "method not found")),
    }
}

/// Builds a success response.
fn success_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

/// Builds an error response.
fn error_response(id: Value, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcErrorBody {
            code,
            message: message.to_string(),
        }),
    }
}

// ============================================================================
// SECTION: Stdio Transport
// ============================================================================

/// Serves framed JSON-RPC requests over the relay's stdio until the client
/// closes the stream.
///
/// # Errors
///
/// Returns [`ServeError`] when framing or I/O fails.
pub async fn serve_stdio(
    dispatcher: Arc<Dispatcher>,
    max_body_bytes: usize,
) -> Result<(), ServeError> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || stdio_loop(&dispatcher, &handle, max_body_bytes))
        .await
        .map_err(|err| ServeError::Transport(format!("stdio task join failed: {err}")))?
}

/// Blocking request loop over stdin/stdout.
fn stdio_loop(
    dispatcher: &Arc<Dispatcher>,
    handle: &tokio::runtime::Handle,
    max_body_bytes: usize,
) -> Result<(), ServeError> {
    let mut reader = BufReader::new(std::io::stdin());
    let mut writer = std::io::stdout();
    loop {
        let Some(bytes) = read_framed(&mut reader, max_body_bytes)? else {
            // Client closed the stream; clean shutdown.
            return Ok(());
        };
        let response = match serde_json::from_slice::<JsonRpcRequest>(&bytes) {
            Ok(request) => handle.block_on(handle_request(dispatcher, request)),
            Err(_) => Some(error_response(Value::Null, -32700, "parse error")),
        };
        if let Some(response) = response {
            let payload = serde_json::to_vec(&response).map_err(|_| {
                ServeError::Transport("json-rpc serialization failed".to_string())
            })?;
            write_framed(&mut writer, &payload)?;
        }
    }
}

/// Reads one framed request; `None` signals a clean end of stream.
fn read_framed(
    reader: &mut BufReader<impl Read>,
    limit: usize,
) -> Result<Option<Vec<u8>>, ServeError> {
    let mut content_length: Option<u64> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader
            .read_line(&mut line)
            .map_err(|err| ServeError::Transport(format!("stdio read failed: {err}")))?;
        if bytes == 0 {
            if content_length.is_some() {
                return Err(ServeError::Transport("stdio closed mid-frame".to_string()));
            }
            return Ok(None);
        }
        if line.trim().is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ServeError::Transport("invalid content length".to_string()))?;
            content_length = Some(parsed);
        }
    }
    let len = content_length
        .ok_or_else(|| ServeError::Transport("missing content length".to_string()))?;
    if len > u64::try_from(limit).unwrap_or(u64::MAX) {
        return Err(ServeError::Transport(format!(
            "request exceeds size limit ({limit} bytes)"
        )));
    }
    let len = usize::try_from(len)
        .map_err(|_| ServeError::Transport("content length exceeds addressable size".to_string()))?;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|err| ServeError::Transport(format!("stdio read failed: {err}")))?;
    Ok(Some(buf))
}

/// Writes one framed response.
fn write_framed(writer: &mut impl Write, payload: &[u8]) -> Result<(), ServeError> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer
        .write_all(header.as_bytes())
        .map_err(|err| ServeError::Transport(format!("stdio write failed: {err}")))?;
    writer
        .write_all(payload)
        .map_err(|err| ServeError::Transport(format!("stdio write failed: {err}")))?;
    writer
        .flush()
        .map_err(|err| ServeError::Transport(format!("stdio write failed: {err}")))?;
    Ok(())
}

// ============================================================================
// SECTION: HTTP Transport
// ============================================================================

/// Shared state for HTTP handlers.
#[derive(Clone)]
struct HttpState {
    /// Request dispatcher.
    dispatcher: Arc<Dispatcher>,
    /// Maximum allowed request body size.
    max_body_bytes: usize,
}

/// Serves JSON-RPC requests over HTTP POST /rpc.
///
/// # Errors
///
/// Returns [`ServeError`] when the bind address is invalid or the server
/// fails.
pub async fn serve_http(
    dispatcher: Arc<Dispatcher>,
    bind: &str,
    max_body_bytes: usize,
) -> Result<(), ServeError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServeError::Config(format!("invalid bind address: {bind}")))?;
    let state = Arc::new(HttpState {
        dispatcher,
        max_body_bytes,
    });
    let app = Router::new().route("/rpc", post(handle_http)).with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| ServeError::Transport(format!("http bind failed: {err}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|err| ServeError::Transport(format!("http server failed: {err}")))
}

/// Handles one HTTP JSON-RPC request.
async fn handle_http(State(state): State<Arc<HttpState>>, bytes: Bytes) -> impl IntoResponse {
    if bytes.len() > state.max_body_bytes {
        let response = error_response(Value::Null, -32600, "request body too large");
        return (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(to_value(&response)));
    }
    match serde_json::from_slice::<JsonRpcRequest>(&bytes) {
        Ok(request) => match handle_request(&state.dispatcher, request).await {
            Some(response) => (StatusCode::OK, axum::Json(to_value(&response))),
            None => (StatusCode::OK, axum::Json(Value::Null)),
        },
        Err(_) => {
            let response = error_response(Value::Null, -32700, "parse error");
            (StatusCode::BAD_REQUEST, axum::Json(to_value(&response)))
        }
    }
}

/// Serializes a response, falling back to a minimal error value.
fn to_value(response: &JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": -32603, "message": "serialization failed" },
        })
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================
