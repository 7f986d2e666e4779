// crates/context-relay-upstream/src/stdio.rs
// ============================================================================
// Module: Child-Process Upstream Transport
// Description: Framed JSON-RPC client over a spawned child's stdio.
// Purpose: Drive a local upstream server process with Content-Length framed
//          JSON-RPC 2.0, mapping relay operations onto its tools.
// Dependencies: context-relay-core, context-relay-config, serde_json, tokio
// ============================================================================

//! ## Overview
//! The child process is spawned once and killed on drop. Each request holds
//! the stream pair for its full exchange, so request/response pairs never
//! interleave; the blocking I/O runs on the tokio blocking pool. Relay
//! operations map onto `tools/call` with the upstream's tool names, and the
//! liveness probe is the JSON-RPC `ping` method.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use context_relay_config::UpstreamConfig;
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: JSON-RPC Structures
// ============================================================================

/// JSON-RPC request envelope.
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    /// JSON-RPC version tag.
    jsonrpc: &'static str,
    /// Request identifier.
    id: u64,
    /// Method name to invoke.
    method: &'a str,
    /// Optional parameters payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    /// Optional result payload.
    result: Option<Value>,
    /// Optional error payload.
    error: Option<JsonRpcError>,
}

/// JSON-RPC error payload.
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    /// Error message provided by the server.
    message: String,
}

/// `tools/call` result payload.
#[derive(Debug, Deserialize)]
struct ToolCallResult {
    /// Tool response content entries.
    content: Vec<ToolContent>,
}

/// Tool response content variants accepted from the child.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolContent {
    /// JSON payload.
    Json {
        /// JSON response body.
        json: Value,
    },
    /// Textual payload carrying serialized JSON.
    Text {
        /// Response text.
        text: String,
    },
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// Child-process implementation of the upstream contract.
pub struct ChildProcessUpstreamClient {
    /// Spawned child process handle, killed on drop.
    child: Mutex<Child>,
    /// Stream pair held for the duration of each exchange.
    streams: Arc<Mutex<(ChildStdin, BufReader<ChildStdout>)>>,
    /// Next JSON-RPC request identifier.
    next_id: AtomicU64,
    /// Hard limit on framed response bodies in bytes.
    max_response_bytes: usize,
}

impl ChildProcessUpstreamClient {
    /// Spawns the configured upstream command.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the command is missing, the process
    /// cannot be spawned, or its streams are unavailable.
    pub fn spawn(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let command = config
            .command
            .as_ref()
            .ok_or_else(|| UpstreamError::Config("upstream command is required".to_string()))?;
        let mut child = Command::new(command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| UpstreamError::Transport(format!("spawn upstream failed: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::Transport("missing child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Transport("missing child stdout".to_string()))?;
        Ok(Self {
            child: Mutex::new(child),
            streams: Arc::new(Mutex::new((stdin, BufReader::new(stdout)))),
            next_id: AtomicU64::new(1),
            max_response_bytes: config.max_response_bytes,
        })
    }

    /// Sends a JSON-RPC request and reads its response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|err| UpstreamError::Protocol(format!("request serialization: {err}")))?;
        let streams = Arc::clone(&self.streams);
        let limit = self.max_response_bytes;
        let response_bytes = tokio::task::spawn_blocking(move || {
            let mut guard = streams
                .lock()
                .map_err(|_| UpstreamError::Transport("stdio lock poisoned".to_string()))?;
            let (stdin, stdout) = &mut *guard;
            write_framed(stdin, &payload)?;
            read_framed(stdout, limit)
        })
        .await
        .map_err(|err| UpstreamError::Transport(format!("stdio request join failed: {err}")))??;
        let response: JsonRpcResponse = serde_json::from_slice(&response_bytes)
            .map_err(|err| UpstreamError::Protocol(format!("invalid json-rpc response: {err}")))?;
        if let Some(error) = &response.error {
            return Err(UpstreamError::Tool(error.message.clone()));
        }
        Ok(response)
    }

    /// Calls an upstream tool and extracts its JSON payload.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request("tools/call", Some(params)).await?;
        let result = response
            .result
            .ok_or_else(|| UpstreamError::Protocol(format!("missing result for tool {name}")))?;
        let parsed: ToolCallResult = serde_json::from_value(result).map_err(|err| {
            UpstreamError::Protocol(format!("invalid tools/call payload for {name}: {err}"))
        })?;
        let Some(content) = parsed.content.into_iter().next() else {
            return Ok(Value::Null);
        };
        match content {
            ToolContent::Json { json } => Ok(json),
            ToolContent::Text { text } => serde_json::from_str(&text).map_err(|err| {
                UpstreamError::Protocol(format!("tool {name} returned non-json text: {err}"))
            }),
        }
    }
}

impl Drop for ChildProcessUpstreamClient {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }
}

// ============================================================================
// SECTION: UpstreamClient Implementation
// ============================================================================

#[async_trait]
impl UpstreamClient for ChildProcessUpstreamClient {
    async fn fetch_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<Option<DocumentPayload>, UpstreamError> {
        let arguments = json!({ "doc_type": doc_type, "name": name, "project": project });
        match self.call_tool("get_document", arguments).await? {
            Value::Null => Ok(None),
            value => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| UpstreamError::Protocol(format!("invalid document payload: {err}"))),
        }
    }

    async fn list_documents(&self, doc_type: &str) -> Result<Vec<DocumentPayload>, UpstreamError> {
        match self.call_tool("list_documents", json!({ "doc_type": doc_type })).await? {
            Value::Null => Ok(Vec::new()),
            value => serde_json::from_value(value)
                .map_err(|err| UpstreamError::Protocol(format!("invalid document list: {err}"))),
        }
    }

    async fn create_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        self.call_tool("create_document", to_arguments(document)?).await?;
        Ok(())
    }

    async fn update_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        self.call_tool("update_document", to_arguments(document)?).await?;
        Ok(())
    }

    async fn delete_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<(), UpstreamError> {
        let arguments = json!({ "doc_type": doc_type, "name": name, "project": project });
        self.call_tool("delete_document", arguments).await?;
        Ok(())
    }

    async fn fetch_memory(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<MemoryPayload>, UpstreamError> {
        let arguments = json!({ "name": name, "project": project });
        match self.call_tool("get_memory", arguments).await? {
            Value::Null => Ok(None),
            value => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| UpstreamError::Protocol(format!("invalid memory payload: {err}"))),
        }
    }

    async fn set_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        self.call_tool("set_memory", to_arguments(memory)?).await?;
        Ok(())
    }

    async fn update_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        self.call_tool("update_memory", to_arguments(memory)?).await?;
        Ok(())
    }

    async fn delete_memory(&self, name: &str, project: &str) -> Result<(), UpstreamError> {
        self.call_tool("delete_memory", json!({ "name": name, "project": project })).await?;
        Ok(())
    }

    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        self.call_tool(name, arguments).await
    }

    async fn health_check(&self) -> Result<(), UpstreamError> {
        self.request("ping", None).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Framing
// ============================================================================

/// Serializes a payload into tool-call arguments.
fn to_arguments<T: Serialize>(payload: &T) -> Result<Value, UpstreamError> {
    serde_json::to_value(payload)
        .map_err(|err| UpstreamError::Protocol(format!("payload serialization: {err}")))
}

/// Reads a Content-Length framed message.
///
/// # Errors
///
/// Returns [`UpstreamError`] when framing headers are invalid, the content
/// length exceeds the limit, or I/O fails.
pub fn read_framed(
    reader: &mut BufReader<impl Read>,
    limit: usize,
) -> Result<Vec<u8>, UpstreamError> {
    let mut content_length: Option<u64> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader
            .read_line(&mut line)
            .map_err(|err| UpstreamError::Transport(format!("stdio read failed: {err}")))?;
        if bytes == 0 {
            return Err(UpstreamError::Transport("stdio closed".to_string()));
        }
        if line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| UpstreamError::Protocol("invalid content length".to_string()))?;
            content_length = Some(parsed);
        }
    }
    let len = content_length
        .ok_or_else(|| UpstreamError::Protocol("missing content length".to_string()))?;
    if len > u64::try_from(limit).unwrap_or(u64::MAX) {
        return Err(UpstreamError::Protocol(format!(
            "framed response exceeds size limit ({limit} bytes)"
        )));
    }
    let len = usize::try_from(len)
        .map_err(|_| UpstreamError::Protocol("content length exceeds addressable size".to_string()))?;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|err| UpstreamError::Transport(format!("stdio read failed: {err}")))?;
    Ok(buf)
}

/// Writes a Content-Length framed message.
///
/// # Errors
///
/// Returns [`UpstreamError`] when writes fail.
pub fn write_framed(writer: &mut impl Write, payload: &[u8]) -> Result<(), UpstreamError> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer
        .write_all(header.as_bytes())
        .map_err(|err| UpstreamError::Transport(format!("stdio write failed: {err}")))?;
    writer
        .write_all(payload)
        .map_err(|err| UpstreamError::Transport(format!("stdio write failed: {err}")))?;
    writer
        .flush()
        .map_err(|err| UpstreamError::Transport(format!("stdio write failed: {err}")))?;
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
