// crates/context-relay-upstream/src/http.rs
// ============================================================================
// Module: HTTP Upstream Transport
// Description: Plain and SSE-framed HTTP implementations of UpstreamClient.
// Purpose: Speak the upstream's /mcp/document, /mcp/memory, /mcp/tool, and
//          /health surface with bearer auth and response-size limits.
// Dependencies: context-relay-core, context-relay-config, reqwest, serde_json
// ============================================================================

//! ## Overview
//! Document and memory operations post a JSON body whose `action` field
//! selects the operation; pass-through calls post `{name, arguments}` to
//! `/mcp/tool`. A 404 maps to [`UpstreamError::NotFound`]; fetches translate
//! it into a miss, while mutations and pass-through calls surface it for
//! programmatic handling. In the SSE-framed mode the response body arrives
//! as an event stream and the first `data:` payload carries the JSON. Bodies
//! are read with a hard byte limit while streaming.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use context_relay_config::UpstreamConfig;
use context_relay_core::DocumentPayload;
use context_relay_core::MemoryPayload;
use context_relay_core::UpstreamClient;
use context_relay_core::UpstreamError;
use reqwest::Client;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use reqwest::header::AUTHORIZATION;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::redirect::Policy;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Document operations endpoint.
const DOCUMENT_PATH: &str = "/mcp/document";
/// Memory operations endpoint.
const MEMORY_PATH: &str = "/mcp/memory";
/// Pass-through tool endpoint.
const TOOL_PATH: &str = "/mcp/tool";
/// Liveness probe endpoint.
const HEALTH_PATH: &str = "/health";

// ============================================================================
// SECTION: Client
// ============================================================================

/// HTTP implementation of the upstream contract.
pub struct HttpUpstreamClient {
    /// Reqwest client with timeouts and no redirects.
    client: Client,
    /// Base URL without a trailing slash.
    base_url: String,
    /// Optional bearer token.
    api_key: Option<String>,
    /// Whether response bodies are SSE-framed.
    sse_framed: bool,
    /// Hard limit on response bodies in bytes.
    max_response_bytes: usize,
}

impl HttpUpstreamClient {
    /// Builds an HTTP upstream client.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Config`] when the URL is missing or the
    /// client cannot be constructed.
    pub fn new(config: &UpstreamConfig, sse_framed: bool) -> Result<Self, UpstreamError> {
        let base_url = config
            .url
            .as_ref()
            .ok_or_else(|| UpstreamError::Config("upstream url is required".to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .redirect(Policy::none())
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sse_framed,
            max_response_bytes: config.max_response_bytes,
        })
    }

    /// Builds request headers for the transport.
    fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.sse_framed {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        if let Some(token) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| UpstreamError::Config("invalid bearer token header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Posts a JSON body and returns the status plus the raw body.
    async fn post(&self, path: &str, body: &Value) -> Result<(StatusCode, Vec<u8>), UpstreamError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let status = response.status();
        let body = read_body_with_limit(response, self.max_response_bytes).await?;
        Ok((status, body))
    }

    /// Posts an operation and parses the JSON payload on success.
    ///
    /// A 404 becomes the typed [`UpstreamError::NotFound`]; fetch operations
    /// translate it into a miss at their call sites.
    async fn post_operation(&self, path: &str, body: &Value) -> Result<Value, UpstreamError> {
        let (status, bytes) = self.post(path, body).await?;
        if status == StatusCode::NOT_FOUND {
            let detail = body_preview(&bytes);
            return Err(UpstreamError::NotFound(if detail.is_empty() {
                path.to_string()
            } else {
                format!("{path}: {detail}")
            }));
        }
        if !status.is_success() {
            return Err(UpstreamError::Tool(format!(
                "http status {}: {}",
                status.as_u16(),
                body_preview(&bytes)
            )));
        }
        self.decode_body(&bytes)
    }

    /// Decodes a response body, unwrapping the SSE framing when enabled.
    fn decode_body(&self, bytes: &[u8]) -> Result<Value, UpstreamError> {
        let json_bytes = if self.sse_framed { parse_sse_body(bytes)? } else { bytes.to_vec() };
        if json_bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&json_bytes)
            .map_err(|err| UpstreamError::Protocol(format!("invalid response body: {err}")))
    }
}

// ============================================================================
// SECTION: UpstreamClient Implementation
// ============================================================================

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn fetch_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<Option<DocumentPayload>, UpstreamError> {
        let body = json!({
            "action": "get",
            "doc_type": doc_type,
            "name": name,
            "project": project,
        });
        match self.post_operation(DOCUMENT_PATH, &body).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| UpstreamError::Protocol(format!("invalid document payload: {err}"))),
            Err(UpstreamError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_documents(&self, doc_type: &str) -> Result<Vec<DocumentPayload>, UpstreamError> {
        let body = json!({ "action": "list", "doc_type": doc_type });
        match self.post_operation(DOCUMENT_PATH, &body).await? {
            Value::Null => Ok(Vec::new()),
            value => serde_json::from_value(value)
                .map_err(|err| UpstreamError::Protocol(format!("invalid document list: {err}"))),
        }
    }

    async fn create_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        let body = action_body("create", document)?;
        self.post_operation(DOCUMENT_PATH, &body).await?;
        Ok(())
    }

    async fn update_document(&self, document: &DocumentPayload) -> Result<(), UpstreamError> {
        let body = action_body("update", document)?;
        self.post_operation(DOCUMENT_PATH, &body).await?;
        Ok(())
    }

    async fn delete_document(
        &self,
        doc_type: &str,
        name: &str,
        project: &str,
    ) -> Result<(), UpstreamError> {
        let body = json!({
            "action": "delete",
            "doc_type": doc_type,
            "name": name,
            "project": project,
        });
        self.post_operation(DOCUMENT_PATH, &body).await?;
        Ok(())
    }

    async fn fetch_memory(
        &self,
        name: &str,
        project: &str,
    ) -> Result<Option<MemoryPayload>, UpstreamError> {
        let body = json!({ "action": "get", "name": name, "project": project });
        match self.post_operation(MEMORY_PATH, &body).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| UpstreamError::Protocol(format!("invalid memory payload: {err}"))),
            Err(UpstreamError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        let body = action_body("set", memory)?;
        self.post_operation(MEMORY_PATH, &body).await?;
        Ok(())
    }

    async fn update_memory(&self, memory: &MemoryPayload) -> Result<(), UpstreamError> {
        let body = action_body("update", memory)?;
        self.post_operation(MEMORY_PATH, &body).await?;
        Ok(())
    }

    async fn delete_memory(&self, name: &str, project: &str) -> Result<(), UpstreamError> {
        let body = json!({ "action": "delete", "name": name, "project": project });
        self.post_operation(MEMORY_PATH, &body).await?;
        Ok(())
    }

    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let body = json!({ "name": name, "arguments": arguments });
        self.post_operation(TOOL_PATH, &body).await
    }

    async fn health_check(&self) -> Result<(), UpstreamError> {
        let mut request = self.client.get(format!("{}{HEALTH_PATH}", self.base_url));
        if let Some(token) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| UpstreamError::Config("invalid bearer token header".to_string()))?;
            request = request.header(AUTHORIZATION, value);
        }
        let response =
            request.send().await.map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!(
                "health status {}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Serializes a payload and tags it with the operation action.
fn action_body<T: serde::Serialize>(action: &str, payload: &T) -> Result<Value, UpstreamError> {
    let mut body = serde_json::to_value(payload)
        .map_err(|err| UpstreamError::Protocol(format!("payload serialization: {err}")))?;
    if let Some(map) = body.as_object_mut() {
        map.insert("action".to_string(), Value::String(action.to_string()));
    }
    Ok(body)
}

/// Reads a response body while enforcing a hard byte limit.
async fn read_body_with_limit(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, UpstreamError> {
    let mut body = Vec::new();
    while let Some(chunk) =
        response.chunk().await.map_err(|err| UpstreamError::Transport(err.to_string()))?
    {
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(UpstreamError::Protocol(format!(
                "response exceeds size limit ({limit} bytes)"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Parses an SSE response body and extracts the first `data:` payload.
pub fn parse_sse_body(body: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| UpstreamError::Protocol("sse response was not valid utf-8".to_string()))?;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            if !data_lines.is_empty() {
                break;
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
    }
    if data_lines.is_empty() {
        return Err(UpstreamError::Protocol("sse response missing data".to_string()));
    }
    Ok(data_lines.join("\n").into_bytes())
}

/// Returns a short lossy preview of an error body for messages.
fn body_preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let preview: String = trimmed.chars().take(200).collect();
        format!("{preview}...")
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sse_body_first_event() {
        let body = b"event: message\ndata: {\"ok\":true}\n\nevent: message\ndata: {}\n\n";
        let payload = parse_sse_body(body).expect("payload");
        assert_eq!(payload, b"{\"ok\":true}");
    }

    #[test]
    fn joins_continued_data_lines() {
        let body = b"data: {\"a\":\ndata: 1}\n\n";
        let payload = parse_sse_body(body).expect("payload");
        assert_eq!(payload, b"{\"a\":\n1}");
    }

    #[test]
    fn rejects_sse_body_without_data() {
        assert!(parse_sse_body(b": comment only\n\n").is_err());
    }

    #[test]
    fn action_body_tags_serialized_payload() {
        let payload = DocumentPayload {
            doc_type: "rule".to_string(),
            name: "style".to_string(),
            project: String::new(),
            content: "x".to_string(),
            metadata: json!({}),
        };
        let body = action_body("create", &payload).expect("body");
        assert_eq!(body["action"], "create");
        assert_eq!(body["doc_type"], "rule");
        assert_eq!(body["name"], "style");
    }
}
