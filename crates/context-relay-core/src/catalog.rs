// crates/context-relay-core/src/catalog.rs
// ============================================================================
// Module: Static Tool Catalog
// Description: Compile-time tool descriptors and routing partition.
// Purpose: Keep the callable tool surface stable regardless of connection
//          state; route each tool through cache, queue, or pass-through.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The catalog is a compile-time enumeration served verbatim on every
//! list-tools request. Earlier designs queried the upstream for its tool
//! list; that shrank the catalog mid-session whenever the upstream dropped,
//! so the surface is now static and per-tool routing is a tagged dispatch:
//! cacheable reads are answered locally, durable writes are applied locally
//! and synced, and everything else passes through when connected.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Tool Names
// ============================================================================

/// Tools with dedicated local handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// Fetch a workflow document by name.
    GetWorkflow,
    /// Fetch a document by type and name.
    GetDocument,
    /// Fetch a memory by name.
    GetMemory,
    /// Create a document.
    CreateDocument,
    /// Update a document.
    UpdateDocument,
    /// Set a memory.
    SetMemory,
    /// Update a memory.
    UpdateMemory,
    /// Delete a document.
    DeleteDocument,
    /// Delete a memory.
    DeleteMemory,
}

impl ToolName {
    /// Returns the stable wire name of the tool.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetWorkflow => "get_workflow",
            Self::GetDocument => "get_document",
            Self::GetMemory => "get_memory",
            Self::CreateDocument => "create_document",
            Self::UpdateDocument => "update_document",
            Self::SetMemory => "set_memory",
            Self::UpdateMemory => "update_memory",
            Self::DeleteDocument => "delete_document",
            Self::DeleteMemory => "delete_memory",
        }
    }

    /// Parses a tool name from its wire form.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "get_workflow" => Some(Self::GetWorkflow),
            "get_document" => Some(Self::GetDocument),
            "get_memory" => Some(Self::GetMemory),
            "create_document" => Some(Self::CreateDocument),
            "update_document" => Some(Self::UpdateDocument),
            "set_memory" => Some(Self::SetMemory),
            "update_memory" => Some(Self::UpdateMemory),
            "delete_document" => Some(Self::DeleteDocument),
            "delete_memory" => Some(Self::DeleteMemory),
            _ => None,
        }
    }

    /// Returns the routing class for this tool.
    #[must_use]
    pub const fn route(self) -> ToolRoute {
        match self {
            Self::GetWorkflow | Self::GetDocument | Self::GetMemory => ToolRoute::CacheableRead,
            Self::CreateDocument
            | Self::UpdateDocument
            | Self::SetMemory
            | Self::UpdateMemory
            | Self::DeleteDocument
            | Self::DeleteMemory => ToolRoute::DurableWrite,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing classes for dispatched tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRoute {
    /// Served from the local cache, falling back to a live fetch.
    CacheableRead,
    /// Applied locally, then synced live or queued for replay.
    DurableWrite,
    /// Forwarded to the upstream; requires the Connected state.
    PassThrough,
}

/// Returns the routing class for an arbitrary wire tool name.
///
/// Tools outside the catalog's read and write sets are pass-through.
#[must_use]
pub fn route_for(name: &str) -> ToolRoute {
    ToolName::parse(name).map_or(ToolRoute::PassThrough, ToolName::route)
}

// ============================================================================
// SECTION: Tool Definitions
// ============================================================================

/// Tool descriptor served on list-tools requests.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Wire tool name.
    pub name: &'static str,
    /// One-line tool description.
    pub description: &'static str,
    /// JSON schema for the tool arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Returns the canonical tool catalog.
///
/// The order is intentional and stable across releases; append new tools at
/// the end. The same list is returned in every connection state.
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        get_workflow_definition(),
        get_document_definition(),
        get_memory_definition(),
        create_document_definition(),
        update_document_definition(),
        set_memory_definition(),
        update_memory_definition(),
        delete_document_definition(),
        delete_memory_definition(),
        search_codebase_definition(),
        list_documents_definition(),
    ]
}

/// Builds the descriptor for `get_workflow`.
fn get_workflow_definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_workflow",
        description: "Fetch a workflow document; served from the local cache while offline.",
        input_schema: name_project_schema(),
    }
}

/// Builds the descriptor for `get_document`.
fn get_document_definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_document",
        description: "Fetch a document by type and name; served from the local cache while \
                      offline.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "doc_type": { "type": "string" },
                "name": { "type": "string" },
                "project": { "type": "string" }
            },
            "required": ["doc_type", "name"]
        }),
    }
}

/// Builds the descriptor for `get_memory`.
fn get_memory_definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_memory",
        description: "Fetch a memory by name; served from the local cache while offline.",
        input_schema: name_project_schema(),
    }
}

/// Builds the descriptor for `create_document`.
fn create_document_definition() -> ToolDefinition {
    ToolDefinition {
        name: "create_document",
        description: "Create a document; queued for sync when the upstream is unreachable.",
        input_schema: document_write_schema(),
    }
}

/// Builds the descriptor for `update_document`.
fn update_document_definition() -> ToolDefinition {
    ToolDefinition {
        name: "update_document",
        description: "Update a document; queued for sync when the upstream is unreachable.",
        input_schema: document_write_schema(),
    }
}

/// Builds the descriptor for `set_memory`.
fn set_memory_definition() -> ToolDefinition {
    ToolDefinition {
        name: "set_memory",
        description: "Set a memory; queued for sync when the upstream is unreachable.",
        input_schema: memory_write_schema(),
    }
}

/// Builds the descriptor for `update_memory`.
fn update_memory_definition() -> ToolDefinition {
    ToolDefinition {
        name: "update_memory",
        description: "Update a memory; queued for sync when the upstream is unreachable.",
        input_schema: memory_write_schema(),
    }
}

/// Builds the descriptor for `delete_document`.
fn delete_document_definition() -> ToolDefinition {
    ToolDefinition {
        name: "delete_document",
        description: "Delete a document; queued for sync when the upstream is unreachable.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "doc_type": { "type": "string" },
                "name": { "type": "string" },
                "project": { "type": "string" }
            },
            "required": ["doc_type", "name"]
        }),
    }
}

/// Builds the descriptor for `delete_memory`.
fn delete_memory_definition() -> ToolDefinition {
    ToolDefinition {
        name: "delete_memory",
        description: "Delete a memory; queued for sync when the upstream is unreachable.",
        input_schema: name_project_schema(),
    }
}

/// Builds the descriptor for the pass-through `search_codebase` tool.
fn search_codebase_definition() -> ToolDefinition {
    ToolDefinition {
        name: "search_codebase",
        description: "Search the upstream code index; requires a live connection.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["query"]
        }),
    }
}

/// Builds the descriptor for the pass-through `list_documents` tool.
fn list_documents_definition() -> ToolDefinition {
    ToolDefinition {
        name: "list_documents",
        description: "List upstream documents of a type; requires a live connection.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "doc_type": { "type": "string" }
            },
            "required": ["doc_type"]
        }),
    }
}

/// Shared argument schema for name + optional project tools.
fn name_project_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "project": { "type": "string" }
        },
        "required": ["name"]
    })
}

/// Shared argument schema for document write tools.
fn document_write_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "doc_type": { "type": "string" },
            "name": { "type": "string" },
            "content": { "type": "string" },
            "project": { "type": "string" },
            "metadata": { "type": "object" }
        },
        "required": ["doc_type", "name", "content"]
    })
}

/// Shared argument schema for memory write tools.
fn memory_write_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "content": { "type": "string" },
            "project": { "type": "string" },
            "metadata": { "type": "object" }
        },
        "required": ["name", "content"]
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================
