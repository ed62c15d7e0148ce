//! Wire types for the Model Context Protocol, which layers tool/resource/
//! prompt semantics on top of JSON-RPC 2.0.
//!
//! MCP spec: <https://modelcontextprotocol.io/specification/2025-11-25>

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// Size limit applied when flattening a [`CallToolResult`] to text, to bound
/// memory use against a malicious or malfunctioning server.
pub const MAX_MCP_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: "nexus3".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequestParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

impl Default for InitializeRequestParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

/// Tool definition advertised by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<HashMap<String, Value>>,
}

/// A single content item returned from a tool call: MCP allows text,
/// image, and other modalities, but only `text` is flattened by
/// [`CallToolResult::to_text`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Join all `text` content items with newlines, truncating at
    /// [`MAX_MCP_OUTPUT_SIZE`] bytes.
    pub fn to_text(&self) -> String {
        let mut texts = Vec::new();
        let mut total = 0usize;
        for item in &self.content {
            if let ContentItem::Text { text } = item {
                total += text.len();
                if total > MAX_MCP_OUTPUT_SIZE {
                    texts.push(format!(
                        "\n... [truncated, exceeded {}MB limit]",
                        MAX_MCP_OUTPUT_SIZE / 1024 / 1024
                    ));
                    break;
                }
                texts.push(text.clone());
            }
        }
        texts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_text_joins_text_items_only() {
        let result = CallToolResult {
            content: vec![
                ContentItem::Text { text: "a".to_string() },
                ContentItem::Other,
                ContentItem::Text { text: "b".to_string() },
            ],
            is_error: false,
        };
        assert_eq!(result.to_text(), "a\nb");
    }

    #[test]
    fn to_text_truncates_past_limit() {
        let huge = "x".repeat(MAX_MCP_OUTPUT_SIZE + 1);
        let result = CallToolResult {
            content: vec![ContentItem::Text { text: huge }],
            is_error: false,
        };
        assert!(result.to_text().contains("truncated"));
    }
}
