//! JSON-RPC 2.0 framing and the MCP method vocabulary

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{McpError, Result};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "labrelay";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// JSON-RPC error code for unsupported methods
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(McpError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| McpError::Protocol(format!("response {} carries no result", self.id)))
    }
}

/// Unsolicited message pushed by a server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub provider: String,
    pub method: String,
    pub params: Value,
}

/// What an inbound frame turned out to be
#[derive(Debug)]
pub enum Inbound {
    Response(JsonRpcResponse),
    /// Server-initiated request; we must answer it
    Request { id: Value, method: String },
    Notification { method: String, params: Value },
}

/// Sort an inbound JSON value: id+method is a request, id alone is a response
pub fn classify(value: Value) -> Result<Inbound> {
    let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());

    match (has_id, method) {
        (true, Some(method)) => Ok(Inbound::Request {
            id: value["id"].clone(),
            method,
        }),
        (true, None) => {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("unreadable response: {}", e)))?;
            Ok(Inbound::Response(response))
        }
        (false, Some(method)) => Ok(Inbound::Notification {
            method,
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }),
        (false, None) => Err(McpError::Protocol(
            "frame has neither id nor method".to_string(),
        )),
    }
}

/// Reply refusing a server-initiated request
pub fn method_not_found(id: Value, method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("client does not handle '{}'", method),
        }
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub fn call_params(tool: &str, arguments: Value) -> Value {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    json!({ "name": tool, "arguments": arguments })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

/// Result of `tools/call`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured: Option<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            structured: None,
            is_error: false,
        }
    }

    /// Output whose payload is a JSON document
    pub fn json(value: Value) -> Self {
        Self {
            content: vec![ContentItem::Text {
                text: value.to_string(),
            }],
            structured: Some(value),
            is_error: false,
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Concatenated text blocks
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Best structured view: explicit structured content, then parsed text, then raw text
    pub fn payload(&self) -> Value {
        if let Some(structured) = &self.structured {
            return structured.clone();
        }
        let text = self.joined_text();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }
}
