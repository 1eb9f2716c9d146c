//! Transports: subprocess lines, persistent event stream, stateless endpoint
//!
//! All three speak the same JSON-RPC vocabulary; [`Rpc`] is the seam they
//! implement so the handshake and tool calls are written once.

use std::sync::Arc;

use async_trait::async_trait;
use labrelay_config::{ToolServerConfig, TransportKind};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::descriptor::{parse_tool_list, ToolDescriptor};
use crate::error::{McpError, Result};
use crate::protocol::{self, methods, ServerNotification, ToolOutput};

pub mod endpoint;
pub mod stdio;
pub mod stream;

pub use endpoint::{EndpointTransport, RetryPolicy};
pub use stdio::StdioTransport;
pub use stream::{SseEvent, SseParser, StreamTransport};

/// Connection to one tool provider
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the connection and complete the handshake
    async fn connect(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    async fn invoke(&self, tool: &str, args: Value) -> Result<ToolOutput>;

    /// Release the connection; subprocesses are reaped
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Unsolicited server pushes, where the transport carries them
    fn subscribe(&self) -> Option<broadcast::Receiver<ServerNotification>> {
        None
    }
}

/// Raw JSON-RPC exchange
#[async_trait]
pub(crate) trait Rpc: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

pub(crate) async fn handshake(rpc: &dyn Rpc, provider: &str) -> Result<()> {
    let result = rpc
        .request(methods::INITIALIZE, Some(protocol::initialize_params()))
        .await?;
    debug!(
        "◆ {} HANDSHAKE: server {} protocol {}",
        provider,
        result["serverInfo"]["name"].as_str().unwrap_or("?"),
        result["protocolVersion"].as_str().unwrap_or("?")
    );
    rpc.notify(methods::INITIALIZED, None).await
}

pub(crate) async fn fetch_tools(rpc: &dyn Rpc) -> Result<Vec<ToolDescriptor>> {
    let result = rpc.request(methods::TOOLS_LIST, Some(json!({}))).await?;
    let (tools, _rejected) = parse_tool_list(&result)?;
    Ok(tools)
}

pub(crate) async fn call_tool(rpc: &dyn Rpc, tool: &str, args: Value) -> Result<ToolOutput> {
    let result = rpc
        .request(methods::TOOLS_CALL, Some(protocol::call_params(tool, args)))
        .await?;
    serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("unreadable tools/call result: {}", e)))
}

/// Build the transport a server entry describes
pub fn from_config(config: &ToolServerConfig) -> Result<Arc<dyn Transport>> {
    match config.transport {
        TransportKind::Subprocess => {
            let command = config.command.clone().ok_or_else(|| {
                McpError::Connection(format!("'{}' has no command", config.name))
            })?;
            Ok(Arc::new(StdioTransport::new(
                &config.name,
                command,
                config.args.clone(),
                config.env.clone(),
            )))
        }
        TransportKind::Stream => {
            let url = remote_url(config)?;
            Ok(Arc::new(StreamTransport::new(&config.name, url)))
        }
        TransportKind::Endpoint => {
            let url = remote_url(config)?;
            Ok(Arc::new(EndpointTransport::new(
                &config.name,
                url,
                RetryPolicy::default(),
            )))
        }
    }
}

fn remote_url(config: &ToolServerConfig) -> Result<String> {
    config
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| McpError::Connection(format!("'{}' has no url", config.name)))
}
