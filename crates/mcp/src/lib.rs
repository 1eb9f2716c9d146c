//! PATCHBAY: Tool-server connections
//!
//! Speaks the JSON-RPC tool protocol over three transports, merges every
//! provider's tools into one routing table, and hands results back as
//! [`ResultEnvelope`]s.

use async_trait::async_trait;
use serde_json::Value;

pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod manager;
mod pending;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use descriptor::{parse_tool_list, ParamSpec, ParamType, ToolDescriptor, ToolDescriptorBuilder};
pub use envelope::{EnvelopeStatus, ResultEnvelope};
pub use error::{McpError, Result};
pub use manager::{
    ClientManager, ConnectReport, PendingCall, ProviderState, ProviderStatus, DEFAULT_CALL_TIMEOUT,
};
pub use protocol::{ContentItem, ServerNotification, ToolOutput};
pub use registry::{Collision, RouteTable, RoutedTool};
pub use transport::Transport;

/// Anything that can execute a named tool
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call(&self, tool: &str, args: Value) -> Result<ToolOutput>;

    fn has_tool(&self, tool: &str) -> bool;
}
