//! PATCHBAY error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Failures at the tool-server boundary
#[derive(Error, Debug)]
pub enum McpError {
    #[error("◆ PROVIDER UNREACHABLE: {0}")]
    Connection(String),

    #[error("◆ PROTOCOL VIOLATION: {0}")]
    Protocol(String),

    #[error("◆ CALL TIMED OUT: '{tool}' after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("◆ PROVIDER DISCONNECTED: {0}")]
    Disconnected(String),

    #[error("◆ REMOTE ERROR {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("◆ TOOL NOT FOUND: {0}")]
    ToolNotFound(String),

    #[error("◆ PROVIDER UNAVAILABLE: {0}")]
    Unavailable(String),

    #[error("◆ NO TOOL SERVERS CONFIGURED")]
    NoProviders,

    #[error("◆ DUPLICATE PROVIDER: {0}")]
    DuplicateProvider(String),

    #[error("◆ I/O ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("◆ PAYLOAD UNREADABLE: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Stable label used in structured results
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::Connection(_) => "connection",
            McpError::Protocol(_) => "protocol",
            McpError::Timeout { .. } => "timeout",
            McpError::Disconnected(_) => "disconnected",
            McpError::Remote { .. } => "remote",
            McpError::ToolNotFound(_) => "tool_not_found",
            McpError::Unavailable(_) => "unavailable",
            McpError::NoProviders => "no_providers",
            McpError::DuplicateProvider(_) => "duplicate_provider",
            McpError::Io(_) => "io",
            McpError::Json(_) => "json",
        }
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. } | McpError::Disconnected(_) | McpError::Connection(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
