//! Result envelope handed back to the agent

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::McpError;
use crate::protocol::ToolOutput;

/// Bound on the payload text included in a model view
pub const MODEL_DATA_LIMIT: usize = 4000;
const SUMMARY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Partial,
    Failed,
    Blocked,
    NeedsConfirmation,
    Error,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Success => "success",
            EnvelopeStatus::Partial => "partial",
            EnvelopeStatus::Failed => "failed",
            EnvelopeStatus::Blocked => "blocked",
            EnvelopeStatus::NeedsConfirmation => "needs_confirmation",
            EnvelopeStatus::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EnvelopeStatus::Success)
    }
}

/// Status, summary, optional instruction and raw payload of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: EnvelopeStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ResultEnvelope {
    pub fn new(status: EnvelopeStatus, summary: impl Into<String>) -> Self {
        Self {
            status,
            summary: summary.into(),
            instruction: None,
            payload: Value::Null,
        }
    }

    pub fn success(summary: impl Into<String>, payload: Value) -> Self {
        Self::new(EnvelopeStatus::Success, summary).with_payload(payload)
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Error, summary)
    }

    pub fn blocked(summary: impl Into<String>) -> Self {
        Self::new(EnvelopeStatus::Blocked, summary)
    }

    /// Raw tool output, before any per-tool wrapping
    pub fn from_output(output: &ToolOutput) -> Self {
        let text = output.joined_text();
        let status = if output.is_error {
            EnvelopeStatus::Error
        } else {
            EnvelopeStatus::Success
        };
        Self::new(status, truncate_chars(text.trim(), SUMMARY_LIMIT)).with_payload(output.payload())
    }

    pub fn from_error(error: &McpError) -> Self {
        let envelope = Self::error(error.to_string()).with_payload(json!({ "error_kind": error.kind() }));
        match error {
            McpError::Timeout { .. } => envelope.with_instruction(
                "The tool did not answer in time. Report the timeout instead of repeating the call.",
            ),
            McpError::ToolNotFound(_) => {
                envelope.with_instruction("Use only tools from the provided tool list.")
            }
            _ => envelope,
        }
    }

    pub fn with_status(mut self, status: EnvelopeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// JSON text fed to the model as the tool result
    pub fn to_model_message(&self) -> String {
        let mut view = json!({
            "status": self.status.as_str(),
            "summary": self.summary,
        });
        if let Some(instruction) = &self.instruction {
            view["instruction"] = json!(instruction);
        }
        if !self.payload.is_null() {
            let raw = self.payload.to_string();
            view["data"] = if raw.chars().count() > MODEL_DATA_LIMIT {
                json!(format!("{}…(truncated)", truncate_chars(&raw, MODEL_DATA_LIMIT)))
            } else {
                self.payload.clone()
            };
        }
        view.to_string()
    }

    /// Plain text shown to the user
    pub fn to_user_message(&self) -> String {
        self.summary.clone()
    }
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
