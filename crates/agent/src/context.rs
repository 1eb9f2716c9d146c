//! Context builder for assembling agent prompts

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::debug;

use labrelay_provider::{Message, ToolCallDef};

/// Builds context (system prompt + messages) for the agent
pub struct ContextBuilder {
    workspace: PathBuf,
    custom_prompt: Option<String>,
}

impl ContextBuilder {
    /// Bootstrap files to load
    const BOOTSTRAP_FILES: &[&str] = &["LAB.md", "CONVENTIONS.md"];

    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            custom_prompt: None,
        }
    }

    /// Replace the built-in identity text
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.custom_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    /// Build the system prompt, ending with the current plan state if any
    pub async fn build_system_prompt(&self, plan_state: Option<&str>) -> String {
        let mut parts = vec![self.identity()];

        if let Ok(bootstrap) = self.load_bootstrap_files().await {
            if !bootstrap.is_empty() {
                parts.push(bootstrap);
            }
        }

        if let Some(state) = plan_state {
            parts.push(format!("# Current Plan\n\n{}", state));
        }

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        if let Some(prompt) = &self.custom_prompt {
            return prompt.clone();
        }

        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        format!(
            r#"# LabRelay

You are LabRelay, an assistant that drives lab and circuit-design instruments through tools.

## Current Time
{}

## Workspace
{}

## Working Rules
- Inspect before acting: check the open design and the project libraries first.
- New schematics go through a plan: plan_circuit, then wait for the user's confirmation,
  then execute_circuit_plan, then wait until the user has opened the design, then
  add_components_from_plan.
- Never guess library or cell names; use names reported by tools.
- Every tool result carries a status, a summary and sometimes an instruction. Follow the
  instruction.
- When a result says to stop or wait, answer the user in plain text and call no more tools."#,
            now,
            self.workspace.display()
        )
    }

    async fn load_bootstrap_files(&self) -> std::io::Result<String> {
        let mut parts = Vec::new();

        for filename in Self::BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.exists() {
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        parts.push(format!("## {}\n\n{}", filename, content));
                    }
                    Err(e) => debug!("Failed to read {}: {}", filename, e),
                }
            }
        }

        Ok(parts.join("\n\n"))
    }

    /// Build complete messages list for the model
    pub async fn build_messages(
        &self,
        history: Vec<Message>,
        current_message: &str,
        plan_state: Option<&str>,
    ) -> Vec<Message> {
        let system_prompt = self.build_system_prompt(plan_state).await;

        let mut messages = vec![Message::system(system_prompt)];
        messages.extend(history);
        messages.push(Message::user(current_message));

        messages
    }

    pub fn add_tool_result(
        messages: &mut Vec<Message>,
        tool_call_id: &str,
        name: &str,
        result: &str,
    ) {
        messages.push(Message::tool(tool_call_id, name, result));
    }

    /// Add an assistant message with tool calls
    pub fn add_assistant_message(
        messages: &mut Vec<Message>,
        content: Option<&str>,
        tool_calls: Option<Vec<ToolCallDef>>,
    ) {
        let mut msg = Message::assistant(content.unwrap_or(""));
        if let Some(calls) = tool_calls {
            msg.tool_calls = Some(calls);
        }
        messages.push(msg);
    }
}
