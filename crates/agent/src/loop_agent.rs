//! Agent loop - core processing engine

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use labrelay_config::Config;
use labrelay_mcp::{EnvelopeStatus, McpError, ResultEnvelope};
use labrelay_plan::Workflow;
use labrelay_provider::{ChatParams, Message, Provider, ToolCall, ToolCallDef, ToolChoice};
use labrelay_session::ConversationStore;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::ContextBuilder;
use crate::control::{ControlContext, ControlLayer, Termination, Verdict};
use crate::guidance::Guidance;
use crate::schema::{from_model_call, to_model_tool};
use crate::tools::ToolRegistry;
use crate::wrapper::ResultWrapper;
use crate::{AgentError, Result};

/// Model and turn limits for one loop
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_turns: u32,
    pub history_messages: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.default_model(),
            max_tokens: config.agent.max_tokens,
            temperature: config.agent.temperature,
            max_turns: config.agent.max_turns,
            history_messages: config.agent.history_messages,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One tool call as seen by the user
#[derive(Debug, Clone, PartialEq)]
pub struct CallSummary {
    pub tool: String,
    pub status: EnvelopeStatus,
    pub summary: String,
}

/// Result of processing one user message
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub calls: Vec<CallSummary>,
    pub termination: Option<Termination>,
    pub turns: u32,
}

/// A model call ready for dispatch
struct Dispatch {
    call: ToolCall,
    args: Value,
}

/// The agent loop: model turns, gated tool calls, wrapped results
pub struct AgentLoop<P: Provider> {
    provider: Arc<P>,
    settings: AgentSettings,
    context: ContextBuilder,
    tools: ToolRegistry,
    guidance: Guidance,
    wrapper: ResultWrapper,
    control: ControlLayer,
    controls: Mutex<HashMap<String, ControlContext>>,
    sessions: Mutex<ConversationStore>,
    workflow: Option<Arc<Workflow>>,
}

impl<P: Provider> AgentLoop<P> {
    pub fn new(provider: P, tools: ToolRegistry, sessions: ConversationStore, config: &Config) -> Self {
        Self {
            provider: Arc::new(provider),
            settings: AgentSettings::from_config(config),
            context: ContextBuilder::new(config.workspace_path())
                .with_system_prompt(config.agent.system_prompt.clone()),
            tools,
            guidance: Guidance::builtin().with_entries(&config.guidance),
            wrapper: ResultWrapper::new(),
            control: ControlLayer::new(config.control.clone()),
            controls: Mutex::new(HashMap::new()),
            sessions: Mutex::new(sessions),
            workflow: None,
        }
    }

    /// Plan state feeds the system prompt and the confirmation scope
    pub fn with_workflow(mut self, workflow: Arc<Workflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_context(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Process a message directly (for CLI)
    pub async fn process_direct(&self, content: &str, session_key: &str) -> String {
        match self.process(content, session_key).await {
            Ok(reply) => reply.text,
            Err(e) => {
                error!("◆ AGENT LOOP FAILED: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    /// Process one user message in the given conversation
    pub async fn process(&self, content: &str, session_key: &str) -> Result<Reply> {
        info!("◆ MESSAGE FOR {}", session_key);
        debug!("Content: {}", content.chars().take(100).collect::<String>());

        let (history, fresh) = {
            let mut sessions = self.sessions.lock().await;
            let conversation = sessions.get_or_create(session_key).await;
            (
                conversation.history(self.settings.history_messages),
                conversation.is_fresh(),
            )
        };

        let mut ctx = {
            let mut controls = self.controls.lock().await;
            match controls.remove(session_key) {
                Some(ctx) if !fresh => ctx,
                _ => ControlContext::new(),
            }
        };
        ctx.begin_turn();

        let plan_state = match &self.workflow {
            Some(workflow) => {
                if let Ok(plan) = workflow.status(None).await {
                    ctx.set_latest_plan(plan.id);
                }
                workflow.state_prompt().await.ok().flatten()
            }
            None => None,
        };
        self.control.observe_user_message(&mut ctx, content);

        let messages = self
            .context
            .build_messages(history, content, plan_state.as_deref())
            .await;
        let outcome = self.run_agent_loop(messages, &mut ctx).await;

        self.controls
            .lock()
            .await
            .insert(session_key.to_string(), ctx);

        let answer = match &outcome {
            Ok(reply) => reply.text.clone(),
            Err(e) => format!("Error: {}", e),
        };
        {
            let mut sessions = self.sessions.lock().await;
            let conversation = sessions.get_or_create(session_key).await;
            conversation.add_message("user", content);
            conversation.add_message("assistant", &answer);
            if let Err(e) = sessions.save_key(session_key).await {
                warn!("◆ CONVERSATION {} NOT SAVED: {}", session_key, e);
            }
        }

        outcome
    }

    /// Run the agent loop with tool calling
    async fn run_agent_loop(&self, mut messages: Vec<Message>, ctx: &mut ControlContext) -> Result<Reply> {
        let tool_defs: Vec<_> = self
            .tools
            .descriptors()
            .into_iter()
            .map(|d| to_model_tool(d, Some(&self.guidance)))
            .collect();
        let mut calls = Vec::new();
        let mut turn = 0;

        loop {
            turn += 1;
            if turn > self.settings.max_turns {
                return Err(AgentError::MaxTurns(self.settings.max_turns));
            }
            debug!("◆ TURN {}", turn);

            let response = self
                .provider
                .chat(self.params(messages.clone(), tool_defs.clone(), ToolChoice::Auto))
                .await
                .map_err(|e| AgentError::Provider(e.to_string()))?;

            if !response.has_tool_calls() {
                return Ok(Reply {
                    text: response.content.unwrap_or_else(|| "Task completed.".to_string()),
                    calls,
                    termination: None,
                    turns: turn,
                });
            }

            let tool_call_defs: Vec<ToolCallDef> = response
                .tool_calls
                .iter()
                .map(|tc| ToolCallDef::new(&tc.id, &tc.name, tc.arguments.clone()))
                .collect();
            ContextBuilder::add_assistant_message(
                &mut messages,
                response.content.as_deref(),
                Some(tool_call_defs),
            );

            // gate every call in order, then run the allowed ones together
            let mut outcomes: Vec<Option<ResultEnvelope>> = Vec::new();
            let mut pending = Vec::new();
            for call in &response.tool_calls {
                match self.admit(ctx, call) {
                    Ok(args) => {
                        outcomes.push(None);
                        pending.push((outcomes.len() - 1, Dispatch { call: call.clone(), args }));
                    }
                    Err(refusal) => outcomes.push(Some(refusal)),
                }
            }

            let results = join_all(
                pending
                    .iter()
                    .map(|(_, d)| self.tools.execute(&d.call.name, d.args.clone())),
            )
            .await;

            let mut follow_ups = Vec::new();
            for ((slot, dispatch), raw) in pending.into_iter().zip(results) {
                let envelope = self.wrapper.wrap(&dispatch.call.name, &dispatch.args, raw);
                self.control
                    .after_call(ctx, &dispatch.call.name, &dispatch.args, &envelope);
                if let Some(instruction) = self.guidance.post_call_instruction(&dispatch.call.name) {
                    follow_ups.push(instruction);
                }
                outcomes[slot] = Some(envelope);
            }

            for (call, envelope) in response.tool_calls.iter().zip(outcomes) {
                let envelope = envelope.unwrap_or_else(|| ResultEnvelope::error("call was not run"));
                debug!("◆ {} → {}", call.name, envelope.status.as_str());
                ContextBuilder::add_tool_result(&mut messages, &call.id, &call.name, &envelope.to_model_message());
                if envelope.payload.get("blocked").and_then(Value::as_str) == Some("halted") {
                    continue;
                }
                calls.push(CallSummary {
                    tool: call.name.clone(),
                    status: envelope.status,
                    summary: envelope.to_user_message(),
                });
            }
            for instruction in follow_ups {
                messages.push(Message::system(instruction));
            }

            match ctx.termination() {
                Some(Termination::Hard) => {
                    warn!("◆ TOOL LOOP HALTED AFTER {} TURNS", turn);
                    return Ok(Reply {
                        text: halt_message(&calls),
                        calls,
                        termination: Some(Termination::Hard),
                        turns: turn,
                    });
                }
                Some(Termination::Soft) => {
                    info!("◆ TASK FINISHED BY TOOL, CLOSING TURN");
                    let text = self.closing_answer(messages, &calls).await;
                    return Ok(Reply {
                        text,
                        calls,
                        termination: Some(Termination::Soft),
                        turns: turn,
                    });
                }
                None => {}
            }
        }
    }

    /// Control check, then argument validation; Err carries the refusal envelope
    fn admit(&self, ctx: &mut ControlContext, call: &ToolCall) -> std::result::Result<Value, ResultEnvelope> {
        if let Verdict::Block(refusal) = self.control.check(ctx, &call.name, &call.arguments) {
            return Err(refusal.to_envelope());
        }

        let descriptor = self
            .tools
            .descriptor(&call.name)
            .ok_or_else(|| ResultEnvelope::from_error(&McpError::ToolNotFound(call.name.clone())))?;

        from_model_call(descriptor, call).map_err(|e| {
            warn!("{}", e);
            ResultEnvelope::error(e.to_string())
                .with_instruction("Call the tool again with every required argument of the declared type.")
                .with_payload(json!({ "error_kind": "schema", "fields": e.fields() }))
        })
    }

    /// One last model turn without tools after a finishing action
    async fn closing_answer(&self, messages: Vec<Message>, calls: &[CallSummary]) -> String {
        match self
            .provider
            .chat(self.params(messages, Vec::new(), ToolChoice::None))
            .await
        {
            Ok(response) => match response.content {
                Some(text) if !text.trim().is_empty() => text,
                _ => halt_message(calls),
            },
            Err(e) => {
                warn!("◆ CLOSING TURN FAILED: {}", e);
                halt_message(calls)
            }
        }
    }

    fn params(&self, messages: Vec<Message>, tools: Vec<labrelay_provider::Tool>, tool_choice: ToolChoice) -> ChatParams {
        ChatParams {
            model: self.settings.model.clone(),
            messages,
            tools,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            tool_choice,
        }
    }
}

/// Plain-text wrap-up built from the last results
fn halt_message(calls: &[CallSummary]) -> String {
    match calls.last() {
        Some(last) => format!("Stopped after '{}': {}", last.tool, last.summary),
        None => "Stopped.".to_string(),
    }
}
