//! OPERATOR TOOLKIT: local tools plus routed remote tools

pub mod plan;

pub use plan::{register_plan_tools, ExecutePlanTool, PlanCircuitTool, PopulatePlanTool, WorkflowStatusTool};

use async_trait::async_trait;
use labrelay_mcp::{McpError, ResultEnvelope, ToolCaller, ToolDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on one tool call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

type BoxedTool = Box<dyn LocalTool + Send + Sync>;

/// Tool implemented inside the agent process
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, args: Value) -> ResultEnvelope;
}

/// Local tools first, then whatever the remote caller serves
pub struct ToolRegistry {
    local: HashMap<String, BoxedTool>,
    remote: Option<Arc<dyn ToolCaller>>,
    remote_tools: Vec<ToolDescriptor>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            local: HashMap::new(),
            remote: None,
            remote_tools: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Route unknown names to `caller`, which serves `tools`
    pub fn with_remote(mut self, caller: Arc<dyn ToolCaller>, tools: Vec<ToolDescriptor>) -> Self {
        self.remote = Some(caller);
        self.remote_tools = tools;
        self
    }

    pub fn register<T: LocalTool + 'static>(&mut self, tool: T) {
        let name = tool.descriptor().name.clone();
        if self.local.insert(name.clone(), Box::new(tool)).is_some() {
            warn!("◆ LOCAL TOOL '{}' REPLACED", name);
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        match self.local.get(name) {
            Some(tool) => Some(tool.descriptor()),
            None => self.remote_tools.iter().find(|d| d.name == name),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.descriptor(name).is_some()
    }

    /// Every visible descriptor; a local tool shadows a remote one of the same name
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut local: Vec<&ToolDescriptor> = self.local.values().map(|t| t.descriptor()).collect();
        local.sort_by(|a, b| a.name.cmp(&b.name));
        let remote = self
            .remote_tools
            .iter()
            .filter(|d| !self.local.contains_key(&d.name));
        local.into_iter().chain(remote).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors().into_iter().map(|d| d.name.clone()).collect()
    }

    /// Run one call within the call timeout; failures come back as envelopes
    pub async fn execute(&self, name: &str, args: Value) -> ResultEnvelope {
        let outcome = tokio::time::timeout(self.call_timeout, self.dispatch(name, args)).await;
        match outcome {
            Ok(envelope) => envelope,
            Err(_) => {
                warn!("◆ CALL '{}' CANCELLED AFTER {:?}", name, self.call_timeout);
                ResultEnvelope::from_error(&McpError::Timeout {
                    tool: name.to_string(),
                    after: self.call_timeout,
                })
            }
        }
    }

    async fn dispatch(&self, name: &str, args: Value) -> ResultEnvelope {
        if let Some(tool) = self.local.get(name) {
            debug!("◆ LOCAL CALL {}", name);
            return tool.execute(args).await;
        }

        match &self.remote {
            Some(caller) if caller.has_tool(name) => match caller.call(name, args).await {
                Ok(output) => ResultEnvelope::from_output(&output),
                Err(e) => {
                    warn!("◆ CALL '{}' FAILED: {}", name, e);
                    ResultEnvelope::from_error(&e)
                }
            },
            _ => ResultEnvelope::from_error(&McpError::ToolNotFound(name.to_string())),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
