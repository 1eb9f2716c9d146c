//! BENCHSHEET: Configuration management for LabRelay
//!
//! Loads and saves the relay's parameters: model endpoint, tool servers,
//! control-layer limits and plan workflow settings.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir, plans_path, sessions_dir, workspace_path};

/// Errors in configuration handling
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("◆ BENCHSHEET I/O ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("◆ BENCHSHEET UNREADABLE: {0}")]
    Json(#[from] serde_json::Error),

    #[error("◆ BENCHSHEET NOT FOUND: {0}")]
    NotFound(PathBuf),

    #[error("◆ BENCHSHEET INVALID: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// How a tool server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Long-lived child process speaking line-delimited JSON-RPC on stdio
    Subprocess,
    /// Persistent server-sent event stream with POSTed requests
    Stream,
    /// Stateless HTTP endpoint, one POST per request
    Endpoint,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportKind::Subprocess => "subprocess",
            TransportKind::Stream => "stream",
            TransportKind::Endpoint => "endpoint",
        };
        f.write_str(label)
    }
}

/// One tool server entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ToolServerConfig {
    /// Subprocess entry
    pub fn subprocess(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Subprocess,
            command: Some(command.into()),
            args,
            env: BTreeMap::new(),
            url: None,
            call_timeout_secs: default_call_timeout_secs(),
            enabled: true,
        }
    }

    /// Network entry (stream or endpoint)
    pub fn remote(name: impl Into<String>, transport: TransportKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: Some(url.into()),
            call_timeout_secs: default_call_timeout_secs(),
            enabled: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("tool server name is empty".into()));
        }
        match self.transport {
            TransportKind::Subprocess => {
                let has_command = self
                    .command
                    .as_deref()
                    .map(|c| !c.trim().is_empty())
                    .unwrap_or(false);
                if !has_command {
                    return Err(ConfigError::Invalid(format!(
                        "tool server '{}' uses subprocess transport without a command",
                        self.name
                    )));
                }
            }
            TransportKind::Stream | TransportKind::Endpoint => {
                let url = self.url.as_deref().unwrap_or("");
                if !is_http_url(url) {
                    return Err(ConfigError::Invalid(format!(
                        "tool server '{}' needs an http(s) url, got '{}'",
                        self.name, url
                    )));
                }
            }
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "tool server '{}' has a zero call timeout",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Model endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base", skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
        }
    }
}

fn default_api_base() -> Option<String> {
    Some("http://127.0.0.1:1234/v1".to_string())
}

/// Agent loop defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
    #[serde(default = "default_session_max_messages")]
    pub session_max_messages: usize,
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: i64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_turns: default_max_turns(),
            history_messages: default_history_messages(),
            session_max_messages: default_session_max_messages(),
            session_idle_minutes: default_session_idle_minutes(),
            max_sessions: default_max_sessions(),
            system_prompt: None,
        }
    }
}

fn default_workspace() -> String {
    "~/.labrelay/bench".to_string()
}

fn default_model() -> String {
    "qwen3-8b-finetuned".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.01
}

fn default_max_turns() -> u32 {
    20
}

fn default_history_messages() -> usize {
    20
}

fn default_session_max_messages() -> usize {
    100
}

fn default_session_idle_minutes() -> i64 {
    60
}

fn default_max_sessions() -> usize {
    100
}

/// Control-layer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_max_total_calls")]
    pub max_total_calls: usize,
    #[serde(default = "default_max_calls_per_tool")]
    pub max_calls_per_tool: usize,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_confirmation_required")]
    pub confirmation_required: Vec<String>,
    #[serde(default = "default_termination_actions")]
    pub termination_actions: Vec<String>,
    #[serde(default = "default_confirmation_phrases")]
    pub confirmation_phrases: Vec<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_total_calls: default_max_total_calls(),
            max_calls_per_tool: default_max_calls_per_tool(),
            loop_threshold: default_loop_threshold(),
            history_window: default_history_window(),
            confirmation_required: default_confirmation_required(),
            termination_actions: default_termination_actions(),
            confirmation_phrases: default_confirmation_phrases(),
        }
    }
}

fn default_max_total_calls() -> usize {
    15
}

fn default_max_calls_per_tool() -> usize {
    5
}

fn default_loop_threshold() -> usize {
    3
}

fn default_history_window() -> usize {
    32
}

fn default_confirmation_required() -> Vec<String> {
    vec![
        "execute_circuit_plan".to_string(),
        "add_components_from_plan".to_string(),
    ]
}

fn default_termination_actions() -> Vec<String> {
    vec![
        "add_components_from_plan".to_string(),
        "execute_circuit_plan".to_string(),
        "save_current_design".to_string(),
    ]
}

fn default_confirmation_phrases() -> Vec<String> {
    ["confirm", "continue", "proceed", "yes", "确认", "继续执行", "已打开"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// How strictly plan proposals check element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatalogPolicy {
    /// Only element types from the built-in catalog are accepted
    #[default]
    Strict,
    /// Any well-formed identifier is accepted and resolved at population time
    Permissive,
}

/// Plan workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_server: Option<String>,
    #[serde(default)]
    pub catalog_policy: CatalogPolicy,
    /// Overrides for the design operation → tool name table
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub design_tools: BTreeMap<String, String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            design_server: None,
            catalog_policy: CatalogPolicy::default(),
            design_tools: BTreeMap::new(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

/// Category of injected tool guidance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidanceKind {
    Decision,
    Recommendation,
    Warning,
    Precondition,
    Completion,
}

/// Extra guidance text appended to a tool's description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceEntry {
    pub tool: String,
    pub kind: GuidanceKind,
    pub text: String,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub guidance: Vec<GuidanceEntry>,
}

impl Config {
    /// Load from the default location
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::load_from(&path).await
    }

    /// Load from specific location
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("◆ NO BENCHSHEET AT {:?}, USING DEFAULTS", path);
            return Ok(Config::default());
        }

        debug!("◆ READING BENCHSHEET FROM {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save to the default location
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("◆ WRITING BENCHSHEET TO {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Apply `LABRELAY_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(model) = env_value("LABRELAY_MODEL") {
            self.agent.model = model;
        }
        if let Some(key) = env_value("LABRELAY_API_KEY") {
            self.model.api_key = key;
        }
        if let Some(base) = env_value("LABRELAY_API_BASE") {
            self.model.api_base = Some(base);
        }
    }

    /// Check structural constraints that would otherwise surface mid-run
    pub fn validate(&self) -> Result<()> {
        if let Some(base) = self.model.api_base.as_deref() {
            if !base.is_empty() && !is_http_url(base) {
                return Err(ConfigError::Invalid(format!(
                    "model api_base must start with http:// or https://, got '{}'",
                    base
                )));
            }
        }

        let temperature = self.agent.temperature;
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature must be between 0 and 1, got {}",
                temperature
            )));
        }

        if self.control.max_total_calls == 0 || self.control.max_calls_per_tool == 0 {
            return Err(ConfigError::Invalid("call budgets must be positive".into()));
        }
        if self.control.loop_threshold == 0 {
            return Err(ConfigError::Invalid("loop threshold must be positive".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.tool_servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tool server name '{}'",
                    server.name
                )));
            }
        }

        Ok(())
    }

    /// Enabled tool servers in declaration order
    pub fn active_tool_servers(&self) -> Vec<ToolServerConfig> {
        self.tool_servers
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    /// Agent working directory
    pub fn workspace_path(&self) -> PathBuf {
        paths::expand_home(&self.agent.workspace)
    }

    /// Plan store file
    pub fn plans_path(&self) -> PathBuf {
        match self.plan.store_path.as_deref() {
            Some(path) if !path.is_empty() => paths::expand_home(path),
            _ => plans_path(),
        }
    }

    /// Model API key, if one is set
    pub fn api_key(&self) -> Option<String> {
        let key = self.model.api_key.trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    /// Model endpoint base URL, if one is set
    pub fn api_base(&self) -> Option<String> {
        self.model
            .api_base
            .as_ref()
            .filter(|base| !base.is_empty())
            .cloned()
    }

    /// Whether any model endpoint is reachable in principle
    pub fn has_model_endpoint(&self) -> bool {
        self.api_key().is_some() || self.api_base().is_some()
    }

    /// Default model identifier
    pub fn default_model(&self) -> String {
        self.agent.model.clone()
    }

    /// Transcript length cap
    pub fn session_max_messages(&self) -> usize {
        self.agent.session_max_messages
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Initialize configuration and working directories
pub async fn init() -> Result<Config> {
    let config_path = config_path();

    if config_path.exists() {
        warn!("◆ BENCHSHEET ALREADY PRESENT AT {:?}", config_path);
    } else {
        let config = Config::default();
        config.save().await?;
        info!("◆ BENCHSHEET WRITTEN TO {:?}", config_path);
    }

    let config = Config::load().await?;

    let workspace = config.workspace_path();
    tokio::fs::create_dir_all(&workspace).await?;
    info!("◆ BENCH READY AT {:?}", workspace);

    if let Some(plans_dir) = config.plans_path().parent() {
        tokio::fs::create_dir_all(plans_dir).await?;
    }

    Ok(config)
}
