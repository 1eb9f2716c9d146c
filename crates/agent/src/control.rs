//! Call gating: confirmation, loop detection and budgets

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Local};
use labrelay_config::ControlConfig;
use labrelay_mcp::{EnvelopeStatus, ResultEnvelope};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// One proposed call, allowed or not
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub tool: String,
    pub signature: String,
    pub timestamp: DateTime<Local>,
}

/// Per-conversation counters of allowed calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallBudget {
    pub total: usize,
    pub per_tool: HashMap<String, usize>,
}

impl CallBudget {
    pub fn used(&self, tool: &str) -> usize {
        self.per_tool.get(tool).copied().unwrap_or(0)
    }

    fn charge(&mut self, tool: &str) {
        self.total += 1;
        *self.per_tool.entry(tool.to_string()).or_insert(0) += 1;
    }
}

/// How a conversation's tool loop should end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop without producing another model turn
    Hard,
    /// Let the model answer once more, without tools
    Soft,
}

/// Why a call was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    NeedsConfirmation { tool: String, scope: String },
    LoopDetected { tool: String, repeats: usize },
    BudgetExceeded { tool: String, used: usize, limit: usize },
    /// An earlier refusal already stopped this turn
    Halted { tool: String },
}

impl Refusal {
    pub fn termination(&self) -> Option<Termination> {
        match self {
            Refusal::NeedsConfirmation { .. } => None,
            Refusal::LoopDetected { .. }
            | Refusal::BudgetExceeded { .. }
            | Refusal::Halted { .. } => Some(Termination::Hard),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Refusal::NeedsConfirmation { .. } => "needs_confirmation",
            Refusal::LoopDetected { .. } => "loop_detected",
            Refusal::BudgetExceeded { .. } => "budget_exceeded",
            Refusal::Halted { .. } => "halted",
        }
    }

    /// Structured refusal fed back as the tool result
    pub fn to_envelope(&self) -> ResultEnvelope {
        match self {
            Refusal::NeedsConfirmation { tool, scope } => ResultEnvelope::blocked(format!(
                "'{}' needs user confirmation for {} before it can run.",
                tool, scope
            ))
            .with_instruction(
                "Ask the user to confirm. Do not call this tool again until they reply.",
            )
            .with_payload(json!({ "blocked": self.kind(), "tool": tool, "scope": scope })),
            Refusal::LoopDetected { tool, repeats } => ResultEnvelope::blocked(format!(
                "Loop detected: '{}' was called with identical arguments {} times in a row.",
                tool, repeats
            ))
            .with_instruction("Stop calling tools and report the current state to the user.")
            .with_payload(json!({ "blocked": self.kind(), "tool": tool })),
            Refusal::BudgetExceeded { tool, used, limit } => ResultEnvelope::blocked(format!(
                "Call budget exceeded for '{}': {} of {} calls used.",
                tool, used, limit
            ))
            .with_instruction("Stop calling tools and summarize what was done so far.")
            .with_payload(json!({ "blocked": self.kind(), "tool": tool, "used": used, "limit": limit })),
            Refusal::Halted { tool } => ResultEnvelope::blocked(format!(
                "'{}' was not run: tool calls were stopped earlier in this turn.",
                tool
            ))
            .with_instruction("Stop calling tools and report the current state to the user.")
            .with_payload(json!({ "blocked": self.kind(), "tool": tool })),
        }
    }
}

/// Outcome of checking one proposed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(Refusal),
}

/// Control state of one conversation
#[derive(Debug, Clone, Default)]
pub struct ControlContext {
    history: VecDeque<CallRecord>,
    budget: CallBudget,
    confirmations: HashSet<String>,
    latest_plan: Option<String>,
    termination: Option<Termination>,
}

impl ControlContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget(&self) -> &CallBudget {
        &self.budget
    }

    pub fn history(&self) -> impl Iterator<Item = &CallRecord> {
        self.history.iter()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn is_confirmed(&self, scope: &str) -> bool {
        self.confirmations.contains(scope)
    }

    /// Plan the next confirmation applies to
    pub fn set_latest_plan(&mut self, plan_id: impl Into<String>) {
        self.latest_plan = Some(plan_id.into());
    }

    /// Record the user's go-ahead for `scope`
    pub fn confirm(&mut self, scope: impl Into<String>) {
        self.confirmations.insert(scope.into());
    }

    /// Clear the termination flag at the start of a user turn
    pub fn begin_turn(&mut self) {
        self.termination = None;
    }

    fn terminate(&mut self, termination: Termination) {
        // a hard stop is never downgraded
        if self.termination != Some(Termination::Hard) {
            self.termination = Some(termination);
        }
    }
}

/// Stateless policy; state lives in [`ControlContext`]
#[derive(Debug, Clone)]
pub struct ControlLayer {
    config: ControlConfig,
}

impl ControlLayer {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn needs_confirmation(&self, tool: &str) -> bool {
        self.config.confirmation_required.iter().any(|t| t == tool)
    }

    pub fn is_termination_action(&self, tool: &str) -> bool {
        self.config.termination_actions.iter().any(|t| t == tool)
    }

    /// Whether a user message grants confirmation
    ///
    /// Latin phrases match whole words; any negation in the message withholds it.
    pub fn is_confirmation(&self, message: &str) -> bool {
        let lowered = message.to_lowercase().replace('\u{2019}', "'");
        let words = words(&lowered);
        if is_negated(&lowered, &words) {
            return false;
        }
        self.config
            .confirmation_phrases
            .iter()
            .any(|phrase| phrase_matches(&lowered, &words, &phrase.to_lowercase()))
    }

    /// Confirm the latest plan when the user's message says so
    pub fn observe_user_message(&self, ctx: &mut ControlContext, message: &str) -> bool {
        if !self.is_confirmation(message) {
            return false;
        }
        let scope = ctx.latest_plan.clone().unwrap_or_else(|| "latest".to_string());
        debug!("◆ CONFIRMATION RECORDED FOR {}", scope);
        ctx.confirm(scope);
        true
    }

    /// Check one proposed call and record it
    pub fn check(&self, ctx: &mut ControlContext, tool: &str, args: &Value) -> Verdict {
        let signature = signature(args);
        let verdict = self.evaluate(ctx, tool, &signature, args);

        ctx.history.push_back(CallRecord {
            tool: tool.to_string(),
            signature,
            timestamp: Local::now(),
        });
        while ctx.history.len() > self.config.history_window.max(self.config.loop_threshold) {
            ctx.history.pop_front();
        }

        match &verdict {
            Verdict::Allow => ctx.budget.charge(tool),
            Verdict::Block(refusal) => {
                warn!("◆ CALL BLOCKED ({}): {}", refusal.kind(), tool);
                if let Some(termination) = refusal.termination() {
                    ctx.terminate(termination);
                }
            }
        }
        verdict
    }

    fn evaluate(&self, ctx: &ControlContext, tool: &str, signature: &str, args: &Value) -> Verdict {
        if ctx.termination == Some(Termination::Hard) {
            return Verdict::Block(Refusal::Halted {
                tool: tool.to_string(),
            });
        }

        if self.needs_confirmation(tool) {
            let scope = confirmation_scope(ctx, args);
            if !ctx.is_confirmed(&scope) {
                return Verdict::Block(Refusal::NeedsConfirmation {
                    tool: tool.to_string(),
                    scope,
                });
            }
        }

        let threshold = self.config.loop_threshold;
        if ctx.history.len() >= threshold
            && ctx
                .history
                .iter()
                .rev()
                .take(threshold)
                .all(|r| r.tool == tool && r.signature == signature)
        {
            return Verdict::Block(Refusal::LoopDetected {
                tool: tool.to_string(),
                repeats: threshold + 1,
            });
        }

        if ctx.budget.total >= self.config.max_total_calls {
            return Verdict::Block(Refusal::BudgetExceeded {
                tool: tool.to_string(),
                used: ctx.budget.total,
                limit: self.config.max_total_calls,
            });
        }
        let used = ctx.budget.used(tool);
        if used >= self.config.max_calls_per_tool {
            return Verdict::Block(Refusal::BudgetExceeded {
                tool: tool.to_string(),
                used,
                limit: self.config.max_calls_per_tool,
            });
        }

        Verdict::Allow
    }

    /// Account for a finished call
    pub fn after_call(
        &self,
        ctx: &mut ControlContext,
        tool: &str,
        args: &Value,
        envelope: &ResultEnvelope,
    ) {
        if let Some(plan_id) = envelope
            .payload
            .get("plan_id")
            .and_then(|id| id.as_str())
            .filter(|_| envelope.status == EnvelopeStatus::NeedsConfirmation)
        {
            ctx.set_latest_plan(plan_id);
        }

        if !envelope.is_success() {
            return;
        }
        if self.needs_confirmation(tool) {
            let scope = confirmation_scope(ctx, args);
            ctx.confirmations.remove(&scope);
        }
        if self.is_termination_action(tool) {
            debug!("◆ TERMINATION ACTION COMPLETED: {}", tool);
            ctx.terminate(Termination::Soft);
        }
    }
}

const NEGATION_WORDS: &[&str] = &["no", "not", "never", "dont", "cancel", "stop", "wait", "hold"];
const NEGATION_MARKS: &[&str] = &["不", "别", "没", "勿", "取消"];

fn words(lowered: &str) -> Vec<&str> {
    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .collect()
}

fn is_negated(lowered: &str, words: &[&str]) -> bool {
    words
        .iter()
        .any(|w| NEGATION_WORDS.contains(w) || w.ends_with("n't"))
        || NEGATION_MARKS.iter().any(|mark| lowered.contains(mark))
}

fn phrase_matches(lowered: &str, words: &[&str], phrase: &str) -> bool {
    if !phrase.is_ascii() {
        return lowered.contains(phrase);
    }
    let wanted: Vec<&str> = phrase.split_whitespace().collect();
    !wanted.is_empty() && words.windows(wanted.len()).any(|window| window == wanted.as_slice())
}

/// Plan or target a confirmation is bound to
fn confirmation_scope(ctx: &ControlContext, args: &Value) -> String {
    args.get("plan_id")
        .and_then(|id| id.as_str())
        .filter(|id| !labrelay_plan::is_placeholder(Some(id)))
        .map(str::to_string)
        .or_else(|| ctx.latest_plan.clone())
        .unwrap_or_else(|| "latest".to_string())
}

/// Canonical argument signature: object keys sorted at every level
pub fn signature(args: &Value) -> String {
    canonical(args).to_string()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            json!(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
