//! Plan workflow tools: propose, execute, populate, status

use std::sync::Arc;

use async_trait::async_trait;
use labrelay_mcp::{ParamSpec, ParamType, ResultEnvelope, ToolDescriptor};
use labrelay_plan::{catalog, PlanError, ProposeRequest, Step, Workflow};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{LocalTool, ToolRegistry};

/// Register the four workflow tools against one shared workflow
pub fn register_plan_tools(registry: &mut ToolRegistry, workflow: Arc<Workflow>) {
    registry.register(PlanCircuitTool::new(Arc::clone(&workflow)));
    registry.register(ExecutePlanTool::new(Arc::clone(&workflow)));
    registry.register(PopulatePlanTool::new(Arc::clone(&workflow)));
    registry.register(WorkflowStatusTool::new(workflow));
}

fn plan_error_kind(error: &PlanError) -> &'static str {
    match error {
        PlanError::NotFound { .. } => "not_found",
        PlanError::InvalidTransition { .. } => "invalid_transition",
        PlanError::UnknownElement(_) => "unknown_element",
        PlanError::Invalid(_) => "invalid",
        PlanError::NoWritableTarget(_) => "no_writable_target",
        PlanError::Lock(_) => "locked",
        PlanError::UnknownOperation(_) => "unknown_operation",
        PlanError::Io(_) | PlanError::Json(_) => "store",
        PlanError::Backend(_) => "backend",
    }
}

fn error_envelope(error: PlanError) -> ResultEnvelope {
    warn!("◆ PLAN TOOL FAILED: {}", error);
    let mut payload = json!({ "plan_error": plan_error_kind(&error) });
    let envelope = ResultEnvelope::error(error.to_string());
    let envelope = match &error {
        PlanError::NotFound { available, .. } => {
            payload["available"] = json!(available);
            envelope.with_instruction(if available.is_empty() {
                "No plans exist yet. Create one with plan_circuit.".to_string()
            } else {
                format!("Use one of the existing plan ids: {}.", available.join(", "))
            })
        }
        PlanError::InvalidTransition { .. } => envelope.with_instruction(
            "Call get_workflow_status to see which operation this plan allows next.",
        ),
        PlanError::UnknownElement(_) => envelope.with_instruction(format!(
            "Use only catalog element types: {}.",
            catalog::known_types().join(", ")
        )),
        _ => envelope,
    };
    envelope.with_payload(payload)
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Wires come as `{points: [...]}` objects or bare point lists
fn wire_step(value: &Value) -> Result<Step, PlanError> {
    match value {
        Value::Array(_) => Step::from_value(&json!({ "points": value })),
        other => Step::from_value(other),
    }
}

fn plan_id_param() -> ParamSpec {
    ParamSpec::string("plan_id")
        .describe("Plan ID returned by plan_circuit; omit to use the most recent plan")
}

// ===== plan_circuit =====

pub struct PlanCircuitTool {
    workflow: Arc<Workflow>,
    descriptor: ToolDescriptor,
}

impl PlanCircuitTool {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let descriptor = ToolDescriptor::builder("plan_circuit")
            .description(
                "Plan a new schematic: validates the element types, picks the target library \
                 and stores the plan. Nothing is created until the plan is executed.",
            )
            .param(ParamSpec::string("circuit_name").required().describe("Name of the circuit"))
            .param(
                ParamSpec::string("circuit_type")
                    .describe("Kind of circuit, e.g. filter, amplifier, matching network")
                    .default_value(json!("generic")),
            )
            .param(
                ParamSpec::array("components", ParamType::Object)
                    .required()
                    .describe("Elements to place: {type, name, x, y, angle?, ...parameters}"),
            )
            .param(
                ParamSpec::array("wires", ParamType::Any)
                    .describe("Wires as {points: [[x, y], ...]} or bare point lists"),
            )
            .param(ParamSpec::string("library_name").describe("Target library; defaults to the first writable one"))
            .param(ParamSpec::string("cell_name").describe("Target cell; derived from circuit_name when omitted"))
            .param(ParamSpec::string("description").describe("Free-text notes stored with the plan"))
            .build();
        Self {
            workflow,
            descriptor,
        }
    }

    fn request(args: &Value) -> Result<ProposeRequest, PlanError> {
        let mut steps = args
            .get("components")
            .and_then(|c| c.as_array())
            .map(|components| components.iter().map(Step::from_value).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        if let Some(wires) = args.get("wires").and_then(|w| w.as_array()) {
            for wire in wires {
                steps.push(wire_step(wire)?);
            }
        }

        Ok(ProposeRequest {
            name: optional_str(args, "circuit_name").unwrap_or_default().to_string(),
            kind: optional_str(args, "circuit_type").unwrap_or("generic").to_string(),
            description: optional_str(args, "description").unwrap_or_default().to_string(),
            steps,
            library: optional_str(args, "library_name").map(str::to_string),
            cell: optional_str(args, "cell_name").map(str::to_string),
        })
    }
}

#[async_trait]
impl LocalTool for PlanCircuitTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> ResultEnvelope {
        let request = match Self::request(&args) {
            Ok(request) => request,
            Err(e) => return error_envelope(e),
        };
        match self.workflow.propose(request).await {
            Ok(plan) => {
                info!("◆ PLAN {} PROPOSED FOR {}", plan.id, plan.target.uri);
                let mut payload = plan.summary();
                payload["steps"] = json!(plan.steps.iter().map(Step::label).collect::<Vec<_>>());
                ResultEnvelope::success(format!("Plan {} stored.", plan.id), payload)
            }
            Err(e) => error_envelope(e),
        }
    }
}

// ===== execute_circuit_plan =====

pub struct ExecutePlanTool {
    workflow: Arc<Workflow>,
    descriptor: ToolDescriptor,
}

impl ExecutePlanTool {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let descriptor = ToolDescriptor::builder("execute_circuit_plan")
            .description(
                "Create the empty schematic for a confirmed plan and save it. Components are \
                 added later by add_components_from_plan.",
            )
            .param(plan_id_param())
            .build();
        Self {
            workflow,
            descriptor,
        }
    }
}

#[async_trait]
impl LocalTool for ExecutePlanTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> ResultEnvelope {
        match self.workflow.execute(optional_str(&args, "plan_id")).await {
            Ok(report) if !report.success => {
                let error = report.error.unwrap_or_default();
                let mut payload = report.plan.summary();
                payload["created"] = json!(false);
                payload["success"] = json!(false);
                payload["plan_error"] = json!("backend");
                payload["error"] = json!(error);
                ResultEnvelope::error(format!(
                    "Plan {} was not executed: {}",
                    report.plan.id, error
                ))
                .with_instruction(
                    "The plan is still pending. Report the failure to the user; retry \
                     execute_circuit_plan only after the cause is fixed.",
                )
                .with_payload(payload)
            }
            Ok(report) => {
                let mut payload = report.plan.summary();
                payload["created"] = json!(report.created);
                payload["saved"] = json!(report.saved);
                payload["success"] = json!(true);
                ResultEnvelope::success(format!("Plan {} executed.", report.plan.id), payload)
            }
            Err(e) => error_envelope(e),
        }
    }
}

// ===== add_components_from_plan =====

pub struct PopulatePlanTool {
    workflow: Arc<Workflow>,
    descriptor: ToolDescriptor,
}

impl PopulatePlanTool {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let descriptor = ToolDescriptor::builder("add_components_from_plan")
            .description(
                "Place every planned element and wire into the executed plan's schematic, then \
                 save it once.",
            )
            .param(plan_id_param())
            .build();
        Self {
            workflow,
            descriptor,
        }
    }
}

#[async_trait]
impl LocalTool for PopulatePlanTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> ResultEnvelope {
        match self.workflow.populate(optional_str(&args, "plan_id")).await {
            Ok(report) => {
                let failures: Vec<Value> = report
                    .failures()
                    .map(|r| json!({ "step": r.label, "error": r.message }))
                    .collect();
                let mut payload = report.plan.summary();
                payload["placed"] = json!(report.placed);
                payload["failed"] = json!(report.failed);
                payload["saved"] = json!(report.saved);
                payload["success"] = json!(report.success);
                payload["failures"] = Value::Array(failures);
                ResultEnvelope::success(
                    format!("{} of {} steps placed.", report.placed, report.plan.steps.len()),
                    payload,
                )
            }
            Err(e) => error_envelope(e),
        }
    }
}

// ===== get_workflow_status =====

pub struct WorkflowStatusTool {
    workflow: Arc<Workflow>,
    descriptor: ToolDescriptor,
}

impl WorkflowStatusTool {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let descriptor = ToolDescriptor::builder("get_workflow_status")
            .description("Report a plan's status and the operations it allows next.")
            .param(plan_id_param())
            .build();
        Self {
            workflow,
            descriptor,
        }
    }
}

#[async_trait]
impl LocalTool for WorkflowStatusTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> ResultEnvelope {
        match self.workflow.status(optional_str(&args, "plan_id")).await {
            Ok(plan) => ResultEnvelope::success(
                format!("Plan {} is {}.", plan.id, plan.status),
                plan.summary(),
            ),
            Err(e) => error_envelope(e),
        }
    }
}
