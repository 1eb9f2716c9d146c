//! Per-tool reshaping of raw results into summary and instruction

use std::sync::OnceLock;

use labrelay_mcp::{EnvelopeStatus, ResultEnvelope};
use regex::Regex;
use serde_json::{json, Value};

/// How a tool's result is post-processed
#[derive(Debug, Clone, Copy)]
pub enum WrapRule {
    PlanProposal,
    PlanExecution,
    Population,
    Discovery(&'static [Scenario]),
    Generic,
}

/// One discovery outcome: when it applies, what to tell the user and the model
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub applies: fn(&Value) -> bool,
    pub summary: fn(&Value) -> String,
    pub instruction: fn(&Value) -> String,
}

const CURRENT_DESIGN: &[Scenario] = &[
    Scenario {
        name: "existing_design",
        applies: |data| open_design(data).is_some(),
        summary: |data| format!("Design {} is open.", open_design(data).unwrap_or_default()),
        instruction: |data| {
            format!(
                "Work directly on {} and pass it as design_uri. Do not create a new cell or plan.",
                open_design(data).unwrap_or_default()
            )
        },
    },
    Scenario {
        name: "no_design",
        applies: |_| true,
        summary: |_| "No design is open.".to_string(),
        instruction: |_| {
            "Ask the user whether to open an existing design or create a new one with \
             plan_circuit. Do not create anything before they answer."
                .to_string()
        },
    },
];

const PROJECT_STRUCTURE: &[Scenario] = &[
    Scenario {
        name: "libraries",
        applies: |data| !library_names(data).is_empty(),
        summary: |data| {
            let names = library_names(data);
            format!("Project has {} libraries: {}.", names.len(), preview(&names, 5))
        },
        instruction: |_| {
            "Use one of these library names with list_cells or check_cell_exists. Never guess \
             library names."
                .to_string()
        },
    },
    Scenario {
        name: "no_libraries",
        applies: |_| true,
        summary: |_| "No libraries found in the project.".to_string(),
        instruction: |_| {
            "Ask the user to open a workspace with a writable library before designing.".to_string()
        },
    },
];

const RULES: &[(&str, WrapRule)] = &[
    ("plan_circuit", WrapRule::PlanProposal),
    ("execute_circuit_plan", WrapRule::PlanExecution),
    ("add_components_from_plan", WrapRule::Population),
    ("get_current_design", WrapRule::Discovery(CURRENT_DESIGN)),
    ("get_project_structure", WrapRule::Discovery(PROJECT_STRUCTURE)),
];

pub fn rule_for(tool: &str) -> WrapRule {
    RULES
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, rule)| *rule)
        .unwrap_or(WrapRule::Generic)
}

fn library_not_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\blibrary\b(?:\s+['"](?P<name>[^'"]+)['"])?.*?\bnot\s+open\b"#)
            .expect("static pattern")
    })
}

fn cell_not_found() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bcell\b(?:\s+['"](?P<name>[^'"]+)['"])?.*?\bnot\s+found\b"#)
            .expect("static pattern")
    })
}

/// The object carrying a result's data: a nested `data` object or the payload itself
fn data_of(payload: &Value) -> &Value {
    match payload.get("data") {
        Some(data) if data.is_object() => data,
        _ => payload,
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty() && *s != "None")
}

fn open_design(data: &Value) -> Option<String> {
    str_field(data, &["design_uri", "uri"]).map(str::to_string)
}

fn library_names(data: &Value) -> Vec<String> {
    data.get("libraries")
        .and_then(|l| l.as_array())
        .map(|libs| {
            libs.iter()
                .filter_map(|lib| lib.as_str().or_else(|| lib.get("name").and_then(|n| n.as_str())))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn preview(names: &[String], limit: usize) -> String {
    let shown = names.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if names.len() > limit {
        format!("{} and {} more", shown, names.len() - limit)
    } else {
        shown
    }
}

/// Failure reported inside an otherwise delivered result
fn embedded_error(payload: &Value) -> Option<(EnvelopeStatus, String)> {
    let message = |v: &Value, fallback: &str| {
        str_field(v, &["message", "error"])
            .unwrap_or(fallback)
            .to_string()
    };

    if payload.get("status").and_then(|s| s.as_str()) == Some("error") {
        return Some((EnvelopeStatus::Error, message(payload, "Unknown error")));
    }
    if payload.get("success").and_then(|s| s.as_bool()) == Some(false) {
        return Some((EnvelopeStatus::Failed, message(payload, "Unknown error")));
    }
    if let Some(data) = payload.get("data").filter(|d| d.is_object()) {
        if data.get("status").and_then(|s| s.as_str()) == Some("error") {
            return Some((EnvelopeStatus::Error, message(data, "Unknown error")));
        }
        if let Some(error) = str_field(data, &["error"]) {
            return Some((EnvelopeStatus::Error, error.to_string()));
        }
    }
    None
}

/// Table-driven post-processing of tool results
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultWrapper;

impl ResultWrapper {
    pub fn new() -> Self {
        Self
    }

    pub fn wrap(&self, tool: &str, args: &Value, envelope: ResultEnvelope) -> ResultEnvelope {
        // refusals and transport failures arrive already shaped
        if envelope.status == EnvelopeStatus::Blocked || envelope.payload.get("error_kind").is_some() {
            return envelope;
        }
        if envelope.status == EnvelopeStatus::Error {
            let message = envelope.summary.clone();
            return with_hint(EnvelopeStatus::Error, &message, args, envelope);
        }

        let rule = rule_for(tool);
        if !matches!(rule, WrapRule::Population) {
            if let Some((status, message)) = embedded_error(&envelope.payload) {
                return with_hint(status, &message, args, envelope);
            }
        }

        match rule {
            WrapRule::PlanProposal => proposal(envelope),
            WrapRule::PlanExecution => execution(envelope),
            WrapRule::Population => population(envelope),
            WrapRule::Discovery(scenarios) => discovery(scenarios, envelope),
            WrapRule::Generic => generic(envelope),
        }
    }
}

fn with_hint(
    status: EnvelopeStatus,
    message: &str,
    args: &Value,
    envelope: ResultEnvelope,
) -> ResultEnvelope {
    let arg = |keys: &[&str]| str_field(args, keys).unwrap_or("unknown").to_string();

    let (summary, instruction) = if let Some(caps) = library_not_open().captures(message) {
        let library = caps
            .name("name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| arg(&["library_name", "lib_name", "library"]));
        (
            format!("Library '{}' is not open.", library),
            "Call get_project_structure to see the open libraries and use one of them, or \
             create a new design in an open library."
                .to_string(),
        )
    } else if let Some(caps) = cell_not_found().captures(message) {
        let cell = caps
            .name("name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| arg(&["cell_name", "component_cell", "cell"]));
        (
            format!("Cell '{}' does not exist.", cell),
            "Call list_cells with a library name to see the existing cells, or create a new cell."
                .to_string(),
        )
    } else {
        let instruction = envelope
            .instruction
            .clone()
            .unwrap_or_else(|| "Review the error and try a different approach.".to_string());
        (format!("Error: {}", message), instruction)
    };

    ResultEnvelope {
        status,
        summary,
        instruction: Some(instruction),
        payload: envelope.payload,
    }
}

fn proposal(envelope: ResultEnvelope) -> ResultEnvelope {
    let data = data_of(&envelope.payload);
    let plan_id = str_field(data, &["plan_id"]).unwrap_or("unknown").to_string();
    let steps = data.get("step_count").and_then(|s| s.as_u64()).unwrap_or(0);
    let target = str_field(data, &["design_uri"]).unwrap_or("the target library").to_string();

    ResultEnvelope::new(
        EnvelopeStatus::NeedsConfirmation,
        format!("Circuit plan {} generated: {} steps into {}.", plan_id, steps, target),
    )
    .with_instruction(format!(
        "Plan ID: {}. PAUSED: show the plan to the user and wait for confirmation. Do NOT call \
         execute_circuit_plan or any other tool until the user confirms.",
        plan_id
    ))
    .with_payload(envelope.payload)
}

fn execution(envelope: ResultEnvelope) -> ResultEnvelope {
    let data = data_of(&envelope.payload);
    let uri = str_field(data, &["design_uri", "uri"]).unwrap_or("unknown").to_string();
    let summary = if data.get("created").and_then(|c| c.as_bool()) == Some(false) {
        format!("Schematic {} was already created for this plan.", uri)
    } else {
        format!("Schematic created: {}.", uri)
    };

    ResultEnvelope::new(EnvelopeStatus::Success, summary)
        .with_instruction(format!(
            "STOP and wait for the user to open {} in the design tool. Call \
             add_components_from_plan only after they confirm it is open.",
            uri
        ))
        .with_payload(envelope.payload)
}

fn population(envelope: ResultEnvelope) -> ResultEnvelope {
    let data = data_of(&envelope.payload);
    let uri = str_field(data, &["design_uri"]).unwrap_or("the design").to_string();
    let placed = data.get("placed").and_then(|p| p.as_u64()).unwrap_or(0);
    let failed = data.get("failed").and_then(|f| f.as_u64()).unwrap_or(0);
    let success = data
        .get("success")
        .and_then(|s| s.as_bool())
        .unwrap_or(failed == 0);

    let (status, summary, instruction) = if success {
        (
            EnvelopeStatus::Success,
            format!("Added {} elements to {}.", placed, uri),
            "Task completed. Do NOT call more tools unless the user gives new instructions."
                .to_string(),
        )
    } else if placed > 0 {
        (
            EnvelopeStatus::Partial,
            format!("Added {} elements to {}; {} failed.", placed, uri, failed),
            "Report the failed steps to the user. Do not retry the whole plan.".to_string(),
        )
    } else {
        (
            EnvelopeStatus::Failed,
            format!("No element could be added to {}.", uri),
            "Report the failures to the user and propose a corrected plan if they want one."
                .to_string(),
        )
    };

    ResultEnvelope::new(status, summary)
        .with_instruction(instruction)
        .with_payload(envelope.payload)
}

fn discovery(scenarios: &[Scenario], envelope: ResultEnvelope) -> ResultEnvelope {
    let data = data_of(&envelope.payload).clone();
    match scenarios.iter().find(|s| (s.applies)(&data)) {
        Some(scenario) => ResultEnvelope::new(EnvelopeStatus::Success, (scenario.summary)(&data))
            .with_instruction((scenario.instruction)(&data))
            .with_payload(json!({ "scenario": scenario.name, "result": envelope.payload })),
        None => envelope,
    }
}

fn generic(envelope: ResultEnvelope) -> ResultEnvelope {
    let raw = envelope.summary.trim_start();
    // only summaries that are the raw JSON body get replaced
    if !envelope.payload.is_object() || !(raw.starts_with('{') || raw.is_empty()) {
        return envelope;
    }
    let data = data_of(&envelope.payload);
    let summary = if let Some(uri) = str_field(data, &["uri"]) {
        format!("Operation completed. URI: {}", uri)
    } else if let Some(uri) = str_field(data, &["design_uri"]) {
        format!("Design ready: {}", uri)
    } else if let Some(message) = str_field(data, &["message", "summary"]) {
        message.to_string()
    } else {
        "Operation completed successfully.".to_string()
    };
    ResultEnvelope {
        summary,
        ..envelope
    }
}
