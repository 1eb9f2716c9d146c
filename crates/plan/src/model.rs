//! Plan records as persisted in the store

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PlanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    PendingConfirmation,
    SchematicCreated,
    ComponentsAdded,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::PendingConfirmation => "pending_confirmation",
            PlanStatus::SchematicCreated => "schematic_created",
            PlanStatus::ComponentsAdded => "components_added",
            PlanStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PlanStatus::PendingConfirmation => 0,
            PlanStatus::SchematicCreated => 1,
            PlanStatus::ComponentsAdded => 2,
            PlanStatus::Failed => 3,
        }
    }

    /// Forward moves, same-status re-entry, or failure; `failed` is terminal
    pub fn can_move_to(&self, next: PlanStatus) -> bool {
        match (self, next) {
            (PlanStatus::Failed, _) => false,
            (_, PlanStatus::Failed) => true,
            (current, next) => next.rank() >= current.rank(),
        }
    }

    /// Whether the empty target resource exists
    pub fn is_executed(&self) -> bool {
        matches!(
            self,
            PlanStatus::SchematicCreated | PlanStatus::ComponentsAdded
        )
    }

    /// Operations that make sense next
    pub fn next_operations(&self) -> &'static [&'static str] {
        match self {
            PlanStatus::PendingConfirmation => &["execute_circuit_plan", "plan_circuit"],
            PlanStatus::SchematicCreated => &["add_components_from_plan", "get_current_design"],
            PlanStatus::ComponentsAdded => &["save_current_design", "plan_circuit"],
            PlanStatus::Failed => &["plan_circuit"],
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the plan's design lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub library: String,
    pub cell: String,
    pub uri: String,
}

impl Target {
    pub fn new(library: impl Into<String>, cell: impl Into<String>) -> Self {
        let library = library.into();
        let cell = cell.into();
        let uri = format!("{}:{}:schematic", library, cell);
        Self { library, cell, uri }
    }
}

/// One unit of design content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Instance {
        #[serde(rename = "type")]
        element: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        angle: Option<f64>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, Value>,
    },
    Wire {
        points: Vec<[f64; 2]>,
    },
}

impl Step {
    pub fn instance(element: impl Into<String>, name: impl Into<String>, x: f64, y: f64) -> Self {
        Step::Instance {
            element: element.into(),
            name: name.into(),
            x,
            y,
            angle: None,
            params: BTreeMap::new(),
        }
    }

    /// Parse the loose shape models emit: `{type, name, x, y, angle?, ...params}`
    /// or `{points: [[x, y], ...]}`
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PlanError::Invalid(format!("step is not an object: {}", value)))?;

        if let Some(points) = obj.get("points") {
            let points: Vec<[f64; 2]> = serde_json::from_value(points.clone())
                .map_err(|e| PlanError::Invalid(format!("wire points: {}", e)))?;
            if points.len() < 2 {
                return Err(PlanError::Invalid("a wire needs at least two points".to_string()));
            }
            return Ok(Step::Wire { points });
        }

        let element = obj
            .get("type")
            .or_else(|| obj.get("element"))
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PlanError::Invalid(format!("step without a type: {}", value)))?
            .trim()
            .to_string();

        let coordinate = |key: &str| -> Result<f64> {
            match obj.get(key) {
                None | Some(Value::Null) => Ok(0.0),
                Some(v) => v
                    .as_f64()
                    .ok_or_else(|| PlanError::Invalid(format!("{} of {} is not a number", key, element))),
            }
        };
        let x = coordinate("x")?;
        let y = coordinate("y")?;
        let angle = obj.get("angle").and_then(|a| a.as_f64());

        let mut params: BTreeMap<String, Value> = obj
            .get("params")
            .or_else(|| obj.get("parameters"))
            .and_then(|p| p.as_object())
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for (key, v) in obj {
            let reserved = [
                "type", "element", "kind", "name", "x", "y", "angle", "params", "parameters",
            ];
            if !reserved.contains(&key.as_str()) {
                params.insert(key.clone(), v.clone());
            }
        }

        Ok(Step::Instance {
            element,
            name: obj
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            x,
            y,
            angle,
            params,
        })
    }

    pub fn label(&self) -> String {
        match self {
            Step::Instance { element, name, .. } if name.is_empty() => element.clone(),
            Step::Instance { element, name, .. } => format!("{} ({})", name, element),
            Step::Wire { points } => format!("wire with {} points", points.len()),
        }
    }
}

/// Outcome of one populated step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub label: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    pub status: PlanStatus,
    pub target: Target,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// Creation order across the whole store
    pub sequence: u64,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Plan {
    pub fn transition(&mut self, next: PlanStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            return Err(PlanError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Local::now();
        Ok(())
    }

    pub fn succeeded_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.success).count()
    }

    /// Compact JSON view for tool results
    pub fn summary(&self) -> Value {
        let mut view = Map::new();
        view.insert("plan_id".into(), Value::from(self.id.clone()));
        view.insert("name".into(), Value::from(self.name.clone()));
        view.insert("status".into(), Value::from(self.status.as_str()));
        view.insert("design_uri".into(), Value::from(self.target.uri.clone()));
        view.insert("library".into(), Value::from(self.target.library.clone()));
        view.insert("step_count".into(), Value::from(self.steps.len()));
        if !self.step_results.is_empty() {
            view.insert("steps_placed".into(), Value::from(self.succeeded_steps()));
        }
        if let Some(error) = &self.last_error {
            view.insert("last_error".into(), Value::from(error.clone()));
        }
        view.insert(
            "next_operations".into(),
            Value::from(self.status.next_operations().to_vec()),
        );
        Value::Object(view)
    }
}
