//! Design operations and the tool calls behind them

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use labrelay_mcp::{ToolCaller, ToolOutput};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{BackendError, PlanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DesignOp {
    ListLibraries,
    CurrentDesign,
    CreateDesign,
    AddElement,
    AddWire,
    SaveDesign,
}

impl DesignOp {
    pub const ALL: [DesignOp; 6] = [
        DesignOp::ListLibraries,
        DesignOp::CurrentDesign,
        DesignOp::CreateDesign,
        DesignOp::AddElement,
        DesignOp::AddWire,
        DesignOp::SaveDesign,
    ];

    /// Name used in configuration overrides
    pub fn key(&self) -> &'static str {
        match self {
            DesignOp::ListLibraries => "list_libraries",
            DesignOp::CurrentDesign => "current_design",
            DesignOp::CreateDesign => "create_design",
            DesignOp::AddElement => "add_element",
            DesignOp::AddWire => "add_wire",
            DesignOp::SaveDesign => "save_design",
        }
    }

    pub fn default_tool(&self) -> &'static str {
        match self {
            DesignOp::ListLibraries => "list_libraries",
            DesignOp::CurrentDesign => "get_current_design",
            DesignOp::CreateDesign => "create_schematic",
            DesignOp::AddElement => "add_instance",
            DesignOp::AddWire => "add_wire",
            DesignOp::SaveDesign => "save_design",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.key() == key)
    }
}

/// Total mapping from design operation to tool name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignOpTable {
    tools: BTreeMap<DesignOp, String>,
}

impl Default for DesignOpTable {
    fn default() -> Self {
        Self {
            tools: DesignOp::ALL
                .into_iter()
                .map(|op| (op, op.default_tool().to_string()))
                .collect(),
        }
    }
}

impl DesignOpTable {
    /// Defaults with configured overrides; unknown operation keys are rejected
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut table = Self::default();
        for (key, tool) in overrides {
            let op = DesignOp::from_key(key)
                .ok_or_else(|| PlanError::UnknownOperation(key.clone()))?;
            table.tools.insert(op, tool.clone());
        }
        Ok(table)
    }

    pub fn tool(&self, op: DesignOp) -> &str {
        self.tools
            .get(&op)
            .map(String::as_str)
            .unwrap_or_else(|| op.default_tool())
    }

    /// Operations whose tool no connected provider offers
    pub fn verify(&self, caller: &dyn ToolCaller) -> Vec<(DesignOp, String)> {
        DesignOp::ALL
            .into_iter()
            .filter(|op| !caller.has_tool(self.tool(*op)))
            .map(|op| (op, self.tool(op).to_string()))
            .collect()
    }
}

/// One element to place in a design
#[derive(Debug, Clone, PartialEq)]
pub struct ElementPlacement {
    pub library: String,
    pub cell: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub angle: Option<f64>,
    pub params: BTreeMap<String, Value>,
}

/// What the workflow needs from the design tool
#[async_trait]
pub trait DesignBackend: Send + Sync {
    /// Writable libraries currently open
    async fn list_libraries(&self) -> std::result::Result<Vec<String>, BackendError>;

    async fn current_design(&self) -> std::result::Result<Option<String>, BackendError>;

    /// Create an empty design, returning its URI
    async fn create_design(
        &self,
        library: &str,
        cell: &str,
    ) -> std::result::Result<String, BackendError>;

    async fn add_element(
        &self,
        design_uri: &str,
        element: &ElementPlacement,
    ) -> std::result::Result<(), BackendError>;

    async fn add_wire(
        &self,
        design_uri: &str,
        points: &[[f64; 2]],
    ) -> std::result::Result<(), BackendError>;

    async fn save_design(&self, design_uri: &str) -> std::result::Result<(), BackendError>;
}

/// Design backend that calls tools through a [`ToolCaller`]
pub struct ToolDesignBackend {
    caller: Arc<dyn ToolCaller>,
    table: DesignOpTable,
}

impl ToolDesignBackend {
    pub fn new(caller: Arc<dyn ToolCaller>, table: DesignOpTable) -> Self {
        Self { caller, table }
    }

    pub fn table(&self) -> &DesignOpTable {
        &self.table
    }

    async fn run(&self, op: DesignOp, args: Value) -> std::result::Result<Value, BackendError> {
        let tool = self.table.tool(op);
        debug!("◆ DESIGN {:?} → {}", op, tool);
        let output = self
            .caller
            .call(tool, args)
            .await
            .map_err(|e| BackendError::Unavailable {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;
        interpret(op, &output)
    }
}

/// The tool's data object, or a rejection when the result reports failure
fn interpret(op: DesignOp, output: &ToolOutput) -> std::result::Result<Value, BackendError> {
    let payload = output.payload();
    let data = payload
        .get("data")
        .filter(|d| d.is_object())
        .cloned()
        .unwrap_or_else(|| payload.clone());

    if let Some(message) = failure_message(output.is_error, &payload, &data) {
        return Err(BackendError::Rejected { op, message });
    }
    Ok(data)
}

fn failure_message(is_error: bool, payload: &Value, data: &Value) -> Option<String> {
    let explicit = |v: &Value| {
        v.get("error")
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    };
    let flagged = |v: &Value| {
        v.get("status").and_then(|s| s.as_str()) == Some("error")
            || ["success", "created", "added", "saved"]
                .iter()
                .any(|key| v.get(*key).and_then(|b| b.as_bool()) == Some(false))
            || v.get("error").map_or(false, |e| !e.is_null())
    };

    if is_error || flagged(payload) || flagged(data) {
        let message = explicit(data)
            .or_else(|| explicit(payload))
            .or_else(|| payload.as_str().map(str::to_string))
            .unwrap_or_else(|| payload.to_string());
        return Some(message);
    }
    None
}

fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| data.get(*key))
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl DesignBackend for ToolDesignBackend {
    async fn list_libraries(&self) -> std::result::Result<Vec<String>, BackendError> {
        let data = self.run(DesignOp::ListLibraries, json!({})).await?;
        let libraries = data
            .get("libraries")
            .or(Some(&data))
            .and_then(|l| l.as_array())
            .ok_or_else(|| BackendError::Malformed {
                op: DesignOp::ListLibraries,
                message: format!("no library list in {}", data),
            })?;
        Ok(libraries
            .iter()
            .filter_map(|l| l.as_str().or_else(|| l.get("name").and_then(|n| n.as_str())))
            .map(str::to_string)
            .collect())
    }

    async fn current_design(&self) -> std::result::Result<Option<String>, BackendError> {
        let data = self.run(DesignOp::CurrentDesign, json!({})).await?;
        Ok(string_field(&data, &["design_uri", "uri"]))
    }

    async fn create_design(
        &self,
        library: &str,
        cell: &str,
    ) -> std::result::Result<String, BackendError> {
        let data = self
            .run(
                DesignOp::CreateDesign,
                json!({"lib_name": library, "cell_name": cell}),
            )
            .await?;
        Ok(string_field(&data, &["uri", "design_uri"])
            .unwrap_or_else(|| format!("{}:{}:schematic", library, cell)))
    }

    async fn add_element(
        &self,
        design_uri: &str,
        element: &ElementPlacement,
    ) -> std::result::Result<(), BackendError> {
        let mut args = Map::new();
        args.insert("design_uri".into(), json!(design_uri));
        args.insert("component_lib".into(), json!(element.library));
        args.insert("component_cell".into(), json!(element.cell));
        args.insert("x".into(), json!(element.x));
        args.insert("y".into(), json!(element.y));
        if !element.name.is_empty() {
            args.insert("name".into(), json!(element.name));
        }
        if let Some(angle) = element.angle {
            args.insert("angle".into(), json!(angle));
        }
        if !element.params.is_empty() {
            args.insert("parameters".into(), json!(element.params));
        }
        self.run(DesignOp::AddElement, Value::Object(args)).await?;
        Ok(())
    }

    async fn add_wire(
        &self,
        design_uri: &str,
        points: &[[f64; 2]],
    ) -> std::result::Result<(), BackendError> {
        self.run(
            DesignOp::AddWire,
            json!({"design_uri": design_uri, "points": points}),
        )
        .await?;
        Ok(())
    }

    async fn save_design(&self, design_uri: &str) -> std::result::Result<(), BackendError> {
        self.run(DesignOp::SaveDesign, json!({"design_uri": design_uri}))
            .await?;
        Ok(())
    }
}
