//! Conversion between tool descriptors and the model's function-calling form

use std::fmt;

use labrelay_mcp::{ParamType, ToolDescriptor};
use labrelay_provider::{Tool, ToolCall};
use serde_json::{json, Map, Value};

use crate::guidance::Guidance;

/// Arguments that do not fit the tool's declared parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaValidationError {
    pub tool: String,
    pub missing: Vec<String>,
    /// (parameter, reason)
    pub invalid: Vec<(String, String)>,
}

impl fmt::Display for SchemaValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "◆ ARGUMENTS REJECTED FOR {}", self.tool)?;
        if !self.missing.is_empty() {
            write!(f, "; missing: {}", self.missing.join(", "))?;
        }
        if !self.invalid.is_empty() {
            let invalid: Vec<String> = self
                .invalid
                .iter()
                .map(|(name, reason)| format!("{} ({})", name, reason))
                .collect();
            write!(f, "; invalid: {}", invalid.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaValidationError {}

impl SchemaValidationError {
    fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Every offending field name, missing first
    pub fn fields(&self) -> Vec<&str> {
        self.missing
            .iter()
            .map(String::as_str)
            .chain(self.invalid.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

/// Function-calling type for a declared parameter type
fn model_type(kind: ParamType) -> Option<&'static str> {
    match kind {
        ParamType::Any => None,
        other => Some(other.as_str()),
    }
}

/// Model-facing tool definition, with guidance folded into the description
pub fn to_model_tool(descriptor: &ToolDescriptor, guidance: Option<&Guidance>) -> Tool {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &descriptor.params {
        let mut schema = Map::new();
        if let Some(kind) = model_type(param.kind) {
            schema.insert("type".into(), json!(kind));
        }
        if let Some(description) = &param.description {
            schema.insert("description".into(), json!(description));
        }
        if let Some(default) = &param.default {
            schema.insert("default".into(), default.clone());
        }
        if !param.enum_values.is_empty() {
            schema.insert("enum".into(), Value::Array(param.enum_values.clone()));
        }
        if param.kind == ParamType::Array {
            let items = param
                .items
                .and_then(model_type)
                .map(|t| json!({ "type": t }))
                .unwrap_or_else(|| json!({}));
            schema.insert("items".into(), items);
        }
        properties.insert(param.name.clone(), Value::Object(schema));
        if param.required {
            required.push(param.name.clone());
        }
    }

    let description = match guidance {
        Some(guidance) => guidance.inject(&descriptor.name, &descriptor.description),
        None => descriptor.description.clone(),
    };

    Tool::new(
        &descriptor.name,
        description,
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    )
}

/// Check a model call against the descriptor; arguments pass through untouched
pub fn from_model_call(
    descriptor: &ToolDescriptor,
    call: &ToolCall,
) -> Result<Value, SchemaValidationError> {
    let mut error = SchemaValidationError::new(&descriptor.name);
    let args = match &call.arguments {
        Value::Null => Map::new(),
        Value::Object(args) => args.clone(),
        other => {
            error.invalid.push((
                "arguments".to_string(),
                format!("expected an object, got {}", json_kind(other)),
            ));
            return Err(error);
        }
    };

    for param in &descriptor.params {
        match args.get(&param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    error.missing.push(param.name.clone());
                }
            }
            Some(value) => {
                if !param.kind.accepts(value) {
                    error.invalid.push((
                        param.name.clone(),
                        format!("expected {}, got {}", param.kind.as_str(), json_kind(value)),
                    ));
                } else if !param.enum_values.is_empty() && !param.enum_values.contains(value) {
                    error
                        .invalid
                        .push((param.name.clone(), "not one of the allowed values".to_string()));
                }
            }
        }
    }

    if error.is_empty() {
        Ok(Value::Object(args))
    } else {
        Err(error)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
