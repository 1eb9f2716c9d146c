//! Tool descriptors
//!
//! Local tools declare their shape through [`ToolDescriptor::builder`]; remote
//! tools are parsed from the `tools/list` wire form. Either way the result is
//! immutable once built.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{McpError, Result};

/// Parameter type as the tool declares it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Untyped or union-typed
    Any,
}

impl ParamType {
    /// Map a declared type name, including common aliases, to a parameter type
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Some(ParamType::String),
            "integer" | "int" => Some(ParamType::Integer),
            "number" | "float" | "double" => Some(ParamType::Number),
            "boolean" | "bool" => Some(ParamType::Boolean),
            "array" | "list" | "tuple" => Some(ParamType::Array),
            "object" | "dict" | "map" => Some(ParamType::Object),
            "any" => Some(ParamType::Any),
            _ => None,
        }
    }

    /// Function-calling type name
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }

    /// Whether a JSON value is acceptable for this type, without coercion
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ParamType>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: None,
            enum_values: Vec::new(),
            items: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Boolean)
    }

    pub fn array(name: impl Into<String>, items: ParamType) -> Self {
        Self {
            items: Some(items),
            ..Self::new(name, ParamType::Array)
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Object)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.enum_values = values.into_iter().collect();
        self
    }

    fn from_schema(name: &str, schema: &Value, required: bool) -> Result<Self> {
        let kind = match schema.get("type") {
            None | Some(Value::Null) => ParamType::Any,
            Some(Value::String(declared)) => ParamType::from_wire(declared).ok_or_else(|| {
                McpError::Protocol(format!("parameter '{}' has unknown type '{}'", name, declared))
            })?,
            // ["string", "null"] style unions collapse to their first concrete member
            Some(Value::Array(options)) => options
                .iter()
                .filter_map(|o| o.as_str())
                .filter(|o| *o != "null")
                .find_map(ParamType::from_wire)
                .unwrap_or(ParamType::Any),
            Some(other) => {
                return Err(McpError::Protocol(format!(
                    "parameter '{}' has malformed type {}",
                    name, other
                )))
            }
        };

        let items = schema
            .get("items")
            .and_then(|items| items.get("type"))
            .and_then(|t| t.as_str())
            .and_then(ParamType::from_wire);

        Ok(Self {
            name: name.to_string(),
            kind,
            required,
            default: schema.get("default").cloned(),
            description: schema
                .get("description")
                .and_then(|d| d.as_str())
                .map(|d| d.to_string()),
            enum_values: schema
                .get("enum")
                .and_then(|e| e.as_array())
                .cloned()
                .unwrap_or_default(),
            items,
        })
    }

    /// JSON-schema fragment for this parameter
    pub fn to_schema(&self) -> Value {
        let mut schema = Map::new();
        if self.kind != ParamType::Any {
            schema.insert("type".into(), json!(self.kind.as_str()));
        }
        if let Some(description) = &self.description {
            schema.insert("description".into(), json!(description));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.clone());
        }
        if !self.enum_values.is_empty() {
            schema.insert("enum".into(), Value::Array(self.enum_values.clone()));
        }
        if self.kind == ParamType::Array {
            let items = self.items.unwrap_or(ParamType::Any);
            schema.insert(
                "items".into(),
                if items == ParamType::Any {
                    json!({})
                } else {
                    json!({"type": items.as_str()})
                },
            );
        }
        Value::Object(schema)
    }
}

/// Name, description and parameters of one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolDescriptor {
    pub fn builder(name: impl Into<String>) -> ToolDescriptorBuilder {
        ToolDescriptorBuilder {
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
        }
    }

    /// Parse one entry of a `tools/list` result
    pub fn from_wire(value: &Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| McpError::Protocol("tool entry without a name".to_string()))?;

        let description = value
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string();

        let schema = match value.get("inputSchema") {
            None | Some(Value::Null) => return Ok(Self::builder(name).description(description).build()),
            Some(schema @ Value::Object(_)) => schema,
            Some(_) => {
                return Err(McpError::Protocol(format!(
                    "tool '{}' has a non-object input schema",
                    name
                )))
            }
        };

        let required: Vec<&str> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|n| n.as_str()).collect())
            .unwrap_or_default();

        let params = match schema.get("properties") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(properties)) => properties
                .iter()
                .map(|(param, spec)| ParamSpec::from_schema(param, spec, required.contains(&param.as_str())))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| match e {
                    McpError::Protocol(msg) => McpError::Protocol(format!("tool '{}': {}", name, msg)),
                    other => other,
                })?,
            Some(_) => {
                return Err(McpError::Protocol(format!(
                    "tool '{}' has non-object properties",
                    name
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            description,
            params,
        })
    }

    /// JSON-schema `object` describing all parameters
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.to_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Wire form as served in `tools/list`
    pub fn to_wire(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }
}

pub struct ToolDescriptorBuilder {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
}

impl ToolDescriptorBuilder {
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Add a parameter; a later spec with the same name replaces the earlier one
    pub fn param(mut self, spec: ParamSpec) -> Self {
        match self.params.iter_mut().find(|p| p.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.params.push(spec),
        }
        self
    }

    pub fn build(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name,
            description: self.description,
            params: self.params,
        }
    }
}

/// Parse a whole `tools/list` result, dropping malformed entries
///
/// Fails only when the result has no `tools` array at all.
pub fn parse_tool_list(result: &Value) -> Result<(Vec<ToolDescriptor>, Vec<McpError>)> {
    let entries = result
        .get("tools")
        .and_then(|t| t.as_array())
        .ok_or_else(|| McpError::Protocol("tools/list result has no tools array".to_string()))?;

    let mut tools = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();
    for entry in entries {
        match ToolDescriptor::from_wire(entry) {
            Ok(tool) => tools.push(tool),
            Err(e) => {
                warn!("◆ DROPPING TOOL: {}", e);
                rejected.push(e);
            }
        }
    }
    Ok((tools, rejected))
}
