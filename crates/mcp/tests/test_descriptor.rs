//! Tool descriptor parsing and declaration

use labrelay_mcp::{parse_tool_list, McpError, ParamSpec, ParamType, ToolDescriptor};
use serde_json::json;

// ===== Wire parsing =====

#[test]
fn test_from_wire_full_schema() {
    let tool = ToolDescriptor::from_wire(&json!({
        "name": "add_instance",
        "description": "Place a component",
        "inputSchema": {
            "type": "object",
            "properties": {
                "cell": {"type": "string", "description": "Cell name"},
                "x": {"type": "float", "default": 0.0},
                "rotation": {"type": "integer", "enum": [0, 90, 180, 270]},
                "params": {"type": "dict"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["cell"]
        }
    }))
    .unwrap();

    assert_eq!(tool.name, "add_instance");
    assert_eq!(tool.description, "Place a component");
    assert_eq!(tool.params.len(), 5);

    let cell = tool.param("cell").unwrap();
    assert!(cell.required);
    assert_eq!(cell.kind, ParamType::String);
    assert_eq!(cell.description.as_deref(), Some("Cell name"));

    let x = tool.param("x").unwrap();
    assert_eq!(x.kind, ParamType::Number);
    assert!(!x.required);
    assert_eq!(x.default, Some(json!(0.0)));

    assert_eq!(tool.param("rotation").unwrap().enum_values.len(), 4);
    assert_eq!(tool.param("params").unwrap().kind, ParamType::Object);
    assert_eq!(tool.param("tags").unwrap().items, Some(ParamType::String));

    let required: Vec<&str> = tool.required_params().map(|p| p.name.as_str()).collect();
    assert_eq!(required, vec!["cell"]);
}

#[test]
fn test_from_wire_without_schema() {
    let tool = ToolDescriptor::from_wire(&json!({"name": "save_design"})).unwrap();
    assert!(tool.params.is_empty());
    assert_eq!(tool.description, "");
}

#[test]
fn test_from_wire_untyped_param_is_any() {
    let tool = ToolDescriptor::from_wire(&json!({
        "name": "t",
        "inputSchema": {"type": "object", "properties": {"value": {"description": "anything"}}}
    }))
    .unwrap();
    assert_eq!(tool.param("value").unwrap().kind, ParamType::Any);
}

#[test]
fn test_from_wire_rejects_malformed() {
    assert!(matches!(
        ToolDescriptor::from_wire(&json!({"description": "nameless"})),
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        ToolDescriptor::from_wire(&json!({"name": "t", "inputSchema": "object"})),
        Err(McpError::Protocol(_))
    ));
    assert!(matches!(
        ToolDescriptor::from_wire(&json!({
            "name": "t",
            "inputSchema": {"properties": {"a": {"type": "tensor"}}}
        })),
        Err(McpError::Protocol(_))
    ));
}

// ===== Tool lists =====

#[test]
fn test_parse_tool_list_drops_only_bad_entries() {
    let (tools, rejected) = parse_tool_list(&json!({
        "tools": [
            {"name": "list_libraries"},
            {"name": "broken", "inputSchema": {"properties": {"a": {"type": 7}}}},
            {"name": "get_current_design"}
        ]
    }))
    .unwrap();

    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["list_libraries", "get_current_design"]);
    assert_eq!(rejected.len(), 1);
}

#[test]
fn test_parse_tool_list_requires_tools_array() {
    assert!(parse_tool_list(&json!({"items": []})).is_err());
}

// ===== Builder =====

#[test]
fn test_builder_and_wire_form() {
    let tool = ToolDescriptor::builder("plan_circuit")
        .description("Propose a circuit plan")
        .param(ParamSpec::string("name").required().describe("Plan name"))
        .param(ParamSpec::array("steps", ParamType::Object).required())
        .param(ParamSpec::string("library"))
        .build();

    let wire = tool.to_wire();
    assert_eq!(wire["name"], "plan_circuit");
    assert_eq!(wire["inputSchema"]["type"], "object");
    assert_eq!(wire["inputSchema"]["properties"]["name"]["description"], "Plan name");
    assert_eq!(wire["inputSchema"]["properties"]["steps"]["items"]["type"], "object");
    assert_eq!(wire["inputSchema"]["required"], json!(["name", "steps"]));

    let reparsed = ToolDescriptor::from_wire(&wire).unwrap();
    assert_eq!(reparsed.param("steps").unwrap().kind, ParamType::Array);
    assert!(reparsed.param("name").unwrap().required);
    assert!(!reparsed.param("library").unwrap().required);
}
