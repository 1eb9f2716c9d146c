//! Descriptor → function-calling schema, and call validation

use labrelay_agent::{from_model_call, to_model_tool, Guidance};
use labrelay_mcp::{ParamSpec, ParamType, ToolDescriptor};
use labrelay_provider::ToolCall;
use serde_json::{json, Value};

fn add_instance() -> ToolDescriptor {
    ToolDescriptor::builder("add_instance")
        .description("Place one component")
        .param(ParamSpec::string("design_uri").required().describe("Open design"))
        .param(ParamSpec::string("component_cell").required())
        .param(ParamSpec::number("x").default_value(json!(0)))
        .param(ParamSpec::number("y").default_value(json!(0)))
        .param(ParamSpec::integer("angle").one_of([json!(0), json!(90), json!(180), json!(270)]))
        .param(ParamSpec::array("parameters", ParamType::String))
        .param(ParamSpec::new("extra", ParamType::Any))
        .build()
}

fn call(arguments: Value) -> ToolCall {
    ToolCall {
        id: "call_1".to_string(),
        name: "add_instance".to_string(),
        arguments,
    }
}

// ===== to_model_tool =====

#[test]
fn test_model_schema_preserves_declarations() {
    let tool = to_model_tool(&add_instance(), None);
    assert_eq!(tool.name(), "add_instance");
    assert_eq!(tool.function.description, "Place one component");

    let params = &tool.function.parameters;
    assert_eq!(params["type"], "object");
    assert_eq!(params["required"], json!(["design_uri", "component_cell"]));
    assert_eq!(params["properties"]["design_uri"]["type"], "string");
    assert_eq!(params["properties"]["design_uri"]["description"], "Open design");
    assert_eq!(params["properties"]["x"]["default"], json!(0));
    assert_eq!(params["properties"]["angle"]["enum"], json!([0, 90, 180, 270]));
    assert_eq!(params["properties"]["parameters"]["items"], json!({"type": "string"}));
    assert!(params["properties"]["extra"].get("type").is_none());
}

#[test]
fn test_guidance_lands_in_description_only() {
    let descriptor = ToolDescriptor::builder("add_components_from_plan")
        .description("Place the plan")
        .build();
    let tool = to_model_tool(&descriptor, Some(&Guidance::builtin()));
    assert!(tool.function.description.starts_with("Place the plan"));
    assert!(tool.function.description.contains("IMPORTANT CONSTRAINTS"));
    assert_eq!(descriptor.description, "Place the plan");
}

// ===== from_model_call =====

#[test]
fn test_valid_call_round_trips_untouched() {
    let args = json!({
        "design_uri": "demo_lib:lna:schematic",
        "component_cell": "R",
        "x": 12.5,
        "angle": 90,
        "extra": [1, "two"]
    });
    let validated = from_model_call(&add_instance(), &call(args.clone())).unwrap();
    assert_eq!(validated, args);
}

#[test]
fn test_missing_required_field_is_named() {
    let err = from_model_call(&add_instance(), &call(json!({"design_uri": "x:y:schematic"})))
        .unwrap_err();
    assert_eq!(err.missing, vec!["component_cell".to_string()]);
    assert!(err.to_string().contains("component_cell"));
}

#[test]
fn test_null_counts_as_missing() {
    let err = from_model_call(
        &add_instance(),
        &call(json!({"design_uri": null, "component_cell": "R"})),
    )
    .unwrap_err();
    assert_eq!(err.fields(), vec!["design_uri"]);
}

#[test]
fn test_wrong_type_is_not_coerced() {
    let err = from_model_call(
        &add_instance(),
        &call(json!({"design_uri": "a:b:schematic", "component_cell": "R", "x": "12"})),
    )
    .unwrap_err();
    assert!(err.missing.is_empty());
    assert_eq!(err.invalid[0].0, "x");
}

#[test]
fn test_enum_violation() {
    let err = from_model_call(
        &add_instance(),
        &call(json!({"design_uri": "a:b:schematic", "component_cell": "R", "angle": 45})),
    )
    .unwrap_err();
    assert_eq!(err.fields(), vec!["angle"]);
}

#[test]
fn test_non_object_arguments_rejected() {
    let err = from_model_call(&add_instance(), &call(json!("R at 0,0"))).unwrap_err();
    assert_eq!(err.fields(), vec!["arguments"]);
}

#[test]
fn test_null_arguments_for_parameterless_tool() {
    let descriptor = ToolDescriptor::builder("get_current_design").build();
    let validated = from_model_call(&descriptor, &call(Value::Null)).unwrap();
    assert_eq!(validated, json!({}));
}
