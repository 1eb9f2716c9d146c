//! Tests for Config defaults, serialization and persistence

use labrelay_config::{
    CatalogPolicy, Config, ConfigError, ControlConfig, GuidanceKind, ToolServerConfig,
    TransportKind,
};
use tempfile::TempDir;

/// Helper to create a temporary directory for tests
fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

// ===== Defaults =====

#[test]
fn test_config_defaults() {
    let config = Config::default();

    assert_eq!(config.agent.workspace, "~/.labrelay/bench");
    assert_eq!(config.agent.model, "qwen3-8b-finetuned");
    assert_eq!(config.agent.max_turns, 20);
    assert_eq!(config.agent.session_max_messages, 100);
    assert_eq!(
        config.model.api_base.as_deref(),
        Some("http://127.0.0.1:1234/v1")
    );
    assert!(config.model.api_key.is_empty());
    assert!(config.tool_servers.is_empty());
    assert_eq!(config.plan.catalog_policy, CatalogPolicy::Strict);
}

#[test]
fn test_control_defaults() {
    let control = ControlConfig::default();

    assert_eq!(control.max_total_calls, 15);
    assert_eq!(control.max_calls_per_tool, 5);
    assert_eq!(control.loop_threshold, 3);
    assert!(control
        .termination_actions
        .contains(&"add_components_from_plan".to_string()));
    assert!(control
        .termination_actions
        .contains(&"save_current_design".to_string()));
    assert!(control
        .confirmation_required
        .contains(&"execute_circuit_plan".to_string()));
    assert!(control.confirmation_phrases.contains(&"confirm".to_string()));
}

#[test]
fn test_tool_server_defaults_timeout() {
    let server = ToolServerConfig::subprocess("laser", "python", vec!["laser.py".into()]);
    assert_eq!(server.call_timeout_secs, 300);
    assert!(server.enabled);
    assert_eq!(server.transport, TransportKind::Subprocess);
}

// ===== Deserialization =====

#[test]
fn test_partial_json_fills_defaults() {
    let json = r#"{ "agent": { "model": "local/model" } }"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.agent.model, "local/model");
    assert_eq!(config.agent.max_turns, 20);
    assert_eq!(config.control.max_total_calls, 15);
}

#[test]
fn test_tool_servers_parse() {
    let json = r#"{
        "tool_servers": [
            { "name": "ads", "transport": "subprocess", "command": "python", "args": ["ads_server.py"] },
            { "name": "search", "transport": "endpoint", "url": "http://localhost:9000/mcp", "call_timeout_secs": 30 },
            { "name": "laser", "transport": "stream", "url": "http://localhost:9100" }
        ]
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.tool_servers.len(), 3);
    assert_eq!(config.tool_servers[0].transport, TransportKind::Subprocess);
    assert_eq!(config.tool_servers[0].args, vec!["ads_server.py".to_string()]);
    assert_eq!(config.tool_servers[1].transport, TransportKind::Endpoint);
    assert_eq!(config.tool_servers[1].call_timeout_secs, 30);
    assert_eq!(config.tool_servers[2].transport, TransportKind::Stream);
    assert!(config.validate().is_ok());
}

#[test]
fn test_unknown_transport_rejected() {
    let json = r#"{ "tool_servers": [ { "name": "x", "transport": "carrier-pigeon" } ] }"#;
    let result: Result<Config, _> = serde_json::from_str(json);
    assert!(result.is_err());
}

#[test]
fn test_guidance_entries_parse() {
    let json = r#"{ "guidance": [ { "tool": "search", "kind": "warning", "text": "search once" } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.guidance.len(), 1);
    assert_eq!(config.guidance[0].kind, GuidanceKind::Warning);
}

#[test]
fn test_transport_kind_display() {
    assert_eq!(TransportKind::Subprocess.to_string(), "subprocess");
    assert_eq!(TransportKind::Stream.to_string(), "stream");
    assert_eq!(TransportKind::Endpoint.to_string(), "endpoint");
}

// ===== Persistence =====

#[tokio::test]
async fn test_load_missing_file_returns_default() {
    let dir = temp_dir();
    let config = Config::load_from(&dir.path().join("absent.json"))
        .await
        .unwrap();
    assert_eq!(config.agent.model, "qwen3-8b-finetuned");
}

#[tokio::test]
async fn test_save_and_load_roundtrip() {
    let dir = temp_dir();
    let path = dir.path().join("nested").join("config.json");

    let mut config = Config::default();
    config.agent.model = "custom/model".to_string();
    config.control.max_calls_per_tool = 2;
    config.tool_servers.push(ToolServerConfig::remote(
        "search",
        TransportKind::Endpoint,
        "https://tools.example/mcp",
    ));
    config.save_to(&path).await.unwrap();

    let loaded = Config::load_from(&path).await.unwrap();
    assert_eq!(loaded.agent.model, "custom/model");
    assert_eq!(loaded.control.max_calls_per_tool, 2);
    assert_eq!(loaded.tool_servers.len(), 1);
    assert_eq!(
        loaded.tool_servers[0].url.as_deref(),
        Some("https://tools.example/mcp")
    );
}

#[tokio::test]
async fn test_load_invalid_json_errors() {
    let dir = temp_dir();
    let path = dir.path().join("config.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();

    let result = Config::load_from(&path).await;
    assert!(matches!(result, Err(ConfigError::Json(_))));
}

// ===== Accessors =====

#[test]
fn test_api_key_blank_is_none() {
    let mut config = Config::default();
    assert!(config.api_key().is_none());

    config.model.api_key = "   ".to_string();
    assert!(config.api_key().is_none());

    config.model.api_key = "sk-local".to_string();
    assert_eq!(config.api_key().as_deref(), Some("sk-local"));
}

#[test]
fn test_has_model_endpoint_with_local_base() {
    let mut config = Config::default();
    assert!(config.has_model_endpoint());

    config.model.api_base = None;
    assert!(!config.has_model_endpoint());
}

#[test]
fn test_plans_path_override() {
    let mut config = Config::default();
    assert!(config.plans_path().ends_with("plans/plans.json"));

    config.plan.store_path = Some("/tmp/relay/plans.json".to_string());
    assert_eq!(
        config.plans_path(),
        std::path::PathBuf::from("/tmp/relay/plans.json")
    );
}

#[test]
fn test_active_tool_servers_skips_disabled() {
    let mut config = Config::default();
    let mut disabled = ToolServerConfig::subprocess("old", "old-server", vec![]);
    disabled.enabled = false;
    config.tool_servers.push(disabled);
    config
        .tool_servers
        .push(ToolServerConfig::subprocess("new", "new-server", vec![]));

    let active = config.active_tool_servers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "new");
}

// ===== Errors =====

#[test]
fn test_error_display() {
    let err = ConfigError::Invalid("bad value".to_string());
    assert_eq!(err.to_string(), "◆ BENCHSHEET INVALID: bad value");

    let err = ConfigError::NotFound("/some/path".into());
    assert!(err.to_string().contains("/some/path"));
}
