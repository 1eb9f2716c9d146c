//! Subprocess transport against a scripted `/bin/sh` tool server

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use labrelay_mcp::transport::StdioTransport;
use labrelay_mcp::{ClientManager, EnvelopeStatus, McpError, Transport};
use serde_json::json;
use tempfile::TempDir;

/// Answers initialize, tools/list and tools/call; logs one line to stderr.
/// With CRASH_MARKER set, the first tools/call kills the server instead.
const FAKE_SERVER: &str = r#"
echo "fake server ready" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake"},"capabilities":{}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      if [ -n "$CRASH_MARKER" ] && [ ! -f "$CRASH_MARKER" ]; then
        touch "$CRASH_MARKER"
        exit 0
      fi
      printf 'not json at all\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;

fn fake_server(env: BTreeMap<String, String>) -> StdioTransport {
    StdioTransport::new(
        "fake",
        "/bin/sh",
        vec!["-c".to_string(), FAKE_SERVER.to_string()],
        env,
    )
}

// ===== Lifecycle =====

#[tokio::test]
async fn test_handshake_list_and_call() {
    let transport = fake_server(BTreeMap::new());
    transport.connect().await.unwrap();
    assert!(transport.is_connected());

    let tools = transport.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert!(tools[0].param("text").unwrap().required);

    let output = transport.invoke("echo", json!({"text": "ping"})).await.unwrap();
    assert_eq!(output.joined_text(), "pong");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_close_reaps_child() {
    let transport = fake_server(BTreeMap::new());
    transport.connect().await.unwrap();
    assert!(transport.child_id().await.is_some());

    transport.close().await.unwrap();
    assert!(!transport.is_connected());
    assert!(transport.child_id().await.is_none());

    let result = transport.invoke("echo", json!({"text": "late"})).await;
    assert!(matches!(result, Err(McpError::Disconnected(_))));
}

#[tokio::test]
async fn test_notifications_are_broadcast() {
    let transport = fake_server(BTreeMap::new());
    let mut pushes = transport.subscribe().unwrap();
    transport.connect().await.unwrap();
    transport.list_tools().await.unwrap();

    let note = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.provider, "fake");
    assert_eq!(note.method, "notifications/message");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_command_is_connection_error() {
    let transport = StdioTransport::new(
        "ghost",
        "/definitely/not/a/binary",
        Vec::new(),
        BTreeMap::new(),
    );
    assert!(matches!(transport.connect().await, Err(McpError::Connection(_))));
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_child_outlives_the_thread_that_connected_it() {
    let transport = Arc::new(fake_server(BTreeMap::new()));
    let handle = tokio::runtime::Handle::current();

    let connecting = Arc::clone(&transport);
    std::thread::spawn(move || handle.block_on(connecting.connect()))
        .join()
        .unwrap()
        .unwrap();

    // the connecting thread is gone; its exit must not signal the child
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(transport.is_connected());
    let output = transport.invoke("echo", json!({"text": "ping"})).await.unwrap();
    assert_eq!(output.joined_text(), "pong");

    transport.close().await.unwrap();
}

// ===== Crash and reconnect =====

#[tokio::test]
async fn test_child_exit_surfaces_disconnect() {
    let dir = TempDir::new().unwrap();
    let mut env = BTreeMap::new();
    env.insert(
        "CRASH_MARKER".to_string(),
        dir.path().join("crashed").display().to_string(),
    );

    let transport = fake_server(env);
    transport.connect().await.unwrap();

    let result = transport.invoke("echo", json!({"text": "boom"})).await;
    assert!(matches!(result, Err(McpError::Disconnected(_))));
    assert!(!transport.is_connected());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_manager_reconnects_once_after_crash() {
    let dir = TempDir::new().unwrap();
    let mut env = BTreeMap::new();
    env.insert(
        "CRASH_MARKER".to_string(),
        dir.path().join("crashed").display().to_string(),
    );

    let mut manager = ClientManager::new();
    manager
        .add_provider("fake", Arc::new(fake_server(env)), Duration::from_secs(10))
        .unwrap();
    manager.connect_all().await.unwrap();

    let envelope = manager.call_tool("echo", json!({"text": "again"})).await;
    assert_eq!(envelope.status, EnvelopeStatus::Success);
    assert_eq!(envelope.summary, "pong");
    assert!(dir.path().join("crashed").exists());

    manager.shutdown().await;
}
