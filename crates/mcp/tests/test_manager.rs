//! Client manager routing, degradation and call styles over fake transports

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use labrelay_config::TransportKind;
use labrelay_mcp::{
    ClientManager, EnvelopeStatus, McpError, ProviderState, ToolCaller, ToolDescriptor, ToolOutput,
    Transport,
};
use serde_json::{json, Value};

enum Step {
    Reply(&'static str),
    Drop,
    Stall(Duration),
}

struct FakeTransport {
    tools: Vec<&'static str>,
    refuse_connect: bool,
    script: Mutex<VecDeque<Step>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    invokes: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeTransport {
    fn new(tools: Vec<&'static str>) -> Self {
        Self {
            tools,
            refuse_connect: false,
            script: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            invokes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    fn dead() -> Self {
        Self {
            refuse_connect: true,
            ..Self::new(vec!["ghost_tool"])
        }
    }

    fn scripted(self, steps: Vec<Step>) -> Self {
        *self.script.lock().unwrap() = steps.into();
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn connect(&self) -> labrelay_mcp::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            return Err(McpError::Connection("refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> labrelay_mcp::Result<Vec<ToolDescriptor>> {
        Ok(self
            .tools
            .iter()
            .map(|name| ToolDescriptor::builder(*name).description("fake").build())
            .collect())
    }

    async fn invoke(&self, tool: &str, _args: Value) -> labrelay_mcp::Result<ToolOutput> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(text)) => Ok(ToolOutput::text(text)),
            Some(Step::Drop) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(McpError::Disconnected("pipe closed".to_string()))
            }
            Some(Step::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::text("late"))
            }
            None => Ok(ToolOutput::text(format!("{} ok", tool))),
        }
    }

    async fn close(&self) -> labrelay_mcp::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn manager_with(providers: Vec<(&str, Arc<FakeTransport>)>) -> ClientManager {
    let mut manager = ClientManager::new();
    for (name, transport) in providers {
        manager
            .add_provider(name, transport, Duration::from_secs(5))
            .unwrap();
    }
    manager
}

// ===== Connection and discovery =====

#[tokio::test]
async fn test_dead_provider_degrades_without_failing() {
    let manager = manager_with(vec![
        ("dead", Arc::new(FakeTransport::dead())),
        ("cad", Arc::new(FakeTransport::new(vec!["list_libraries", "add_instance"]))),
    ]);

    let report = manager.connect_all().await.unwrap();
    assert_eq!(report.connected, vec!["cad".to_string()]);
    assert_eq!(report.degraded.len(), 1);
    assert_eq!(report.degraded[0].0, "dead");

    let names: Vec<String> = manager
        .list_all_tools()
        .into_iter()
        .map(|t| t.descriptor.name)
        .collect();
    assert_eq!(names, vec!["list_libraries", "add_instance"]);

    let status = manager.provider_status();
    assert!(matches!(status[0].state, ProviderState::Degraded(_)));
    assert_eq!(status[1].state, ProviderState::Connected);
    assert_eq!(status[1].tool_count, 2);
}

#[tokio::test]
async fn test_collision_first_registered_wins() {
    let first = Arc::new(FakeTransport::new(vec!["search"]));
    let second = Arc::new(FakeTransport::new(vec!["search", "fetch"]));
    let manager = manager_with(vec![("alpha", first.clone()), ("beta", second.clone())]);

    let report = manager.connect_all().await.unwrap();
    assert_eq!(report.collisions.len(), 1);
    assert_eq!(report.collisions[0].kept, "alpha");
    assert_eq!(manager.provider_for("search").as_deref(), Some("alpha"));

    manager.try_call_tool("search", json!({})).await.unwrap();
    assert_eq!(first.invokes.load(Ordering::SeqCst), 1);
    assert_eq!(second.invokes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_providers_is_fatal() {
    let manager = ClientManager::new();
    assert!(matches!(manager.connect_all().await, Err(McpError::NoProviders)));
    assert!(matches!(ClientManager::from_config(&[]), Err(McpError::NoProviders)));
}

#[test]
fn test_duplicate_provider_rejected() {
    let mut manager = ClientManager::new();
    manager
        .add_provider("cad", Arc::new(FakeTransport::new(vec![])), Duration::from_secs(1))
        .unwrap();
    let again = manager.add_provider(
        "cad",
        Arc::new(FakeTransport::new(vec![])),
        Duration::from_secs(1),
    );
    assert!(matches!(again, Err(McpError::DuplicateProvider(name)) if name == "cad"));
}

// ===== Calls =====

#[tokio::test]
async fn test_unknown_tool_is_error_envelope() {
    let manager = manager_with(vec![("cad", Arc::new(FakeTransport::new(vec!["save_design"])))]);
    manager.connect_all().await.unwrap();

    let envelope = manager.call_tool("launch_rocket", json!({})).await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.payload["error_kind"], "tool_not_found");
}

#[tokio::test]
async fn test_disconnect_reconnects_and_retries_once() {
    let transport = Arc::new(
        FakeTransport::new(vec!["save_design"]).scripted(vec![Step::Drop, Step::Reply("saved")]),
    );
    let manager = manager_with(vec![("cad", transport.clone())]);
    manager.connect_all().await.unwrap();

    let output = manager.try_call_tool("save_design", json!({})).await.unwrap();
    assert_eq!(output.joined_text(), "saved");
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    assert_eq!(transport.invokes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_disconnect_surfaces() {
    let transport = Arc::new(
        FakeTransport::new(vec!["save_design"]).scripted(vec![Step::Drop, Step::Drop, Step::Reply("never")]),
    );
    let manager = manager_with(vec![("cad", transport.clone())]);
    manager.connect_all().await.unwrap();

    let result = manager.try_call_tool("save_design", json!({})).await;
    assert!(matches!(result, Err(McpError::Disconnected(_))));
    assert_eq!(transport.invokes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_provider_timeout() {
    let transport =
        Arc::new(FakeTransport::new(vec!["sweep"]).scripted(vec![Step::Stall(Duration::from_secs(5))]));
    let mut manager = ClientManager::new();
    manager
        .add_provider("vna", transport, Duration::from_millis(50))
        .unwrap();
    manager.connect_all().await.unwrap();

    match manager.try_call_tool("sweep", json!({})).await {
        Err(McpError::Timeout { tool, after }) => {
            assert_eq!(tool, "sweep");
            assert_eq!(after, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_caller_impl() {
    let manager = manager_with(vec![("cad", Arc::new(FakeTransport::new(vec!["list_libraries"])))]);
    manager.connect_all().await.unwrap();

    let caller: &dyn ToolCaller = &manager;
    assert!(caller.has_tool("list_libraries"));
    assert!(!caller.has_tool("nope"));
    let output = caller.call("list_libraries", json!({})).await.unwrap();
    assert_eq!(output.joined_text(), "list_libraries ok");
}

// ===== Call styles =====

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_tool_sync_inside_runtime() {
    let manager = manager_with(vec![("cad", Arc::new(FakeTransport::new(vec!["list_libraries"])))]);
    manager.connect_all().await.unwrap();

    let envelope = manager.call_tool_sync("list_libraries", json!({}));
    assert_eq!(envelope.status, EnvelopeStatus::Success);
    assert_eq!(envelope.summary, "list_libraries ok");
}

#[tokio::test]
async fn test_call_tool_async_wait() {
    let manager = Arc::new(manager_with(vec![(
        "cad",
        Arc::new(FakeTransport::new(vec!["get_current_design"])),
    )]));
    manager.connect_all().await.unwrap();

    let pending = manager.call_tool_async("get_current_design", json!({}));
    assert_eq!(pending.tool(), "get_current_design");
    let envelope = pending.wait().await;
    assert!(envelope.is_success());
}

#[tokio::test]
async fn test_call_tool_async_cancel() {
    let transport =
        Arc::new(FakeTransport::new(vec!["sweep"]).scripted(vec![Step::Stall(Duration::from_secs(30))]));
    let manager = Arc::new(manager_with(vec![("vna", transport)]));
    manager.connect_all().await.unwrap();

    let pending = manager.call_tool_async("sweep", json!({}));
    pending.cancel();
    let envelope = pending.wait().await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert!(envelope.summary.contains("cancelled"));
}

#[tokio::test]
async fn test_call_tool_async_wait_timeout() {
    let transport =
        Arc::new(FakeTransport::new(vec!["sweep"]).scripted(vec![Step::Stall(Duration::from_secs(30))]));
    let manager = Arc::new(manager_with(vec![("vna", transport)]));
    manager.connect_all().await.unwrap();

    let envelope = manager
        .call_tool_async("sweep", json!({}))
        .wait_timeout(Duration::from_millis(30))
        .await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
    assert_eq!(envelope.payload["error_kind"], "timeout");
}

// ===== Shutdown =====

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let a = Arc::new(FakeTransport::new(vec!["a"]));
    let b = Arc::new(FakeTransport::new(vec!["b"]));
    let manager = manager_with(vec![("a", a.clone()), ("b", b.clone())]);
    manager.connect_all().await.unwrap();

    manager.shutdown().await;

    assert_eq!(a.closes.load(Ordering::SeqCst), 1);
    assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    assert!(manager.list_all_tools().is_empty());
    assert!(manager
        .provider_status()
        .iter()
        .all(|s| s.state == ProviderState::Closed));
    let envelope = manager.call_tool("a", json!({})).await;
    assert_eq!(envelope.status, EnvelopeStatus::Error);
}
