//! Client manager: owns every provider connection and routes calls to them

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use labrelay_config::{ToolServerConfig, TransportKind};
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::descriptor::ToolDescriptor;
use crate::envelope::ResultEnvelope;
use crate::error::{McpError, Result};
use crate::protocol::{ServerNotification, ToolOutput};
use crate::registry::{Collision, RouteTable, RoutedTool};
use crate::transport::{self, Transport};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderState {
    /// Registered, not yet connected
    Pending,
    Connected,
    /// Excluded from routing
    Degraded(String),
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: TransportKind,
    pub state: ProviderState,
    pub tool_count: usize,
}

/// Outcome of [`ClientManager::connect_all`]
#[derive(Debug, Clone, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub degraded: Vec<(String, String)>,
    pub collisions: Vec<Collision>,
}

struct ProviderHandle {
    name: String,
    transport: Arc<dyn Transport>,
    call_timeout: Duration,
    state: RwLock<ProviderState>,
    tools: RwLock<Vec<ToolDescriptor>>,
    reconnect: Mutex<()>,
}

impl ProviderHandle {
    fn state(&self) -> ProviderState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, state: ProviderState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        *self
            .tools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tools;
    }

    /// Connect, handshake and refresh the tool cache wholesale
    async fn establish(&self) -> Result<usize> {
        self.transport.connect().await?;
        let tools = self.transport.list_tools().await?;
        let count = tools.len();
        self.set_tools(tools);
        self.set_state(ProviderState::Connected);
        Ok(count)
    }
}

/// Routes tool calls across every configured provider
pub struct ClientManager {
    providers: Vec<Arc<ProviderHandle>>,
    routes: RwLock<RouteTable>,
    runtime: Option<Handle>,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            routes: RwLock::new(RouteTable::default()),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Build transports for every enabled server entry, in order
    pub fn from_config(servers: &[ToolServerConfig]) -> Result<Self> {
        let mut manager = Self::new();
        for server in servers.iter().filter(|s| s.enabled) {
            let transport = transport::from_config(server)?;
            manager.add_provider(
                &server.name,
                transport,
                Duration::from_secs(server.call_timeout_secs.max(1)),
            )?;
        }
        if manager.providers.is_empty() {
            return Err(McpError::NoProviders);
        }
        Ok(manager)
    }

    pub fn add_provider(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
    ) -> Result<()> {
        let name = name.into();
        if self.providers.iter().any(|p| p.name == name) {
            return Err(McpError::DuplicateProvider(name));
        }
        self.providers.push(Arc::new(ProviderHandle {
            name,
            transport,
            call_timeout,
            state: RwLock::new(ProviderState::Pending),
            tools: RwLock::new(Vec::new()),
            reconnect: Mutex::new(()),
        }));
        Ok(())
    }

    /// Connect every provider concurrently; failures degrade instead of aborting
    pub async fn connect_all(&self) -> Result<ConnectReport> {
        if self.providers.is_empty() {
            return Err(McpError::NoProviders);
        }

        let outcomes = join_all(
            self.providers
                .iter()
                .map(|handle| async move { (handle, handle.establish().await) }),
        )
        .await;

        let mut report = ConnectReport::default();
        for (handle, outcome) in outcomes {
            match outcome {
                Ok(count) => {
                    info!("◆ PROVIDER {} CONNECTED: {} TOOLS", handle.name, count);
                    report.connected.push(handle.name.clone());
                }
                Err(e) => {
                    warn!("◆ PROVIDER {} DEGRADED: {}", handle.name, e);
                    let _ = handle.transport.close().await;
                    handle.set_tools(Vec::new());
                    handle.set_state(ProviderState::Degraded(e.to_string()));
                    report.degraded.push((handle.name.clone(), e.to_string()));
                }
            }
        }

        report.collisions = self.rebuild_routes();
        Ok(report)
    }

    /// Rebuild the merged table from connected providers, in declaration order
    fn rebuild_routes(&self) -> Vec<Collision> {
        let snapshot: Vec<(String, Vec<ToolDescriptor>)> = self
            .providers
            .iter()
            .filter(|p| p.state() == ProviderState::Connected)
            .map(|p| (p.name.clone(), p.tools()))
            .collect();

        let (table, collisions) = RouteTable::build(
            snapshot
                .iter()
                .map(|(name, tools)| (name.as_str(), tools.as_slice())),
        );
        *self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = table;
        collisions
    }

    fn routes(&self) -> std::sync::RwLockReadGuard<'_, RouteTable> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, provider: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.iter().find(|p| p.name == provider).cloned()
    }

    /// Merged tool list of all routable providers
    pub fn list_all_tools(&self) -> Vec<RoutedTool> {
        self.routes().tools().to_vec()
    }

    pub fn descriptor(&self, tool: &str) -> Option<ToolDescriptor> {
        self.routes().resolve(tool).map(|r| r.descriptor.clone())
    }

    pub fn provider_for(&self, tool: &str) -> Option<String> {
        self.routes().resolve(tool).map(|r| r.provider.clone())
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.routes().resolve(tool).is_some()
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.name.clone(),
                kind: p.transport.kind(),
                state: p.state(),
                tool_count: p.tools().len(),
            })
            .collect()
    }

    /// Push messages from one provider, where its transport carries them
    pub fn subscribe(&self, provider: &str) -> Option<broadcast::Receiver<ServerNotification>> {
        self.handle(provider)?.transport.subscribe()
    }

    fn route(&self, tool: &str) -> Result<Arc<ProviderHandle>> {
        let provider = self
            .provider_for(tool)
            .ok_or_else(|| McpError::ToolNotFound(tool.to_string()))?;
        let handle = self
            .handle(&provider)
            .ok_or_else(|| McpError::ToolNotFound(tool.to_string()))?;
        match handle.state() {
            ProviderState::Connected => Ok(handle),
            _ => Err(McpError::Unavailable(provider)),
        }
    }

    async fn invoke_once(handle: &ProviderHandle, tool: &str, args: Value) -> Result<ToolOutput> {
        match tokio::time::timeout(handle.call_timeout, handle.transport.invoke(tool, args)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                tool: tool.to_string(),
                after: handle.call_timeout,
            }),
        }
    }

    async fn reconnect(&self, handle: &ProviderHandle) -> Result<()> {
        let _guard = handle.reconnect.lock().await;
        // A concurrent caller may have already brought it back
        if handle.transport.is_connected() && handle.state() == ProviderState::Connected {
            return Ok(());
        }

        let _ = handle.transport.close().await;
        let outcome = handle.establish().await;
        match &outcome {
            Ok(count) => info!("◆ PROVIDER {} RECONNECTED: {} TOOLS", handle.name, count),
            Err(e) => {
                error!("◆ PROVIDER {} LOST: {}", handle.name, e);
                handle.set_tools(Vec::new());
                handle.set_state(ProviderState::Degraded(e.to_string()));
            }
        }
        self.rebuild_routes();
        outcome.map(|_| ())
    }

    /// Route one call; a dropped connection is re-established and the call retried once
    pub async fn try_call_tool(&self, tool: &str, args: Value) -> Result<ToolOutput> {
        let handle = self.route(tool)?;
        debug!("◆ CALL {} → {}", tool, handle.name);

        match Self::invoke_once(&handle, tool, args.clone()).await {
            Err(McpError::Disconnected(reason)) => {
                warn!(
                    "◆ PROVIDER {} DROPPED DURING '{}': {}",
                    handle.name, tool, reason
                );
                self.reconnect(&handle).await?;
                Self::invoke_once(&handle, tool, args).await
            }
            other => other,
        }
    }

    /// Route one call and fold any failure into an error envelope
    pub async fn call_tool(&self, tool: &str, args: Value) -> ResultEnvelope {
        match self.try_call_tool(tool, args).await {
            Ok(output) => ResultEnvelope::from_output(&output),
            Err(e) => {
                warn!("◆ CALL '{}' FAILED: {}", tool, e);
                ResultEnvelope::from_error(&e)
            }
        }
    }

    /// Blocking variant for callers outside async code
    pub fn call_tool_sync(&self, tool: &str, args: Value) -> ResultEnvelope {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                ResultEnvelope::error(
                    "call_tool_sync cannot block a current-thread runtime; use call_tool",
                )
            }
            Ok(handle) => {
                tokio::task::block_in_place(|| handle.block_on(self.call_tool(tool, args)))
            }
            Err(_) => match &self.runtime {
                Some(handle) => handle.block_on(self.call_tool(tool, args)),
                None => match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(self.call_tool(tool, args)),
                    Err(e) => ResultEnvelope::error(format!("no runtime available: {}", e)),
                },
            },
        }
    }

    /// Spawn the call and hand back a cancellable handle
    pub fn call_tool_async(self: &Arc<Self>, tool: &str, args: Value) -> PendingCall {
        let manager = Arc::clone(self);
        let name = tool.to_string();
        let handle = tokio::spawn(async move { manager.call_tool(&name, args).await });
        PendingCall {
            tool: tool.to_string(),
            handle,
        }
    }

    /// Close every transport; child processes are terminated and reaped
    pub async fn shutdown(&self) {
        join_all(self.providers.iter().map(|handle| async move {
            if let Err(e) = handle.transport.close().await {
                warn!("◆ PROVIDER {} CLOSE FAILED: {}", handle.name, e);
            }
            handle.set_state(ProviderState::Closed);
        }))
        .await;
        self.rebuild_routes();
        info!("◆ ALL PROVIDERS CLOSED");
    }
}

/// In-flight call started by [`ClientManager::call_tool_async`]
pub struct PendingCall {
    tool: String,
    handle: JoinHandle<ResultEnvelope>,
}

impl PendingCall {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub async fn wait(self) -> ResultEnvelope {
        let tool = self.tool;
        join_outcome(&tool, self.handle.await)
    }

    /// Wait at most `limit`; on expiry the call is cancelled and reported as a timeout
    pub async fn wait_timeout(mut self, limit: Duration) -> ResultEnvelope {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(joined) => join_outcome(&self.tool, joined),
            Err(_) => {
                self.handle.abort();
                warn!("◆ CALL '{}' CANCELLED AFTER {:?}", self.tool, limit);
                ResultEnvelope::from_error(&McpError::Timeout {
                    tool: self.tool.clone(),
                    after: limit,
                })
            }
        }
    }
}

fn join_outcome(
    tool: &str,
    joined: std::result::Result<ResultEnvelope, tokio::task::JoinError>,
) -> ResultEnvelope {
    match joined {
        Ok(envelope) => envelope,
        Err(e) if e.is_cancelled() => ResultEnvelope::error(format!("call '{}' was cancelled", tool)),
        Err(e) => ResultEnvelope::error(format!("call '{}' aborted: {}", tool, e)),
    }
}

#[async_trait::async_trait]
impl crate::ToolCaller for ClientManager {
    async fn call(&self, tool: &str, args: Value) -> Result<ToolOutput> {
        self.try_call_tool(tool, args).await
    }

    fn has_tool(&self, tool: &str) -> bool {
        ClientManager::has_tool(self, tool)
    }
}
