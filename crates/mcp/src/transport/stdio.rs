//! Subprocess transport: one JSON-RPC frame per line over the child's stdio

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use labrelay_config::TransportKind;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{call_tool, fetch_tools, handshake, Rpc, Transport};
use crate::descriptor::ToolDescriptor;
use crate::error::{McpError, Result};
use crate::pending::PendingRequests;
use crate::protocol::{
    self, Inbound, JsonRpcNotification, JsonRpcRequest, ServerNotification, ToolOutput,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

type Launch = Box<dyn FnOnce() + Send>;

static LAUNCHER: OnceLock<Option<mpsc::Sender<Launch>>> = OnceLock::new();

/// Thread that performs every child spawn for the life of the process.
///
/// `PR_SET_PDEATHSIG` fires when the spawning *thread* exits, not the
/// process. Spawns made from a runtime worker or a `block_in_place`
/// thread would get SIGTERM once tokio retires that thread.
fn launcher() -> Option<&'static mpsc::Sender<Launch>> {
    LAUNCHER
        .get_or_init(|| {
            let (tx, rx) = mpsc::channel::<Launch>();
            std::thread::Builder::new()
                .name("labrelay-launcher".to_string())
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })
                .map_err(|e| warn!("◆ LAUNCHER THREAD NOT STARTED: {}", e))
                .ok()
                .map(|_| tx)
        })
        .as_ref()
}

/// Spawn `cmd` on the launcher thread, registered with the caller's runtime
async fn launch(mut cmd: Command) -> std::io::Result<Child> {
    let Some(sender) = launcher() else {
        return cmd.spawn();
    };
    let handle = tokio::runtime::Handle::current();
    let (tx, rx) = oneshot::channel();
    let job: Launch = Box::new(move || {
        let _runtime = handle.enter();
        let _ = tx.send(cmd.spawn());
    });
    sender
        .send(job)
        .map_err(|_| std::io::Error::other("launcher thread is gone"))?;
    rx.await
        .map_err(|_| std::io::Error::other("launcher dropped the spawn"))?
}

struct ChildSession {
    child: Child,
    reader: JoinHandle<()>,
    stderr_pump: Option<JoinHandle<()>>,
}

/// Tool server running as a child process
pub struct StdioTransport {
    name: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    session: Mutex<Option<ChildSession>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
    notifications: broadcast::Sender<ServerNotification>,
}

impl StdioTransport {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env,
            session: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            pending: PendingRequests::new(),
            alive: Arc::new(AtomicBool::new(false)),
            notifications,
        }
    }

    /// OS process id of the running child
    pub async fn child_id(&self) -> Option<u32> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|session| session.child.id())
    }

    async fn spawn_child(&self) -> Result<()> {
        debug!("◆ SPAWNING {}: {} {:?}", self.name, self.command, self.args);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Kernel sends SIGTERM to the child if we die without running Drop.
        // Tied to the spawning thread, hence `launch`.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let mut child = launch(cmd).await.map_err(|e| {
            McpError::Connection(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(McpError::Connection(format!(
                "'{}' stdio could not be captured",
                self.name
            )));
        };

        let stderr_pump = child.stderr.take().map(|stderr| {
            let provider = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "{}", line);
                }
            })
        });

        *self.stdin.lock().await = Some(stdin);
        self.alive.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(reader_loop(
            self.name.clone(),
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.alive),
            Arc::clone(&self.stdin),
            self.notifications.clone(),
        ));

        *self.session.lock().await = Some(ChildSession {
            child,
            reader,
            stderr_pump,
        });
        Ok(())
    }

    async fn write_frame(&self, line: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Disconnected(format!("{} is not running", self.name)))?;

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            McpError::Disconnected(format!("{} stdin closed: {}", self.name, e))
        })
    }
}

#[async_trait]
impl Rpc for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(McpError::Disconnected(format!("{} is not running", self.name)));
        }
        let slot = self.pending.register();
        let frame = serde_json::to_string(&JsonRpcRequest::new(slot.id, method, params))?;
        self.write_frame(frame).await?;
        slot.wait().await?.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_frame(frame).await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.close().await?;
        self.spawn_child().await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(self, &self.name)).await {
            Ok(Ok(())) => {
                info!("◆ {} ONLINE (subprocess)", self.name);
                Ok(())
            }
            Ok(Err(e)) => {
                self.close().await?;
                Err(McpError::Connection(format!("{} handshake failed: {}", self.name, e)))
            }
            Err(_) => {
                self.close().await?;
                Err(McpError::Connection(format!(
                    "{} did not answer initialize within {:?}",
                    self.name, HANDSHAKE_TIMEOUT
                )))
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        fetch_tools(self).await
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<ToolOutput> {
        call_tool(self, tool, args).await
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping stdin gives a well-behaved server its EOF
        self.stdin.lock().await.take();

        if let Some(mut session) = self.session.lock().await.take() {
            let _ = session.child.start_kill();
            match tokio::time::timeout(REAP_TIMEOUT, session.child.wait()).await {
                Ok(Ok(status)) => debug!("◆ {} EXITED: {}", self.name, status),
                Ok(Err(e)) => warn!("◆ {} REAP FAILED: {}", self.name, e),
                Err(_) => warn!("◆ {} DID NOT EXIT WITHIN {:?}", self.name, REAP_TIMEOUT),
            }
            session.reader.abort();
            if let Some(pump) = session.stderr_pump {
                pump.abort();
            }
        }

        self.pending.fail_all();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ServerNotification>> {
        Some(self.notifications.subscribe())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.try_lock() {
            if let Some(session) = guard.as_mut() {
                let _ = session.child.start_kill();
                session.reader.abort();
            }
        }
    }
}

/// Sole owner of the child's stdout
async fn reader_loop(
    provider: String,
    stdout: ChildStdout,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    notifications: broadcast::Sender<ServerNotification>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("◆ {} STDOUT ERROR: {}", provider, e);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                debug!(provider = %provider, "non-protocol stdout: {}", trimmed);
                continue;
            }
        };

        match protocol::classify(value) {
            Ok(Inbound::Response(response)) => {
                pending.resolve(response);
            }
            Ok(Inbound::Notification { method, params }) => {
                let _ = notifications.send(ServerNotification {
                    provider: provider.clone(),
                    method,
                    params,
                });
            }
            Ok(Inbound::Request { id, method }) => {
                debug!("◆ {} ASKED FOR {}; REFUSING", provider, method);
                let reply = protocol::method_not_found(id, &method).to_string();
                if let Some(writer) = stdin.lock().await.as_mut() {
                    let _ = writer.write_all(format!("{}\n", reply).as_bytes()).await;
                    let _ = writer.flush().await;
                }
            }
            Err(e) => debug!("◆ {} SENT JUNK: {}", provider, e),
        }
    }

    warn!("◆ {} STDOUT CLOSED", provider);
    alive.store(false, Ordering::SeqCst);
    pending.fail_all();
}
