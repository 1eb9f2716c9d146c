//! Persistent event-stream transport
//!
//! A long-lived `GET {base}/sse` carries every server-to-client frame. The
//! first `endpoint` event names the URL that requests are POSTed to; responses
//! arrive later as `message` events and are matched back by id. Frames without
//! an id are pushes and go to subscribers instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use labrelay_config::TransportKind;
use reqwest::{Client, Url};
use serde_json::Value;
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

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder
///
/// Bytes are buffered until a full line is available, so multi-byte characters
/// split across chunks survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let decoded = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = decoded.strip_suffix('\r').unwrap_or(&decoded);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Resolve the `endpoint` event payload against the stream URL
pub(crate) fn resolve_endpoint(base: &str, data: &str) -> Result<String> {
    let target = serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|v| v.get("uri").and_then(|u| u.as_str()).map(|u| u.to_string()))
        .unwrap_or_else(|| data.trim().to_string());

    let base = Url::parse(base)
        .map_err(|e| McpError::Connection(format!("bad stream url '{}': {}", base, e)))?;
    base.join(&target)
        .map(|url| url.to_string())
        .map_err(|e| McpError::Protocol(format!("bad endpoint '{}': {}", target, e)))
}

/// Tool server reached through a persistent event stream
pub struct StreamTransport {
    name: String,
    base_url: String,
    client: Client,
    post_url: Arc<RwLock<Option<String>>>,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    notifications: broadcast::Sender<ServerNotification>,
}

impl StreamTransport {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            post_url: Arc::new(RwLock::new(None)),
            pending: PendingRequests::new(),
            alive: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            notifications,
        }
    }

    fn post_url(&self) -> Result<String> {
        self.post_url
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| McpError::Disconnected(format!("{} has no open stream", self.name)))
    }

    async fn post(&self, body: String) -> Result<reqwest::Response> {
        let url = self.post_url()?;
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.alive.store(false, Ordering::SeqCst);
                    McpError::Disconnected(format!("{}: {}", self.name, e))
                } else {
                    McpError::Connection(format!("{}: {}", self.name, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "{} rejected POST with HTTP {}",
                self.name,
                response.status().as_u16()
            )));
        }
        Ok(response)
    }

    async fn open_stream(&self) -> Result<()> {
        let sse_url = format!("{}/sse", self.base_url);
        let response = self
            .client
            .get(&sse_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Connection(format!("{}: {}", sse_url, e)))?;

        if !response.status().is_success() {
            return Err(McpError::Connection(format!(
                "{} answered HTTP {}",
                sse_url,
                response.status().as_u16()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let listener = tokio::spawn(listen(
            ListenerContext {
                provider: self.name.clone(),
                base_url: sse_url.clone(),
                client: self.client.clone(),
                post_url: Arc::clone(&self.post_url),
                pending: Arc::clone(&self.pending),
                alive: Arc::clone(&self.alive),
                notifications: self.notifications.clone(),
            },
            response.bytes_stream(),
            endpoint_tx,
        ));
        *self.listener.lock().await = Some(listener);

        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx)
            .await
            .map_err(|_| {
                McpError::Connection(format!("{} sent no endpoint event", self.name))
            })?
            .map_err(|_| McpError::Connection(format!("{} stream ended early", self.name)))?;

        debug!("◆ {} POSTS TO {}", self.name, endpoint);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Rpc for StreamTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(McpError::Disconnected(format!("{} stream is down", self.name)));
        }
        let slot = self.pending.register();
        let id = slot.id;
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let response = self.post(body).await?;

        // Some servers answer inline instead of over the stream
        if let Ok(text) = response.text().await {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if let Ok(Inbound::Response(inline)) = protocol::classify(value) {
                    if inline.id == id {
                        return inline.into_result();
                    }
                }
            }
        }

        slot.wait().await?.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.post(body).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.close().await?;
        self.open_stream().await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(self, &self.name)).await {
            Ok(Ok(())) => {
                info!("◆ {} ONLINE (stream)", self.name);
                Ok(())
            }
            Ok(Err(e)) => {
                self.close().await?;
                Err(McpError::Connection(format!("{} handshake failed: {}", self.name, e)))
            }
            Err(_) => {
                self.close().await?;
                Err(McpError::Connection(format!("{} handshake timed out", self.name)))
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
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        *self
            .post_url
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
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

struct ListenerContext {
    provider: String,
    base_url: String,
    client: Client,
    post_url: Arc<RwLock<Option<String>>>,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
    notifications: broadcast::Sender<ServerNotification>,
}

/// Background owner of the event stream
async fn listen(
    ctx: ListenerContext,
    mut stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut parser = SseParser::new();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("◆ {} STREAM ERROR: {}", ctx.provider, e);
                break;
            }
        };

        for event in parser.feed(&chunk) {
            match event.event.as_str() {
                "endpoint" => match resolve_endpoint(&ctx.base_url, &event.data) {
                    Ok(url) => {
                        *ctx.post_url.write().unwrap_or_else(|p| p.into_inner()) = Some(url.clone());
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url);
                        }
                    }
                    Err(e) => warn!("◆ {} BAD ENDPOINT EVENT: {}", ctx.provider, e),
                },
                "message" => handle_message(&ctx, &event.data).await,
                other => debug!("◆ {} IGNORED EVENT {}", ctx.provider, other),
            }
        }
    }

    warn!("◆ {} STREAM CLOSED", ctx.provider);
    ctx.alive.store(false, Ordering::SeqCst);
    ctx.pending.fail_all();
}

async fn handle_message(ctx: &ListenerContext, data: &str) {
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            debug!("◆ {} UNREADABLE MESSAGE: {}", ctx.provider, e);
            return;
        }
    };

    match protocol::classify(value) {
        Ok(Inbound::Response(response)) => {
            ctx.pending.resolve(response);
        }
        Ok(Inbound::Notification { method, params }) => {
            let _ = ctx.notifications.send(ServerNotification {
                provider: ctx.provider.clone(),
                method,
                params,
            });
        }
        Ok(Inbound::Request { id, method }) => {
            let url = ctx
                .post_url
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            if let Some(url) = url {
                let reply = protocol::method_not_found(id, &method);
                if let Err(e) = ctx.client.post(&url).json(&reply).send().await {
                    debug!("◆ {} REFUSAL NOT DELIVERED: {}", ctx.provider, e);
                }
            }
        }
        Err(e) => debug!("◆ {} SENT JUNK: {}", ctx.provider, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_endpoint() {
        let url = resolve_endpoint("http://127.0.0.1:9000/sse", "/message?sessionId=abc").unwrap();
        assert_eq!(url, "http://127.0.0.1:9000/message?sessionId=abc");
    }

    #[test]
    fn test_resolve_json_endpoint() {
        let url = resolve_endpoint(
            "http://127.0.0.1:9000/sse",
            r#"{"uri": "http://127.0.0.1:9000/message?sessionId=xyz"}"#,
        )
        .unwrap();
        assert_eq!(url, "http://127.0.0.1:9000/message?sessionId=xyz");
    }

    #[test]
    fn test_resolve_bad_base() {
        assert!(matches!(
            resolve_endpoint("not a url", "/message"),
            Err(McpError::Connection(_))
        ));
    }
}
