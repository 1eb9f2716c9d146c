//! Stateless endpoint transport: one POST per JSON-RPC frame

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use labrelay_config::TransportKind;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::stream::SseParser;
use super::{call_tool, fetch_tools, handshake, Rpc, Transport};
use crate::descriptor::ToolDescriptor;
use crate::error::{McpError, Result};
use crate::protocol::{self, Inbound, JsonRpcNotification, JsonRpcRequest, ToolOutput};

/// Exponential backoff for transient endpoint failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Tool server reached through plain HTTP round trips
pub struct EndpointTransport {
    name: String,
    url: String,
    client: Client,
    retry: RetryPolicy,
    next_id: AtomicU64,
    ready: AtomicBool,
}

impl EndpointTransport {
    pub fn new(name: impl Into<String>, url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: Client::new(),
            retry,
            next_id: AtomicU64::new(1),
            ready: AtomicBool::new(false),
        }
    }

    /// POST one frame, retrying transient failures; returns the response body
    async fn post(&self, body: &str) -> Result<String> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for(attempt - 1);
                warn!(
                    "◆ {} RETRY {}/{} IN {:?}: {}",
                    self.name, attempt, attempts, delay, last_error
                );
                tokio::time::sleep(delay).await;
            }

            let sent = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json, text/event-stream")
                .body(body.to_string())
                .send()
                .await;

            match sent {
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(McpError::Connection(format!("{}: {}", self.name, e))),
                Ok(response) if is_transient_status(response.status()) => {
                    last_error = format!("HTTP {}", response.status().as_u16());
                }
                Ok(response) if !response.status().is_success() => {
                    return Err(McpError::Protocol(format!(
                        "{} answered HTTP {}",
                        self.name,
                        response.status().as_u16()
                    )));
                }
                Ok(response) => {
                    return response
                        .text()
                        .await
                        .map_err(|e| McpError::Disconnected(format!("{}: {}", self.name, e)));
                }
            }
        }

        Err(McpError::Disconnected(format!(
            "{} unreachable after {} attempts: {}",
            self.name, attempts, last_error
        )))
    }
}

/// Pull the JSON-RPC frame out of a body that may be plain JSON or an event stream
fn extract_frame(body: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }
    let mut parser = SseParser::new();
    let mut events = parser.feed(body.as_bytes());
    events.extend(parser.feed(b"\n\n"));
    events
        .into_iter()
        .filter(|event| event.event == "message")
        .find_map(|event| serde_json::from_str::<Value>(&event.data).ok())
        .ok_or_else(|| McpError::Protocol("endpoint body holds no JSON-RPC frame".to_string()))
}

#[async_trait]
impl Rpc for EndpointTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let text = self.post(&body).await?;

        match protocol::classify(extract_frame(&text)?)? {
            Inbound::Response(response) if response.id == id => response.into_result(),
            Inbound::Response(response) => Err(McpError::Protocol(format!(
                "expected response {}, got {}",
                id, response.id
            ))),
            _ => Err(McpError::Protocol(format!(
                "{} answered {} with a non-response",
                self.name, method
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.post(&body).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for EndpointTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Endpoint
    }

    async fn connect(&self) -> Result<()> {
        handshake(self, &self.name).await.map_err(|e| match e {
            McpError::Disconnected(msg) => McpError::Connection(msg),
            other => other,
        })?;
        self.ready.store(true, Ordering::SeqCst);
        info!("◆ {} ONLINE (endpoint)", self.name);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        fetch_tools(self).await
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<ToolOutput> {
        let result = call_tool(self, tool, args).await;
        if let Err(McpError::Disconnected(_)) = &result {
            self.ready.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn close(&self) -> Result<()> {
        debug!("◆ {} RELEASED", self.name);
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
