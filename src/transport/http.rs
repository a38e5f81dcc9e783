//! HTTP transport implementation
//!
//! Streamable HTTP: every JSON-RPC message is POSTed to one endpoint. The
//! server may answer with plain JSON or a single SSE `data:` event, and may
//! hand out an `MCP-Session-Id` that is echoed on later requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, header};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::{
    InitializeParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    RequestId,
};
use crate::{Error, Result};

/// HTTP transport for MCP servers
pub struct HttpTransport {
    /// Backend name, for logs
    name: String,
    /// HTTP client
    client: Client,
    /// Endpoint URL
    url: String,
    /// Custom headers
    headers: HashMap<String, String>,
    /// Session ID handed out by the server
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicI64,
    /// Connected flag
    connected: AtomicBool,
    /// Per-request deadline
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        name: &str,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            client,
            url: url.to_string(),
            headers,
            session_id: RwLock::new(None),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            timeout,
        }))
    }

    /// Run the `initialize` handshake
    pub async fn initialize(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::gateway())?;
        let request = JsonRpcRequest::new(self.next_id(), "initialize", Some(params));
        let response = self.send_request(&request).await?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!("Initialize failed: {}", error.message)));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        info!(backend = %self.name, url = %self.url, "HTTP transport initialized");
        Ok(())
    }

    /// Attach protocol, session and custom headers
    fn with_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION);

        if let Some(session_id) = self.session_id.read().as_deref() {
            builder = builder.header("MCP-Session-Id", session_id);
        }

        for (key, value) in &self.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                builder = builder.header(k, v);
            } else {
                warn!(backend = %self.name, header = %key, "Skipping invalid header");
            }
        }
        builder
    }

    fn map_send_error(&self, e: &reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!(
                "'{}' after {}ms",
                self.name,
                self.timeout.as_millis()
            ))
        } else {
            Error::Connection(format!("Request to '{}' failed: {e}", self.name))
        }
    }

    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .with_headers(self.client.post(&self.url))
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(&e))?;

        if self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
            {
                debug!(backend = %self.name, session_id = %id, "Stored session ID from response");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Connection(format!("HTTP {status}: {body}")));
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let text = response.text().await.map_err(|e| self.map_send_error(&e))?;
        parse_body(&text, is_sse)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire-and-forget; a rejected notification is only logged
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let response = self
            .with_headers(self.client.post(&self.url))
            .json(&JsonRpcNotification::new(method, params))
            .send()
            .await
            .map_err(|e| self.map_send_error(&e))?;

        if !response.status().is_success() {
            warn!(backend = %self.name, status = %response.status(), "Notification rejected");
        }
        Ok(())
    }
}

/// Decode a response body, plain JSON or the first SSE `data:` line
fn parse_body(text: &str, is_sse: bool) -> Result<JsonRpcResponse> {
    if !is_sse {
        return serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("Failed to parse response: {e}")));
    }
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .ok_or_else(|| Error::Protocol("No data in SSE response".to_string()))?;
    serde_json::from_str(data.trim())
        .map_err(|e| Error::Protocol(format!("Failed to parse SSE data: {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.send_request(&request).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        let session_id = self.session_id.write().take();
        if let Some(id) = session_id {
            self.client
                .delete(&self.url)
                .header("MCP-Session-Id", id)
                .send()
                .await
                .map_err(|e| self.map_send_error(&e))?;
        }
        Ok(())
    }
}
