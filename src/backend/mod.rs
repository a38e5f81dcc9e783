//! Backend management
//!
//! One [`Backend`] per configured MCP server process, each owning a single
//! transport session. The [`ConnectionManager`] starts and stops them and
//! routes `tools/call` requests by server name or by physical tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, Config, TransportConfig};
use crate::failsafe::{RetryPolicy, with_retry};
use crate::protocol::{JsonRpcResponse, ToolsCallResult, ToolsListResult};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Invokes a physical tool on a named server
///
/// The gateway depends only on this trait, so tests can substitute a fake.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Call `physical_tool` on `server` with `params`
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] when the backend cannot be reached,
    /// [`Error::ToolExecution`] when the tool ran and failed,
    /// [`Error::Timeout`] when the deadline passed.
    async fn invoke(&self, server: &str, physical_tool: &str, params: Value) -> Result<Value>;
}

/// MCP Backend - manages connection to a single MCP server
pub struct Backend {
    /// Backend name
    pub name: String,
    /// Configuration
    config: BackendConfig,
    /// Transport
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes session startup so concurrent first calls share one process
    start_lock: Mutex<()>,
    /// Retry policy for tool calls
    retry_policy: RetryPolicy,
    /// Tools advertised by `tools/list`
    tools: RwLock<Vec<String>>,
    /// Concurrency limiter
    semaphore: Semaphore,
    /// Request counter
    request_count: AtomicU64,
}

impl Backend {
    /// Create a new backend
    #[must_use]
    pub fn new(name: &str, config: BackendConfig, retry_policy: RetryPolicy) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            name: name.to_string(),
            config,
            transport: RwLock::new(None),
            start_lock: Mutex::new(()),
            retry_policy,
            tools: RwLock::new(Vec::new()),
            semaphore: Semaphore::new(permits),
            request_count: AtomicU64::new(0),
        }
    }

    /// Connect, handshake and learn the tool list
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to connect or initialize.
    pub async fn start(&self) -> Result<usize> {
        if self.is_running() {
            return Ok(self.tools.read().len());
        }
        let _guard = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(self.tools.read().len());
        }

        // a session that dropped on its own still owns a child process
        let stale = self.transport.write().take();
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!(backend = %self.name, error = %e, "Closing stale session failed");
            }
        }

        info!(backend = %self.name, transport = self.config.transport.transport_type(), "Starting backend");
        let transport: Arc<dyn Transport> = match &self.config.transport {
            TransportConfig::Stdio { command, cwd } => {
                let transport = StdioTransport::new(
                    &self.name,
                    command,
                    self.config.env.clone(),
                    cwd.clone(),
                    self.config.timeout,
                );
                transport.start().await?;
                transport
            }
            TransportConfig::Http { http_url } => {
                let transport = HttpTransport::new(
                    &self.name,
                    http_url,
                    self.config.headers.clone(),
                    self.config.timeout,
                )?;
                transport.initialize().await?;
                transport
            }
        };

        let tools = match Self::list_tools(transport.as_ref()).await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    warn!(backend = %self.name, error = %close_err, "Failed to close transport after tools/list failure");
                }
                return Err(e);
            }
        };
        let count = tools.len();
        debug!(backend = %self.name, tools = count, "Backend tools listed");

        *self.tools.write() = tools;
        *self.transport.write() = Some(transport);
        Ok(count)
    }

    async fn list_tools(transport: &dyn Transport) -> Result<Vec<String>> {
        let response = transport.request("tools/list", None).await?;
        let result = into_result(response)?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools.into_iter().map(|t| t.name).collect())
    }

    /// Close the session
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close cleanly.
    pub async fn stop(&self) -> Result<()> {
        let transport = self.transport.write().take();
        if let Some(t) = transport {
            info!(backend = %self.name, "Stopping backend");
            t.close().await?;
        }
        Ok(())
    }

    /// Check if backend is running
    pub fn is_running(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    /// Tools advertised at start
    pub fn tools(&self) -> Vec<String> {
        self.tools.read().clone()
    }

    /// Call a tool, starting the session if needed
    ///
    /// Transient transport failures are retried with backoff; tool errors
    /// and timeouts are not.
    ///
    /// # Errors
    ///
    /// See [`ToolInvoker::invoke`].
    #[tracing::instrument(skip(self, params), fields(backend = %self.name))]
    pub async fn call_tool(&self, tool: &str, params: Value) -> Result<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let arguments = if params.is_null() { json!({}) } else { params };

        with_retry(&self.retry_policy, &self.name, || {
            let arguments = arguments.clone();
            async move {
                if !self.is_running() {
                    self.start().await?;
                }
                let transport = self
                    .transport
                    .read()
                    .clone()
                    .ok_or_else(|| Error::Connection(format!("Backend '{}' is not running", self.name)))?;
                let response = transport
                    .request("tools/call", Some(json!({"name": tool, "arguments": arguments})))
                    .await?;
                tool_payload(into_result(response)?)
            }
        })
        .await
    }

    /// Get backend status
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            name: self.name.clone(),
            running: self.is_running(),
            transport: self.config.transport.transport_type().to_string(),
            tools: self.tools.read().len(),
            request_count: self.request_count.load(Ordering::Relaxed),
        }
    }
}

/// Unwrap a JSON-RPC response; an error object is a tool failure
fn into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(Error::ToolExecution(format!(
            "{} (code {})",
            error.message, error.code
        )));
    }
    response
        .result
        .ok_or_else(|| Error::Protocol("Response has neither result nor error".to_string()))
}

/// Turn a `tools/call` result into the caller's payload
///
/// All-text content collapses to a string; anything else is returned as is.
fn tool_payload(result: Value) -> Result<Value> {
    let call: ToolsCallResult = serde_json::from_value(result.clone())?;
    if call.is_error {
        let text = call.text();
        return Err(Error::ToolExecution(if text.is_empty() {
            "Tool reported an error".to_string()
        } else {
            text
        }));
    }

    let all_text = !call.content.is_empty()
        && call
            .content
            .iter()
            .all(|item| item.get("type").and_then(Value::as_str) == Some("text"));
    if all_text {
        Ok(Value::String(call.text()))
    } else {
        Ok(result)
    }
}

/// Backend status information
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    /// Backend name
    pub name: String,
    /// Whether backend is running
    pub running: bool,
    /// Transport type
    pub transport: String,
    /// Number of advertised tools
    pub tools: usize,
    /// Total request count
    pub request_count: u64,
}

/// Outcome of [`ConnectionManager::start_all_servers`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartSummary {
    /// Backends that started, with their tool count
    pub started: Vec<(String, usize)>,
    /// Backends that failed, with the error text
    pub failed: Vec<(String, String)>,
}

/// Owns every backend session
pub struct ConnectionManager {
    /// Backends by name
    backends: DashMap<String, Arc<Backend>>,
    /// Physical tool → owning backend
    tool_index: DashMap<String, String>,
}

impl ConnectionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
            tool_index: DashMap::new(),
        }
    }

    /// Create a manager for every enabled backend in `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let manager = Self::new();
        let policy = RetryPolicy::new(&config.retry);
        for (name, backend) in config.enabled_backends() {
            manager.register(Arc::new(Backend::new(name, backend.clone(), policy.clone())));
        }
        manager
    }

    /// Add a backend
    pub fn register(&self, backend: Arc<Backend>) {
        debug!(backend = %backend.name, "Registered backend");
        self.backends.insert(backend.name.clone(), backend);
    }

    /// Backend by name
    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Backend serving `tool`, as learned from `tools/list`
    pub fn owner_of(&self, tool: &str) -> Option<String> {
        self.tool_index.get(tool).map(|e| e.value().clone())
    }

    /// All backends, sorted by name
    pub fn all(&self) -> Vec<Arc<Backend>> {
        let mut backends: Vec<_> = self.backends.iter().map(|e| Arc::clone(e.value())).collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        backends
    }

    /// Connect every backend; one failure never stops the others
    pub async fn start_all_servers(&self) -> StartSummary {
        let mut summary = StartSummary::default();
        for backend in self.all() {
            match backend.start().await {
                Ok(count) => {
                    for tool in backend.tools() {
                        if let Some(previous) = self.tool_index.insert(tool.clone(), backend.name.clone()) {
                            if previous != backend.name {
                                warn!(tool = %tool, previous = %previous, current = %backend.name, "Tool served by several backends");
                            }
                        }
                    }
                    info!(backend = %backend.name, tools = count, "Backend started");
                    summary.started.push((backend.name.clone(), count));
                }
                Err(e) => {
                    error!(backend = %backend.name, error = %e, "Backend failed to start");
                    summary.failed.push((backend.name.clone(), e.to_string()));
                }
            }
        }
        summary
    }

    /// Close every session; a failing close is logged and the rest still close
    pub async fn stop_all_servers(&self) {
        for backend in self.all() {
            if let Err(e) = backend.stop().await {
                warn!(backend = %backend.name, error = %e, "Backend failed to stop cleanly");
            }
        }
        self.tool_index.clear();
    }

    /// Call `tool` on whichever backend advertised it
    ///
    /// # Errors
    ///
    /// [`Error::BackendNotFound`] when no backend serves the tool, otherwise
    /// see [`ToolInvoker::invoke`].
    pub async fn call_tool(&self, tool: &str, params: Value) -> Result<Value> {
        let owner = self
            .owner_of(tool)
            .ok_or_else(|| Error::BackendNotFound(format!("no backend serves '{tool}'")))?;
        self.invoke(&owner, tool, params).await
    }

    /// Status of every backend, sorted by name
    pub fn status(&self) -> Vec<BackendStatus> {
        self.all().iter().map(|b| b.status()).collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInvoker for ConnectionManager {
    async fn invoke(&self, server: &str, physical_tool: &str, params: Value) -> Result<Value> {
        let backend = self
            .get(server)
            .or_else(|| self.owner_of(physical_tool).and_then(|owner| self.get(&owner)))
            .ok_or_else(|| {
                Error::BackendNotFound(format!("'{server}' (tool '{physical_tool}')"))
            })?;
        backend.call_tool(physical_tool, params).await
    }
}
