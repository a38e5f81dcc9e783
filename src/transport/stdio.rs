//! Stdio transport implementation (subprocess)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{
    InitializeParams, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};
use crate::{Error, Result};

/// Stdio transport for subprocess MCP servers
///
/// Speaks newline-delimited JSON-RPC over the child's stdin/stdout. One
/// child serves many concurrent requests, matched by id.
pub struct StdioTransport {
    /// Backend name, for logs
    name: String,
    /// Child process
    child: Mutex<Option<Child>>,
    /// Pending requests waiting for response
    pending: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    /// Request ID counter
    request_id: AtomicI64,
    /// Connected flag
    connected: AtomicBool,
    /// Command line to execute
    command: String,
    /// Environment variables
    env: HashMap<String, String>,
    /// Working directory
    cwd: Option<String>,
    /// Per-request deadline
    timeout: Duration,
    /// Writer handle
    writer: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    /// Create a new stdio transport
    #[must_use]
    pub fn new(
        name: &str,
        command: &str,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            child: Mutex::new(None),
            pending: DashMap::new(),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            command: command.to_string(),
            env,
            cwd,
            timeout,
            writer: Mutex::new(None),
        })
    }

    /// Spawn the subprocess and run the `initialize` handshake
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let parts = shlex::split(&self.command)
            .ok_or_else(|| Error::Config(format!("Unparsable command: {}", self.command)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(Error::Config("Empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Connection(format!("Failed to spawn '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("Failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %name, "stderr: {line}");
                }
            });
        }

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.connected.store(true, Ordering::Relaxed);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = reader.next_line().await {
                transport.handle_line(&line);
            }

            transport.connected.store(false, Ordering::Relaxed);
            // Dropping the senders fails every in-flight request
            transport.pending.clear();
            debug!(backend = %transport.name, "Stdio reader task ended");
        });

        if let Err(e) = self.initialize().await {
            if let Err(close_err) = self.close().await {
                warn!(backend = %self.name, error = %close_err, "Failed to stop backend after initialize failure");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::gateway())?;
        let response = self.request("initialize", Some(params)).await?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!("Initialize failed: {}", error.message)));
        }

        self.notify("notifications/initialized", None).await?;
        debug!(backend = %self.name, command = %self.command, "Stdio transport initialized");
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<JsonRpcMessage>(line) {
            Ok(JsonRpcMessage::Response(response)) => {
                let Some(id) = response.id.clone() else {
                    warn!(backend = %self.name, "Response without id");
                    return;
                };
                if let Some((_, sender)) = self.pending.remove(&id) {
                    if sender.send(response).is_err() {
                        debug!(backend = %self.name, "Requester gone before response arrived");
                    }
                } else {
                    debug!(backend = %self.name, id = %id, "Response for unknown or expired request");
                }
            }
            Ok(JsonRpcMessage::Notification(n)) => {
                debug!(backend = %self.name, method = %n.method, "Backend notification");
            }
            Ok(JsonRpcMessage::Request(r)) => {
                debug!(backend = %self.name, method = %r.method, "Ignoring backend request");
            }
            Err(e) => {
                warn!(backend = %self.name, error = %e, "Unparsable line from backend");
            }
        }
    }

    /// Write a message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(Error::Connection("Not connected".to_string()));
        };
        let io = |e: std::io::Error| Error::Connection(format!("Write to backend failed: {e}"));
        stdin.write_all(message.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_message(&message).await
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(Error::Connection(format!("Backend '{}' is not running", self.name)));
        }

        let id = self.next_id();
        let message = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = self.write_message(&message).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Connection(format!(
                "Backend '{}' closed the connection",
                self.name
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout(format!(
                    "{method} on '{}' after {}ms",
                    self.name,
                    self.timeout.as_millis()
                )))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            child
                .kill()
                .await
                .map_err(|e| Error::Connection(format!("Failed to stop '{}': {e}", self.name)))?;
        }
        self.pending.clear();
        Ok(())
    }
}
