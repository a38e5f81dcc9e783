//! Per-call data: requests, results and audit records

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Lifecycle of a single tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Created, not yet dispatched
    Pending,
    /// Dispatched to a backend
    Running,
    /// Backend returned a payload
    Success,
    /// Resolution or invocation failed
    Failed,
    /// Deadline exceeded
    Timeout,
    /// Caller not allowed, or parameters matched a dangerous pattern
    PermissionDenied,
}

impl ToolCallStatus {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable call request
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    request_id: String,
    logical_name: String,
    params: Value,
    caller_agent: String,
    session_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ToolCallRequest {
    /// Create a request with a fresh UUID v4 id
    pub fn new(
        logical_name: impl Into<String>,
        params: Value,
        caller_agent: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            logical_name: logical_name.into(),
            params,
            caller_agent: caller_agent.into(),
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// Unique request id
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Logical tool requested
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Call arguments
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Calling agent
    pub fn caller_agent(&self) -> &str {
        &self.caller_agent
    }

    /// Session, when the caller supplied one
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Creation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Outcome of a call, returned to the caller and audited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Id of the originating request
    pub request_id: String,
    /// Logical tool requested
    pub logical_name: String,
    /// Physical tool invoked, empty when resolution failed
    pub physical_tool: String,
    /// Server invoked, empty when resolution failed
    pub mcp_server: String,
    /// Current status
    pub status: ToolCallStatus,
    /// Payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Start of processing
    pub start_time: DateTime<Utc>,
    /// End of processing, set by [`ToolCallResult::complete`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    pub duration_ms: f64,
    #[serde(skip)]
    started: Option<Instant>,
}

impl ToolCallResult {
    /// Start a pending result for `request`
    #[must_use]
    pub fn for_request(request: &ToolCallRequest) -> Self {
        Self {
            request_id: request.request_id().to_string(),
            logical_name: request.logical_name().to_string(),
            physical_tool: String::new(),
            mcp_server: String::new(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0.0,
            started: Some(Instant::now()),
        }
    }

    /// Record the resolved target
    pub fn set_target(&mut self, mcp_server: impl Into<String>, physical_tool: impl Into<String>) {
        self.mcp_server = mcp_server.into();
        self.physical_tool = physical_tool.into();
    }

    /// Move from pending to running
    pub fn mark_running(&mut self) {
        if self.status == ToolCallStatus::Pending {
            self.status = ToolCallStatus::Running;
        }
    }

    /// Whether the result reached a terminal status
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status, stamping end time and duration
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if the result is already terminal,
    /// or [`Error::Internal`] if `status` is not terminal.
    pub fn complete(
        &mut self,
        status: ToolCallStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::AlreadyCompleted(self.request_id.clone()));
        }
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "complete() called with non-terminal status {status}"
            )));
        }

        let end = Utc::now();
        self.duration_ms = match self.started {
            Some(started) => started.elapsed().as_secs_f64() * 1000.0,
            None => {
                // Deserialized results have no monotonic anchor
                (end - self.start_time)
                    .to_std()
                    .map_or(0.0, |d| d.as_secs_f64() * 1000.0)
            }
        };
        self.status = status;
        self.result = result;
        self.error = error;
        self.end_time = Some(end);
        Ok(())
    }
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Request id
    pub request_id: String,
    /// Session, when supplied
    pub session_id: Option<String>,
    /// Calling agent
    pub caller_agent: String,
    /// Logical tool requested
    pub logical_name: String,
    /// Physical tool invoked
    pub physical_tool: String,
    /// Server invoked
    pub mcp_server: String,
    /// Call arguments
    pub params: Value,
    /// Terminal status
    pub status: ToolCallStatus,
    /// Length-bounded rendering of the payload
    pub result_summary: Option<String>,
    /// Error text
    pub error: Option<String>,
    /// Start of processing
    pub start_time: DateTime<Utc>,
    /// End of processing
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    pub duration_ms: f64,
}

impl AuditRecord {
    /// Snapshot a finished call; the payload is cut to `max_result_length` characters
    #[must_use]
    pub fn from_call(
        request: &ToolCallRequest,
        result: &ToolCallResult,
        max_result_length: usize,
    ) -> Self {
        Self {
            request_id: result.request_id.clone(),
            session_id: request.session_id().map(str::to_string),
            caller_agent: request.caller_agent().to_string(),
            logical_name: result.logical_name.clone(),
            physical_tool: result.physical_tool.clone(),
            mcp_server: result.mcp_server.clone(),
            params: request.params().clone(),
            status: result.status,
            result_summary: result
                .result
                .as_ref()
                .map(|value| summarize(value, max_result_length)),
            error: result.error.clone(),
            start_time: result.start_time,
            end_time: result.end_time,
            duration_ms: result.duration_ms,
        }
    }
}

/// Render a payload for the audit trail
///
/// Strings are used as-is, other values JSON-encoded. Output longer than
/// `max_len` characters is cut and suffixed with `...`.
#[must_use]
pub fn summarize(value: &Value, max_len: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match text.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}
