//! Error types for the tool gateway

use std::io;

use thiserror::Error;

/// Result type alias for the tool gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Tool gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog document rejected
    #[error("Catalog error: {0}")]
    Catalog(#[from] gateway_core::CatalogError),

    /// No catalog binding for the logical tool
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Caller not allowed to invoke the tool
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Backend not configured
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Transport or process level failure reaching a backend
    #[error("Server connection error: {0}")]
    Connection(String),

    /// The backend ran the tool and the tool failed
    #[error("Tool call error: {0}")]
    ToolExecution(String),

    /// The call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `ToolCallResult::complete` called on a finished result
    #[error("Result already completed: {0}")]
    AlreadyCompleted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    ///
    /// Only transport faults qualify. Tool failures are deterministic and a
    /// timed-out call has already spent its budget.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Http(_) | Self::Io(_))
    }

    /// Whether the error means the backend could not be reached in time
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}
