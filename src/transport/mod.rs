//! Transport implementations for MCP backends

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Result, protocol::JsonRpcResponse};

/// One JSON-RPC session with an MCP backend
///
/// Implementations correlate replies themselves. An unreachable backend is
/// [`crate::Error::Connection`]; a reply that misses the per-request deadline
/// is [`crate::Error::Timeout`] and leaves the session usable.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Round-trip `method` and return the raw reply, error object included
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Whether the session can still carry requests
    fn is_connected(&self) -> bool;

    /// Tear down the session; stdio children are killed
    async fn close(&self) -> Result<()>;
}
