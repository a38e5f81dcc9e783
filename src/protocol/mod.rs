//! MCP protocol messages used to talk to backend servers

mod messages;

pub use messages::*;

/// MCP protocol version sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2025-11-25";
