//! MCP Tool Gateway Library
//!
//! Resolves caller-facing *logical* tool names to healthy *physical*
//! backend instances, invokes them, and keeps an audit trail of every call.
//!
//! # Components
//!
//! - **Catalog**: logical tool → bindings (server, physical tool, environment, priority)
//! - **Registry**: live server directory with a hysteresis health state machine
//! - **Routing**: round robin, weighted, consistent hash and random selection
//! - **Backends**: one session per MCP server process with retries and timeouts
//! - **Audit**: append-only, date-partitioned JSONL trail
//! - **Gateway**: the `call_tool` pipeline plus the registry HTTP surface

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
