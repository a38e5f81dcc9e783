//! Command-line interface

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::config::humantime_serde::parse_duration;

/// Tool gateway for MCP backends - logical tool catalog, registry, routing and audit
#[derive(Parser, Debug)]
#[command(name = "mcp-tool-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOL_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOOL_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOOL_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOOL_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOL_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Tool catalog commands
    #[command(subcommand)]
    Catalog(CatalogCommand),

    /// Audit trail commands
    #[command(subcommand)]
    Audit(AuditCommand),
}

/// Catalog subcommands
#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// Validate a catalog document
    Validate {
        /// Path to catalog YAML file
        #[arg(required = true)]
        file: PathBuf,
    },

    /// List tools in the configured catalog
    List {
        /// Only tools in this category
        #[arg(long)]
        category: Option<String>,

        /// Only tools carrying any of these tags
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Audit subcommands
#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Print matching audit records, most recent first
    Query {
        /// Only calls by this caller
        #[arg(long)]
        caller: Option<String>,

        /// Only calls of this logical tool
        #[arg(long)]
        tool: Option<String>,

        /// Only calls in this session
        #[arg(long)]
        session: Option<String>,

        /// Calls started after this time (RFC 3339, or an age such as "2h")
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Calls started before this time (RFC 3339, or an age such as "30m")
        #[arg(long, value_parser = parse_since)]
        until: Option<DateTime<Utc>>,

        /// Maximum records
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

/// Parse an RFC 3339 timestamp, or an age relative to now
///
/// # Errors
///
/// Returns a message if the value is neither.
pub fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let age = parse_duration(value).map_err(|_| {
        format!("'{value}' is neither an RFC 3339 timestamp nor a duration like 2h")
    })?;
    let age = chrono::Duration::from_std(age).map_err(|e| e.to_string())?;
    Utc::now()
        .checked_sub_signed(age)
        .ok_or_else(|| format!("'{value}' reaches before the earliest timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["mcp-tool-gateway", "--port", "4000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(4000));
    }

    #[test]
    fn test_audit_query_arguments() {
        let cli = Cli::try_parse_from([
            "mcp-tool-gateway",
            "audit",
            "query",
            "--caller",
            "netops",
            "--since",
            "2026-01-01T00:00:00Z",
            "--limit",
            "5",
        ])
        .unwrap();
        let Some(Command::Audit(AuditCommand::Query {
            caller,
            since,
            limit,
            ..
        })) = cli.command
        else {
            panic!("expected audit query");
        };
        assert_eq!(caller.as_deref(), Some("netops"));
        assert_eq!(since.unwrap().to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(limit, Some(5));
    }

    #[test]
    fn test_parse_since_age() {
        let since = parse_since("2h").unwrap();
        let age = Utc::now() - since;
        assert!(age >= chrono::Duration::minutes(119));
        assert!(age <= chrono::Duration::minutes(121));
        assert!(parse_since("yesterday").is_err());
    }
}
