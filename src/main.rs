//! MCP Tool Gateway
//!
//! Logical tool catalog, server registry, load-balanced routing and audit trail
//! in front of MCP backends.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_tool_gateway::{
    audit::{AuditLogger, AuditQuery},
    catalog::ToolCatalog,
    cli::{AuditCommand, CatalogCommand, Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Catalog(CatalogCommand::Validate { ref file })) => validate_catalog(file),
        Some(Command::Catalog(CatalogCommand::List {
            ref category,
            ref tags,
            ref format,
        })) => match load_config(&cli) {
            Ok(config) => list_catalog(&config, category.as_deref(), tags, format),
            Err(code) => code,
        },
        Some(Command::Audit(AuditCommand::Query {
            ref caller,
            ref tool,
            ref session,
            since,
            until,
            limit,
        })) => {
            let query = AuditQuery {
                start_time: since,
                end_time: until,
                caller_agent: caller.clone(),
                logical_name: tool.clone(),
                session_id: session.clone(),
                limit,
            };
            match load_config(&cli) {
                Ok(config) => query_audit(&config, &query).await,
                Err(code) => code,
            }
        }
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load config: {e}");
        ExitCode::FAILURE
    })
}

fn validate_catalog(file: &std::path::Path) -> ExitCode {
    match ToolCatalog::parse_file(file) {
        Ok(snapshot) => {
            println!("✅ {} - {} tool(s)", file.display(), snapshot.len());
            for collision in snapshot.collisions() {
                println!(
                    "   ⚠️  physical tool '{}' bound by '{}' and '{}' ('{}' wins)",
                    collision.physical_tool,
                    collision.previous,
                    collision.current,
                    collision.current
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {}: {e}", file.display());
            ExitCode::FAILURE
        }
    }
}

fn list_catalog(config: &Config, category: Option<&str>, tags: &[String], format: &str) -> ExitCode {
    let catalog = match ToolCatalog::load(config.catalog.path.clone()) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let tools = catalog.list_tools(category, tags);

    if format == "json" {
        return match serde_json::to_string_pretty(&tools) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize: {e}");
                ExitCode::FAILURE
            }
        };
    }

    println!("{} tool(s) in {}:\n", tools.len(), config.catalog.path.display());
    for tool in &tools {
        println!("  {:<24} {}", tool.logical_name, tool.description);
        for binding in &tool.bindings {
            println!(
                "      → {}@{} [{} p{}{}]",
                binding.physical_tool,
                binding.mcp_server,
                binding.environment,
                binding.priority,
                if binding.enabled { "" } else { ", disabled" }
            );
        }
    }
    ExitCode::SUCCESS
}

async fn query_audit(config: &Config, query: &AuditQuery) -> ExitCode {
    let audit = match AuditLogger::new(&config.audit) {
        Ok(audit) => audit,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match audit.query(query).await {
        Ok(records) => {
            for record in &records {
                match serde_json::to_string(record) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("❌ Failed to serialize record: {e}"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Audit query failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: &Cli) -> ExitCode {
    let mut config = match load_config(cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    info!(
        config = ?cli.config,
        catalog = %config.catalog.path.display(),
        backends = config.enabled_backends().count(),
        "Starting tool gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
