//! SQL Gateway MCP Server
//!
//! Serves read-only SQL access over stdio.
//!
//! # Usage
//!
//! Run directly: `sql-gateway-mcp --database shop.db`
//!
//! Or configure in `.mcp.json`:
//! ```json
//! { "mcpServers": { "sql": { "command": "./sql-gateway-mcp", "args": ["--database", "shop.db"] } } }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use sql_gateway::Gateway;
use sql_gateway_mcp::{config, SqlGatewayServer};

/// Filter used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "sql_gateway=info,sql_gateway_mcp=info";

#[derive(Parser)]
#[command(name = "sql-gateway-mcp")]
#[command(about = "Read-only SQL gateway MCP server")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "SQL_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config file)
    #[arg(long, env = "SQL_GATEWAY_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mcp_common::init_tracing(DEFAULT_LOG_FILTER)?;

    let mut gateway_config = config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        gateway_config.database.path = database;
    }

    tracing::info!("Starting sql_gateway_mcp MCP Server");

    let gateway = Gateway::open(gateway_config)
        .await
        .context("Failed to open SQL gateway")?;
    let gateway = Arc::new(gateway);

    let server = SqlGatewayServer::new(Arc::clone(&gateway));
    let service = server.serve(rmcp::transport::stdio()).await?;

    tracing::info!("Server running, waiting for requests...");

    service.waiting().await?;

    gateway.close();
    tracing::info!("Server shutting down");
    Ok(())
}
