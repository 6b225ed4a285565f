//! SQL Gateway MCP Library
//!
//! Exposes a read-only [`sql_gateway::Gateway`] as MCP tools:
//! `get_schema`, `read_query` and `health_check`.
//!
//! # Usage as Library
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sql_gateway::{Gateway, GatewayConfig};
//! use sql_gateway_mcp::SqlGatewayServer;
//!
//! let gateway = Gateway::open(GatewayConfig::with_database("shop.db")).await?;
//! let server = SqlGatewayServer::new(Arc::new(gateway));
//! // Serve via stdio or an in-memory transport
//! ```

pub mod config;
pub mod server;

pub use server::SqlGatewayServer;

// Re-export parameter types for direct API usage
pub use server::{ReadQueryParams, SchemaFormat, SchemaParams};
