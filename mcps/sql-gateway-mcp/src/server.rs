//! SQL gateway MCP server implementation

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError,
};
use schemars::JsonSchema;
use serde::Deserialize;
use mcp_common::{coded_error, json_success, text_success};
use sql_gateway::{Gateway, GatewayError, QueryResponse};

// ============================================================================
// Parameter Types
// ============================================================================

/// Output format for get_schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SchemaFormat {
    /// Full snapshot as JSON
    #[default]
    Json,
    /// Compact text for prompt context
    Prompt,
}

/// Parameters for get_schema tool
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct SchemaParams {
    /// Bypass the cache and re-read the catalog
    pub force_refresh: Option<bool>,
    /// "json" (default) or "prompt"
    pub format: Option<SchemaFormat>,
}

/// Parameters for read_query tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadQueryParams {
    /// A single SELECT (or WITH ... SELECT) statement
    pub query: String,
    /// Statement timeout in milliseconds; clamped to the server maximum
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Server Implementation
// ============================================================================

/// MCP front end for a [`Gateway`]
#[derive(Clone)]
pub struct SqlGatewayServer {
    gateway: Arc<Gateway>,
    tool_router: ToolRouter<Self>,
}

impl SqlGatewayServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            tool_router: Self::tool_router(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[tool_router]
impl SqlGatewayServer {
    /// Describe the readable tables
    #[tool(description = "Get the database schema: tables, columns with types and nullability, primary and foreign keys. Use format='prompt' for a compact text rendering. Results are cached; set force_refresh=true after schema changes.")]
    async fn get_schema(&self, Parameters(params): Parameters<SchemaParams>) -> Result<CallToolResult, McpError> {
        let force_refresh = params.force_refresh.unwrap_or(false);
        let snapshot = match self.gateway.list_schema(force_refresh).await {
            Ok(snapshot) => snapshot,
            Err(err) => return Ok(from_gateway_error(&err)),
        };

        match params.format.unwrap_or_default() {
            SchemaFormat::Json => json_success(&*snapshot),
            SchemaFormat::Prompt => Ok(text_success(snapshot.prompt_context())),
        }
    }

    /// Run a validated read-only query
    #[tool(description = "Execute a read-only SQL query (a single SELECT or WITH statement). Mutating statements, multiple statements, administrative functions and unknown tables are rejected before reaching the database. A LIMIT is added when missing. Returns columns, typed rows, rowCount and elapsedMs.")]
    async fn read_query(&self, Parameters(params): Parameters<ReadQueryParams>) -> Result<CallToolResult, McpError> {
        match self.gateway.run_query(&params.query, params.timeout_ms).await {
            QueryResponse::Success(result) => json_success(&result),
            QueryResponse::Failure { error_code, message } => {
                tracing::info!(error_code = %error_code, "Query refused or failed");
                Ok(coded_error(&error_code, &message))
            }
        }
    }

    /// Report database reachability
    #[tool(description = "Check that the database answers queries. Returns status (healthy/unhealthy) and connection pool occupancy.")]
    async fn health_check(&self) -> Result<CallToolResult, McpError> {
        let report = self.gateway.health_check().await;
        json_success(&report)
    }
}

fn from_gateway_error(err: &GatewayError) -> CallToolResult {
    coded_error(err.error_code(), &err.to_string())
}

#[tool_handler]
impl rmcp::ServerHandler for SqlGatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Read-only SQL gateway. Call get_schema first (format='prompt' for a compact view), \
                then read_query with a single SELECT statement. Use health_check to verify the \
                database is reachable."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
