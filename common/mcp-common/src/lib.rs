//! MCP Common - Shared plumbing for MCP servers
//!
//! - **Initialization**: [`init_tracing`] routes logs to stderr, leaving
//!   stdout to the protocol
//! - **Results**: helpers for building `CallToolResult` responses, including
//!   [`coded_error`] for failures a model should read and react to
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_common::{coded_error, json_success};
//!
//! mcp_common::init_tracing("my_mcp=info")?;
//!
//! fn lookup(&self) -> Result<CallToolResult, McpError> {
//!     match find() {
//!         Ok(found) => json_success(&found),
//!         Err(err) => Ok(coded_error("NotFound", &err.to_string())),
//!     }
//! }
//! ```

pub mod init;
pub mod result;

pub use init::{init_tracing, LogFormat};
pub use result::{coded_error, json_success, text_success};

// Re-export rmcp types that are commonly needed
pub use rmcp::{
    model::{CallToolResult, Content},
    ErrorData as McpError,
};
