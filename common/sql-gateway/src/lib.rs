//! SQL Gateway
//!
//! Read-only access to a SQLite database for untrusted callers such as LLM
//! agents. Every query is lexically certified as a single read-only statement,
//! executed on a pooled connection under a deadline, and returned as rows of
//! typed values. A TTL-cached schema snapshot backs both validation and
//! prompt building.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sql_gateway::{Gateway, GatewayConfig};
//!
//! let gateway = Gateway::open(GatewayConfig::with_database("shop.db")).await?;
//! let response = gateway.run_query("SELECT COUNT(*) FROM customers", None).await;
//! let schema = gateway.list_schema(false).await?;
//! println!("{}", schema.prompt_context());
//! gateway.close();
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod lexer;
pub mod pool;
pub mod schema;
pub mod sqlite;
pub mod validator;
pub mod value;

pub use config::{GatewayConfig, UnknownTablePolicy};
pub use error::{GatewayError, GatewayResult, RejectReason};
pub use executor::QueryResult;
pub use gateway::{Gateway, HealthReport, HealthStatus, QueryResponse};
pub use pool::PoolStatus;
pub use schema::{ColumnSchema, ForeignKey, SchemaSnapshot, TableSchema};
pub use validator::{ApprovedQuery, InspectedQuery, QueryValidator, Rejection, ValidationVerdict};
pub use value::Value;
