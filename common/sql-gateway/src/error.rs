//! Error taxonomy for the gateway
//!
//! Every failure a caller can observe maps to one [`GatewayError`] variant with
//! a stable code. Validation failures carry a [`RejectReason`] and never reach
//! the database.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the validator refused a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Input was empty, whitespace, or only comments
    EmptyQuery,
    /// More than one statement (or a stacked terminator) was submitted
    MultipleStatements,
    /// A mutating or non-selector keyword appeared in the token stream
    ForbiddenStatement,
    /// An administrative or server-state function was called
    ForbiddenFunction,
    /// A referenced table is not part of the schema snapshot
    UnknownTable,
    /// Unterminated literal, quoted identifier, or block comment
    MalformedQuery,
}

impl RejectReason {
    /// Stable code reported to callers
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::EmptyQuery => "EmptyQuery",
            RejectReason::MultipleStatements => "MultipleStatements",
            RejectReason::ForbiddenStatement => "ForbiddenStatement",
            RejectReason::ForbiddenFunction => "ForbiddenFunction",
            RejectReason::UnknownTable => "UnknownTable",
            RejectReason::MalformedQuery => "MalformedQuery",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

fn describe_rejection(reason: &RejectReason, fragment: &str) -> String {
    match reason {
        RejectReason::EmptyQuery => "query is empty".to_string(),
        RejectReason::MultipleStatements => {
            format!("only a single statement is allowed, found more near `{}`", fragment)
        }
        RejectReason::ForbiddenStatement => {
            format!("`{}` is not allowed; only SELECT queries are accepted", fragment)
        }
        RejectReason::ForbiddenFunction => format!("function `{}` is not allowed", fragment),
        RejectReason::UnknownTable => format!("table `{}` is not in the schema", fragment),
        RejectReason::MalformedQuery => format!("unterminated literal or comment near `{}`", fragment),
    }
}

/// Errors surfaced by gateway operations
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{}", describe_rejection(.reason, .fragment))]
    Rejected {
        reason: RejectReason,
        fragment: String,
    },

    #[error("no database connection available after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("database unreachable: {0}")]
    DatabaseUnreachable(String),

    #[error("query exceeded the {timeout:?} timeout")]
    Timeout { timeout: Duration },

    #[error("{code}: {message}")]
    Execution { code: String, message: String },
}

impl GatewayError {
    /// Build a validation rejection
    pub fn rejected(reason: RejectReason, fragment: impl Into<String>) -> Self {
        GatewayError::Rejected {
            reason,
            fragment: fragment.into(),
        }
    }

    /// Stable code for the error kind
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Rejected { reason, .. } => reason.code(),
            GatewayError::PoolExhausted { .. } => "PoolExhausted",
            GatewayError::PoolClosed => "PoolClosed",
            GatewayError::DatabaseUnreachable(_) => "DatabaseUnreachable",
            GatewayError::Timeout { .. } => "TimeoutError",
            GatewayError::Execution { .. } => "ExecutionError",
        }
    }

    /// True for failures the validator produced without touching the database
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => sqlite_code_name(failure.code),
            rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..) => {
                "SQLITE_MISMATCH".to_string()
            }
            _ => "SQLITE_ERROR".to_string(),
        };
        GatewayError::Execution {
            code,
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        GatewayError::Execution {
            code: "TASK_FAILED".to_string(),
            message: err.to_string(),
        }
    }
}

fn sqlite_code_name(code: rusqlite::ErrorCode) -> String {
    use rusqlite::ErrorCode;

    let name = match code {
        ErrorCode::Unknown => "SQLITE_ERROR",
        ErrorCode::PermissionDenied => "SQLITE_PERM",
        ErrorCode::AuthorizationForStatementDenied => "SQLITE_AUTH",
        ErrorCode::ReadOnly => "SQLITE_READONLY",
        ErrorCode::DatabaseBusy => "SQLITE_BUSY",
        ErrorCode::DatabaseLocked => "SQLITE_LOCKED",
        ErrorCode::OperationInterrupted => "SQLITE_INTERRUPT",
        ErrorCode::ConstraintViolation => "SQLITE_CONSTRAINT",
        ErrorCode::TypeMismatch => "SQLITE_MISMATCH",
        ErrorCode::TooBig => "SQLITE_TOOBIG",
        ErrorCode::OutOfMemory => "SQLITE_NOMEM",
        ErrorCode::CannotOpen => "SQLITE_CANTOPEN",
        ErrorCode::NotADatabase => "SQLITE_NOTADB",
        ErrorCode::DatabaseCorrupt => "SQLITE_CORRUPT",
        ErrorCode::SystemIoFailure => "SQLITE_IOERR",
        ErrorCode::SchemaChanged => "SQLITE_SCHEMA",
        ErrorCode::ApiMisuse => "SQLITE_MISUSE",
        other => return format!("{:?}", other),
    };
    name.to_string()
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_taxonomy() {
        assert_eq!(
            GatewayError::rejected(RejectReason::EmptyQuery, "").error_code(),
            "EmptyQuery"
        );
        assert_eq!(
            GatewayError::Timeout {
                timeout: Duration::from_secs(1)
            }
            .error_code(),
            "TimeoutError"
        );
        assert_eq!(
            GatewayError::Execution {
                code: "SQLITE_ERROR".into(),
                message: "boom".into()
            }
            .error_code(),
            "ExecutionError"
        );
        assert_eq!(
            GatewayError::PoolExhausted {
                waited: Duration::from_millis(5)
            }
            .error_code(),
            "PoolExhausted"
        );
    }

    #[test]
    fn test_rejection_message_names_fragment() {
        let err = GatewayError::rejected(RejectReason::ForbiddenStatement, "DROP");
        assert!(err.to_string().contains("`DROP`"));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_sqlite_failure_maps_to_execution_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: GatewayError = conn.prepare("SELECT * FROM missing").unwrap_err().into();
        match err {
            GatewayError::Execution { code, message } => {
                assert_eq!(code, "SQLITE_ERROR");
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
