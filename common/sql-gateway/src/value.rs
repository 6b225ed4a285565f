//! Typed cell values for query results

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

/// A single result cell
///
/// Serialized as `{"type": "...", "value": ...}` so every consumer sees the
/// same shape regardless of the driver's native representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

/// How a column's declared type steers value decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclaredKind {
    Boolean,
    Temporal,
    Other,
}

impl DeclaredKind {
    fn of(decl_type: Option<&str>) -> Self {
        let Some(decl) = decl_type else {
            return DeclaredKind::Other;
        };
        let upper = decl.to_ascii_uppercase();
        if upper.contains("BOOL") {
            DeclaredKind::Boolean
        } else if upper.contains("DATE") || upper.contains("TIME") {
            DeclaredKind::Temporal
        } else {
            DeclaredKind::Other
        }
    }
}

impl Value {
    /// Convert a raw SQLite value, using the column's declared type to
    /// recover booleans and timestamps
    pub fn from_sqlite(raw: SqlValue, decl_type: Option<&str>) -> Self {
        let kind = DeclaredKind::of(decl_type);
        match raw {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) if kind == DeclaredKind::Boolean => Value::Boolean(i != 0),
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(f) => Value::Float(f),
            SqlValue::Text(s) if kind == DeclaredKind::Temporal => match parse_timestamp(&s) {
                Some(ts) => Value::Timestamp(ts),
                None => Value::Text(s),
            },
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(b) => Value::Text(format!("<blob {} bytes>", b.len())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

    let text = text.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
