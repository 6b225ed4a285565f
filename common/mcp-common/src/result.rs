//! Tool result builders

use rmcp::{
    model::{CallToolResult, Content},
    ErrorData as McpError,
};
use serde::Serialize;

/// Pretty-printed JSON success
pub fn json_success<T: Serialize>(data: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(data).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Plain text success
pub fn text_success(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

/// Tool-level failure carrying `{"errorCode", "message"}`
///
/// The call itself completes; only `isError` is set.
pub fn coded_error(error_code: &str, message: &str) -> CallToolResult {
    let body = serde_json::json!({
        "errorCode": error_code,
        "message": message,
    });
    CallToolResult::error(vec![Content::text(body.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(result: &CallToolResult) -> (serde_json::Value, bool) {
        let json = serde_json::to_value(result).unwrap();
        let text = json["content"][0]["text"].as_str().unwrap().to_string();
        (serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)), json["isError"] == true)
    }

    #[test]
    fn test_coded_error_shape() {
        let (value, is_error) = body(&coded_error("UnknownTable", "no such table: payroll"));
        assert!(is_error);
        assert_eq!(value, serde_json::json!({"errorCode": "UnknownTable", "message": "no such table: payroll"}));
    }

    #[test]
    fn test_json_success_is_not_an_error() {
        let result = json_success(&serde_json::json!({"rowCount": 2})).unwrap();
        let (value, is_error) = body(&result);
        assert!(!is_error);
        assert_eq!(value["rowCount"], 2);
    }

    #[test]
    fn test_text_success_keeps_text() {
        let (value, is_error) = body(&text_success("customers(id INTEGER PK)"));
        assert!(!is_error);
        assert_eq!(value, "customers(id INTEGER PK)");
    }
}
