//! Runs approved queries on pooled connections under a deadline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};
use crate::pool::Pool;
use crate::sqlite::SqliteManager;
use crate::value::Value;

/// VM instructions between cancellation checks
const PROGRESS_OPS: i32 = 1_000;

/// Materialized result set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
    /// Rows stopped at the `max_rows` cap
    pub truncated: bool,
}

/// Execution engine over the connection pool
pub struct QueryExecutor {
    pool: Arc<Pool<SqliteManager>>,
    acquire_timeout: Duration,
    max_rows: usize,
}

impl QueryExecutor {
    pub fn new(pool: Arc<Pool<SqliteManager>>, acquire_timeout: Duration, max_rows: usize) -> Self {
        Self {
            pool,
            acquire_timeout,
            max_rows: max_rows.max(1),
        }
    }

    /// Execute `sql` with `timeout` bounding the statement itself
    ///
    /// On timeout the statement is interrupted and its connection discarded.
    pub async fn execute(&self, sql: &str, timeout: Duration) -> GatewayResult<QueryResult> {
        let lease = self.pool.acquire(self.acquire_timeout).await?;
        let interrupt = lease.get_interrupt_handle();
        let cancelled = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        let sql_owned = sql.to_string();
        let max_rows = self.max_rows;
        let flag = Arc::clone(&cancelled);
        let task = tokio::task::spawn_blocking(move || {
            let result = run_statement(&lease, &sql_owned, max_rows, &flag);
            (lease, result)
        });

        let (lease, result) = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(done)) => done,
            Ok(Err(join_err)) => return Err(join_err.into()),
            Err(_) => {
                // The blocking task still owns the lease; once interrupted it
                // returns and the dropped lease closes the connection. The flag
                // covers a statement that has not started yet.
                cancelled.store(true, Ordering::Release);
                interrupt.interrupt();
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Query timed out, interrupted");
                return Err(GatewayError::Timeout { timeout });
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((columns, rows, truncated)) => {
                lease.release();
                tracing::debug!(rows = rows.len(), elapsed_ms, truncated, "Query executed");
                Ok(QueryResult {
                    row_count: rows.len(),
                    columns,
                    rows,
                    elapsed_ms,
                    truncated,
                })
            }
            Err(err) => {
                lease.discard();
                tracing::warn!(error = %err, "Query failed, connection discarded");
                Err(err.into())
            }
        }
    }
}

type Materialized = (Vec<String>, Vec<Vec<Value>>, bool);

/// Run `sql`, stopping with `SQLITE_INTERRUPT` once `cancelled` is set
fn run_statement(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
    cancelled: &Arc<AtomicBool>,
) -> rusqlite::Result<Materialized> {
    if cancelled.load(Ordering::Acquire) {
        return Err(interrupted());
    }
    let flag = Arc::clone(cancelled);
    conn.progress_handler(PROGRESS_OPS, Some(move || flag.load(Ordering::Acquire)));
    let result = materialize(conn, sql, max_rows);
    conn.progress_handler(0, None::<fn() -> bool>);
    result
}

fn interrupted() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
        Some("query cancelled before it started".to_string()),
    )
}

fn materialize(conn: &Connection, sql: &str, max_rows: usize) -> rusqlite::Result<Materialized> {
    let mut stmt = conn.prepare(sql)?;
    let decl_types: Vec<Option<String>> = stmt
        .columns()
        .iter()
        .map(|col| col.decl_type().map(str::to_string))
        .collect();
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        if rows.len() == max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(columns.len());
        for (i, decl) in decl_types.iter().enumerate() {
            let raw: rusqlite::types::Value = row.get(i)?;
            values.push(Value::from_sqlite(raw, decl.as_deref()));
        }
        rows.push(values);
    }

    Ok((columns, rows, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, active BOOLEAN, at TIMESTAMP, note TEXT);
             INSERT INTO events (active, at, note) VALUES (1, '2024-01-02 03:04:05', 'first');
             INSERT INTO events (active, at, note) VALUES (0, NULL, 'second');
             INSERT INTO events (active, at, note) VALUES (1, '2024-05-06', NULL);",
        )
        .unwrap();
        conn
    }

    fn run(conn: &Connection, sql: &str, max_rows: usize) -> rusqlite::Result<Materialized> {
        run_statement(conn, sql, max_rows, &Arc::new(AtomicBool::new(false)))
    }

    const ENDLESS: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT max(x) FROM c";

    fn is_interrupt(err: &rusqlite::Error) -> bool {
        err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted)
    }

    #[test]
    fn test_cancelled_before_start_never_runs() {
        let conn = fixture();
        let cancelled = Arc::new(AtomicBool::new(true));
        let err = run_statement(&conn, ENDLESS, 10, &cancelled).unwrap_err();
        assert!(is_interrupt(&err), "{err:?}");
        assert_eq!(GatewayError::from(err).error_code(), "ExecutionError");
    }

    #[test]
    fn test_cancel_flag_stops_running_statement() {
        let conn = fixture();
        let cancelled = Arc::new(AtomicBool::new(false));
        let setter = {
            let cancelled = Arc::clone(&cancelled);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                cancelled.store(true, Ordering::Release);
            })
        };

        let started = Instant::now();
        let err = run_statement(&conn, ENDLESS, 10, &cancelled).unwrap_err();
        setter.join().unwrap();
        assert!(is_interrupt(&err), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // The handler is removed afterwards, so the connection stays usable
        let (_, rows, _) = run(&conn, "SELECT COUNT(*) FROM events", 10).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(3)]]);
    }

    #[test]
    fn test_run_statement_types_values() {
        let (columns, rows, truncated) =
            run(&fixture(), "SELECT id, active, at, note FROM events ORDER BY id", 100).unwrap();
        assert_eq!(columns, vec!["id", "active", "at", "note"]);
        assert_eq!(rows.len(), 3);
        assert!(!truncated);
        assert_eq!(rows[0][0], Value::Integer(1));
        assert_eq!(rows[0][1], Value::Boolean(true));
        assert!(matches!(rows[0][2], Value::Timestamp(_)));
        assert_eq!(rows[1][2], Value::Null);
        assert!(rows[2][3].is_null());
    }

    #[test]
    fn test_run_statement_truncates_at_cap() {
        let (_, rows, truncated) = run(&fixture(), "SELECT id FROM events", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn test_exact_cap_is_not_truncated() {
        let (_, rows, truncated) = run(&fixture(), "SELECT id FROM events", 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(!truncated);
    }

    #[test]
    fn test_expression_columns_have_no_declared_type() {
        let (columns, rows, _) =
            run(&fixture(), "SELECT COUNT(*) AS n FROM events", 10).unwrap();
        assert_eq!(columns, vec!["n"]);
        assert_eq!(rows, vec![vec![Value::Integer(3)]]);
    }
}
