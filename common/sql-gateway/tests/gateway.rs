//! End-to-end tests for the gateway against throwaway SQLite files

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use sql_gateway::{Gateway, GatewayConfig, HealthStatus, QueryResponse, UnknownTablePolicy, Value};
use tempfile::TempDir;

/// Never terminates on its own; only an interrupt stops it
const ENDLESS_QUERY: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT max(x) FROM c";

fn create_shop(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, city TEXT NOT NULL, vip BOOLEAN DEFAULT 0);
         CREATE TABLE orders (
             id INTEGER PRIMARY KEY,
             customer_id INTEGER NOT NULL REFERENCES customers(id),
             price REAL NOT NULL,
             quantity INTEGER NOT NULL,
             placed_at TIMESTAMP
         );
         INSERT INTO customers (city, vip) VALUES ('Chicago', 1), ('Boston', 0), ('Chicago', 0);
         INSERT INTO orders (customer_id, price, quantity, placed_at) VALUES
             (1, 9.5, 2, '2024-02-01 10:00:00'),
             (1, 20.0, 1, '2024-02-03 12:30:00'),
             (3, 4.25, 4, NULL);",
    )
    .unwrap();
}

struct Shop {
    _dir: TempDir,
    config: GatewayConfig,
}

fn shop() -> Shop {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shop.db");
    create_shop(&path);
    Shop {
        config: GatewayConfig::with_database(path),
        _dir: dir,
    }
}

fn success(response: QueryResponse) -> sql_gateway::QueryResult {
    match response {
        QueryResponse::Success(result) => result,
        QueryResponse::Failure { error_code, message } => {
            panic!("query failed with {error_code}: {message}")
        }
    }
}

async fn wait_until_unleased(gateway: &Gateway) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while gateway.pool_status().leased > 0 {
        assert!(Instant::now() < deadline, "lease never came back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn count_customers() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let result = success(gateway.run_query("SELECT COUNT(*) FROM customers", None).await);
    assert_eq!(result.columns, vec!["COUNT(*)"]);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows, vec![vec![Value::Integer(3)]]);
    assert!(!result.truncated);
}

#[tokio::test]
async fn join_with_typed_values() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let result = success(
        gateway
            .run_query(
                "SELECT c.city, c.vip, o.price * o.quantity AS total, o.placed_at \
                 FROM orders o JOIN customers c ON c.id = o.customer_id \
                 ORDER BY o.id",
                None,
            )
            .await,
    );
    assert_eq!(result.columns, vec!["city", "vip", "total", "placed_at"]);
    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows[0][0], Value::Text("Chicago".into()));
    assert_eq!(result.rows[0][1], Value::Boolean(true));
    assert_eq!(result.rows[0][2], Value::Float(19.0));
    assert!(matches!(result.rows[0][3], Value::Timestamp(_)));
    assert_eq!(result.rows[2][3], Value::Null);
}

#[tokio::test]
async fn default_limit_and_row_cap() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.validator.default_limit = 2;
    config.execution.max_rows = 1;
    let gateway = Gateway::open(config).await.unwrap();

    let verdict = gateway.validate("SELECT * FROM customers").await.unwrap();
    let approved = verdict.into_result().unwrap();
    assert!(approved.limit_injected);
    assert!(approved.sql.ends_with("LIMIT 2"));

    let result = success(gateway.run_query("SELECT id FROM customers", None).await);
    assert_eq!(result.row_count, 1);
    assert!(result.truncated);
}

#[tokio::test]
async fn rejected_queries_never_lease_a_connection() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();
    let before = gateway.pool_status();

    for (sql, code) in [
        ("", "EmptyQuery"),
        ("DELETE FROM customers", "ForbiddenStatement"),
        ("SELECT 1; DROP TABLE orders", "MultipleStatements"),
        ("SELECT load_extension('evil.so')", "ForbiddenFunction"),
        ("SELECT * FROM payroll", "UnknownTable"),
        ("SELECT 'unterminated FROM customers", "MalformedQuery"),
    ] {
        let response = gateway.run_query(sql, None).await;
        assert_eq!(response.error_code(), Some(code), "{sql:?}");
    }

    assert_eq!(gateway.pool_status(), before);
    let result = success(gateway.run_query("SELECT COUNT(*) FROM customers", None).await);
    assert_eq!(result.rows, vec![vec![Value::Integer(3)]]);
}

#[tokio::test]
async fn unknown_table_warn_policy_reaches_database() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.validator.unknown_tables = UnknownTablePolicy::Warn;
    let gateway = Gateway::open(config).await.unwrap();

    let verdict = gateway.validate("SELECT * FROM payroll").await.unwrap();
    assert!(verdict.is_approved());

    let response = gateway.run_query("SELECT * FROM payroll", None).await;
    assert_eq!(response.error_code(), Some("ExecutionError"));
    match response {
        QueryResponse::Failure { message, .. } => assert!(message.contains("payroll")),
        QueryResponse::Success(_) => unreachable!(),
    }
}

#[tokio::test]
async fn timeout_interrupts_and_discards_connection() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let started = Instant::now();
    let response = gateway.run_query(ENDLESS_QUERY, Some(200)).await;
    let elapsed = started.elapsed();

    assert_eq!(response.error_code(), Some("TimeoutError"));
    assert!(elapsed >= Duration::from_millis(200), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "returned late: {elapsed:?}");

    // The interrupted connection is closed rather than parked
    wait_until_unleased(&gateway).await;
    assert_eq!(gateway.pool_status().idle, 0);

    let result = success(gateway.run_query("SELECT COUNT(*) FROM orders", None).await);
    assert_eq!(result.rows, vec![vec![Value::Integer(3)]]);
}

#[tokio::test]
async fn acquire_beyond_capacity_reports_pool_exhausted() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.pool.max_size = 1;
    config.pool.acquire_timeout_ms = 100;
    let gateway = Arc::new(Gateway::open(config).await.unwrap());

    let slow = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_query(ENDLESS_QUERY, Some(1_000)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.pool_status().leased, 1);

    let response = gateway.run_query("SELECT COUNT(*) FROM customers", None).await;
    assert_eq!(response.error_code(), Some("PoolExhausted"));

    assert_eq!(slow.await.unwrap().error_code(), Some("TimeoutError"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_share_bounded_pool() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.pool.max_size = 2;
    let gateway = Arc::new(Gateway::open(config).await.unwrap());

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let sql = format!("SELECT COUNT(*) FROM orders WHERE quantity > {}", i % 4);
                let response = gateway.run_query(&sql, None).await;
                assert!(gateway.pool_status().leased <= 2);
                response
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().is_success());
    }
    let status = gateway.pool_status();
    assert_eq!(status.leased, 0);
    assert!(status.idle <= 2);
}

#[tokio::test]
async fn list_schema_is_cached() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let first = gateway.list_schema(false).await.unwrap();
    let second = gateway.list_schema(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let names: Vec<&str> = first.table_names().collect();
    assert_eq!(names, vec!["customers", "orders"]);

    let orders = &first.tables["orders"];
    assert_eq!(orders.columns.len(), 5);
    assert_eq!(orders.foreign_keys[0].references_table, "customers");
    assert!(first.prompt_context().contains("orders.customer_id -> customers.id"));

    let refreshed = gateway.list_schema(true).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(first.tables, refreshed.tables);
}

#[tokio::test]
async fn allowed_tables_restrict_schema_and_queries() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.validator.allowed_tables = Some(vec!["customers".to_string()]);
    let gateway = Gateway::open(config).await.unwrap();

    let schema = gateway.list_schema(false).await.unwrap();
    assert!(schema.has_table("customers"));
    assert!(!schema.has_table("orders"));

    let response = gateway.run_query("SELECT * FROM orders", None).await;
    assert_eq!(response.error_code(), Some("UnknownTable"));
}

#[tokio::test]
async fn parenthesized_tables_stay_inside_allowlist() {
    let shop = shop();
    let conn = Connection::open(&shop.config.database.path).unwrap();
    conn.execute_batch("CREATE TABLE secrets (id INTEGER PRIMARY KEY, token TEXT); INSERT INTO secrets (token) VALUES ('hunter2');")
        .unwrap();
    drop(conn);

    let mut config = shop.config.clone();
    config.validator.allowed_tables = Some(vec!["customers".to_string()]);
    let gateway = Gateway::open(config).await.unwrap();

    for sql in [
        "SELECT * FROM (secrets)",
        "SELECT * FROM customers JOIN (secrets) ON 1 = 1",
        "SELECT sql FROM (sqlite_master)",
    ] {
        let response = gateway.run_query(sql, None).await;
        assert_eq!(response.error_code(), Some("UnknownTable"), "{sql:?}");
    }

    let result = success(gateway.run_query("SELECT COUNT(*) FROM (customers)", None).await);
    assert_eq!(result.rows, vec![vec![Value::Integer(3)]]);
}

#[tokio::test]
async fn lexical_rejections_skip_schema_refresh() {
    let shop = shop();
    let mut config = shop.config.clone();
    config.schema.ttl_secs = 0;
    config.pool.max_size = 1;
    config.pool.acquire_timeout_ms = 200;
    let gateway = Arc::new(Gateway::open(config).await.unwrap());

    let slow = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_query(ENDLESS_QUERY, Some(1_500)).await })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while gateway.pool_status().leased == 0 {
        assert!(Instant::now() < deadline, "endless query never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (sql, code) in [
        ("", "EmptyQuery"),
        ("DROP TABLE customers", "ForbiddenStatement"),
        ("SELECT 1; SELECT 2", "MultipleStatements"),
    ] {
        let response = gateway.run_query(sql, None).await;
        assert_eq!(response.error_code(), Some(code), "{sql:?}");
    }
    assert!(gateway.validate("SELECT 1 + 1").await.unwrap().is_approved());

    // Named tables still need a fresh snapshot, which needs a connection
    let err = gateway.validate("SELECT * FROM customers").await.unwrap_err();
    assert_eq!(err.error_code(), "PoolExhausted");

    assert_eq!(slow.await.unwrap().error_code(), Some("TimeoutError"));
}

#[tokio::test]
async fn health_check_and_close() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let report = gateway.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.error.is_none());
    assert_eq!(report.pool.leased, 0);

    gateway.close();

    let report = gateway.health_check().await;
    assert!(!report.is_healthy());
    assert!(report.error.is_some());

    let response = gateway.run_query("SELECT COUNT(*) FROM customers", None).await;
    assert_eq!(response.error_code(), Some("PoolClosed"));
}

#[tokio::test]
async fn missing_database_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig::with_database(dir.path().join("nope.db"));

    let err = Gateway::open(config).await.err().unwrap();
    assert_eq!(err.error_code(), "DatabaseUnreachable");
}

#[tokio::test]
async fn database_file_is_never_modified() {
    let shop = shop();
    let gateway = Gateway::open(shop.config.clone()).await.unwrap();

    let response = gateway
        .run_query("WITH gone AS (DELETE FROM orders RETURNING id) SELECT * FROM gone", None)
        .await;
    assert_eq!(response.error_code(), Some("ForbiddenStatement"));
    gateway.close();

    let conn = Connection::open(&shop.config.database.path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 3);
}
