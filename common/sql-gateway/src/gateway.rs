//! The gateway facade: validate, execute, introspect
//!
//! A [`Gateway`] owns the pool, the schema cache and the idle reaper. Open it
//! once, share it behind an `Arc`, and [`Gateway::close`] it on shutdown.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::executor::{QueryExecutor, QueryResult};
use crate::pool::{Pool, PoolOptions, PoolStatus};
use crate::schema::{SchemaCache, SchemaSnapshot};
use crate::sqlite::{SqliteCatalog, SqliteManager};
use crate::validator::{QueryValidator, ValidationVerdict};

// ============================================================================
// Response Types
// ============================================================================

/// Outcome of [`Gateway::run_query`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Success(QueryResult),
    #[serde(rename_all = "camelCase")]
    Failure { error_code: String, message: String },
}

impl QueryResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryResponse::Success(_))
    }

    /// Error code of a failed query
    pub fn error_code(&self) -> Option<&str> {
        match self {
            QueryResponse::Success(_) => None,
            QueryResponse::Failure { error_code, .. } => Some(error_code),
        }
    }
}

impl From<GatewayResult<QueryResult>> for QueryResponse {
    fn from(result: GatewayResult<QueryResult>) -> Self {
        match result {
            Ok(result) => QueryResponse::Success(result),
            Err(err) => QueryResponse::Failure {
                error_code: err.error_code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of [`Gateway::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pool: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Read-only SQL gateway over one SQLite database
pub struct Gateway {
    config: GatewayConfig,
    pool: Arc<Pool<SqliteManager>>,
    schema: SchemaCache<SqliteCatalog>,
    validator: QueryValidator,
    executor: QueryExecutor,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Open the pool, warm the schema cache and start the idle reaper
    ///
    /// Fails with `DatabaseUnreachable` when no connection can be opened.
    pub async fn open(config: GatewayConfig) -> GatewayResult<Self> {
        tracing::info!(database = %config.database.path.display(), "Opening SQL gateway");

        let options = PoolOptions::from(&config.pool);
        let pool = Pool::open(SqliteManager::new(&config.database), options).await?;
        let acquire_timeout = config.pool.acquire_timeout();

        let mut schema = SchemaCache::new(
            SqliteCatalog::new(Arc::clone(&pool), acquire_timeout),
            config.schema.ttl(),
        );
        if let Some(tables) = &config.validator.allowed_tables {
            schema = schema.with_allowed_tables(tables);
        }

        let gateway = Self {
            validator: QueryValidator::new(&config.validator),
            executor: QueryExecutor::new(Arc::clone(&pool), acquire_timeout, config.execution.max_rows),
            reaper: Mutex::new(Some(spawn_reaper(Arc::downgrade(&pool), config.pool.max_idle()))),
            schema,
            pool,
            config,
        };

        if let Err(err) = gateway.schema.get_schema(false).await {
            tracing::warn!(error = %err, "Initial schema load failed, will retry on demand");
        }
        Ok(gateway)
    }

    /// Stop the reaper and close the pool; later calls fail with `PoolClosed`
    pub fn close(&self) {
        let reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = reaper {
            handle.abort();
        }
        self.schema.invalidate();
        self.pool.close();
    }

    /// Validate and execute `sql`, reporting failures as a structured response
    pub async fn run_query(&self, sql: &str, timeout_ms: Option<u64>) -> QueryResponse {
        self.query(sql, timeout_ms).await.into()
    }

    /// Validate and execute `sql`
    pub async fn query(&self, sql: &str, timeout_ms: Option<u64>) -> GatewayResult<QueryResult> {
        let approved = self.validate(sql).await?.into_result()?;
        let timeout = self.config.execution.effective_timeout(timeout_ms);
        tracing::debug!(
            sql = %approved.sql,
            limit_injected = approved.limit_injected,
            timeout_ms = timeout.as_millis() as u64,
            "Executing approved query"
        );
        self.executor.execute(&approved.sql, timeout).await
    }

    /// Validate `sql` against the current schema snapshot without running it
    ///
    /// Lexical rejections and table-free queries never consult the schema
    /// cache, so they cannot wait on the pool.
    pub async fn validate(&self, sql: &str) -> GatewayResult<ValidationVerdict> {
        let inspected = match self.validator.inspect(sql) {
            Ok(inspected) => inspected,
            Err(rejection) => return Ok(ValidationVerdict::Rejected(rejection)),
        };
        let inspected = match inspected.approve_tableless() {
            Ok(approved) => return Ok(ValidationVerdict::Approved(approved)),
            Err(inspected) => inspected,
        };
        let schema = self.schema.get_schema(false).await?;
        Ok(self.validator.check_tables(inspected, &schema))
    }

    /// Schema snapshot, cached for the configured TTL
    pub async fn list_schema(&self, force_refresh: bool) -> GatewayResult<Arc<SchemaSnapshot>> {
        self.schema.get_schema(force_refresh).await
    }

    /// Check that a pooled connection answers `SELECT 1`
    pub async fn health_check(&self) -> HealthReport {
        let outcome = self.ping().await;
        let pool = self.pool.status();
        match outcome {
            Ok(()) => HealthReport {
                status: HealthStatus::Healthy,
                pool,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "Health check failed");
                HealthReport {
                    status: HealthStatus::Unhealthy,
                    pool,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn ping(&self) -> GatewayResult<()> {
        let lease = self.pool.acquire(self.config.pool.acquire_timeout()).await?;
        let (lease, result) = tokio::task::spawn_blocking(move || {
            let result = lease.query_row("SELECT 1", [], |row| row.get::<_, i64>(0));
            (lease, result)
        })
        .await?;

        match result {
            Ok(1) => {
                lease.release();
                Ok(())
            }
            Ok(other) => {
                lease.discard();
                Err(GatewayError::Execution {
                    code: "SQLITE_ERROR".to_string(),
                    message: format!("SELECT 1 returned {other}"),
                })
            }
            Err(err) => {
                lease.discard();
                Err(err.into())
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let reaper = self.reaper.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = reaper {
            handle.abort();
        }
    }
}

/// Periodically close idle connections past `max_idle`
///
/// Holds only a weak reference so a dropped pool ends the task.
fn spawn_reaper(pool: Weak<Pool<SqliteManager>>, max_idle: Duration) -> JoinHandle<()> {
    let period = (max_idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            pool.reap_idle();
        }
    })
}
