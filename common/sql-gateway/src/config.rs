//! Gateway configuration
//!
//! All sections are optional in TOML; missing fields fall back to defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Root
// ============================================================================

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl GatewayConfig {
    /// Default configuration pointing at a specific database file
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseConfig {
                path: path.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Database location and driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (opened read-only)
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// How long SQLite waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("database.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Connection pool sizing and lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections opened at startup (at least one is always opened)
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Upper bound on simultaneously open connections
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle connections older than this are closed
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Bound on opening a single connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long `acquire` waits for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    10
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            max_idle_secs: default_max_idle_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// What to do when a query references a table missing from the schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTablePolicy {
    /// Refuse the query with `UnknownTable`
    #[default]
    Reject,
    /// Log a warning and let the query through
    Warn,
}

/// Query validator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// LIMIT appended to queries that have none
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    #[serde(default)]
    pub unknown_tables: UnknownTablePolicy,
    /// Restrict the readable tables to this set (case-insensitive)
    #[serde(default)]
    pub allowed_tables: Option<Vec<String>>,
}

fn default_limit() -> u64 {
    1_000
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            unknown_tables: UnknownTablePolicy::default(),
            allowed_tables: None,
        }
    }
}

/// Schema cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Seconds a snapshot stays fresh
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl SchemaConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Query execution bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Deadline applied when the caller gives none
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ceiling for caller-supplied deadlines
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Rows materialized before the result is marked truncated
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_timeout_ms() -> u64 {
    120_000
}

fn default_max_rows() -> usize {
    10_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_rows: default_max_rows(),
        }
    }
}

impl ExecutionConfig {
    /// Resolve a per-call override against the default and the ceiling
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.timeout_ms)
            .min(self.max_timeout_ms.max(1));
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.validator.default_limit, 1000);
        assert_eq!(config.validator.unknown_tables, UnknownTablePolicy::Reject);
        assert_eq!(config.schema.ttl(), Duration::from_secs(300));
        assert_eq!(config.execution.timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [database]
            path = "/srv/shop.db"

            [pool]
            max_size = 4

            [validator]
            unknown_tables = "warn"
            allowed_tables = ["customers", "orders"]
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/srv/shop.db"));
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.validator.unknown_tables, UnknownTablePolicy::Warn);
        assert_eq!(
            config.validator.allowed_tables.as_deref(),
            Some(&["customers".to_string(), "orders".to_string()][..])
        );
    }

    #[test]
    fn test_effective_timeout_is_clamped() {
        let exec = ExecutionConfig {
            timeout_ms: 30_000,
            max_timeout_ms: 60_000,
            max_rows: 10,
        };
        assert_eq!(exec.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(exec.effective_timeout(Some(0)), Duration::from_secs(30));
        assert_eq!(exec.effective_timeout(Some(500)), Duration::from_millis(500));
        assert_eq!(exec.effective_timeout(Some(600_000)), Duration::from_secs(60));
    }
}
