//! SQLite driver glue: read-only connections and catalog introspection

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};

use crate::config::DatabaseConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::pool::{ConnectionManager, Pool};
use crate::schema::{ColumnSchema, ForeignKey, SchemaLoader, SchemaSnapshot, TableSchema};

// ============================================================================
// Connection Manager
// ============================================================================

/// Opens read-only connections to one SQLite file
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            path: config.path.clone(),
            busy_timeout: config.busy_timeout(),
        }
    }

    fn open(path: &PathBuf, busy_timeout: Duration) -> GatewayResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let unreachable = |err: rusqlite::Error| {
            GatewayError::DatabaseUnreachable(format!("{}: {}", path.display(), err))
        };

        let conn = Connection::open_with_flags(path, flags).map_err(unreachable)?;
        conn.busy_timeout(busy_timeout).map_err(unreachable)?;
        conn.pragma_update(None, "query_only", true).map_err(unreachable)?;
        // Opening is lazy; touch the header so a bad file fails here
        conn.query_row("SELECT count(*) FROM sqlite_schema", [], |row| row.get::<_, i64>(0))
            .map_err(unreachable)?;
        Ok(conn)
    }
}

#[async_trait]
impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    async fn connect(&self) -> GatewayResult<Connection> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || Self::open(&path, busy_timeout))
            .await
            .map_err(|err| GatewayError::DatabaseUnreachable(format!("connect task failed: {err}")))?
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Reads table, column and foreign-key metadata over a pooled connection
pub struct SqliteCatalog {
    pool: Arc<Pool<SqliteManager>>,
    acquire_timeout: Duration,
}

impl SqliteCatalog {
    pub fn new(pool: Arc<Pool<SqliteManager>>, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }
}

#[async_trait]
impl SchemaLoader for SqliteCatalog {
    async fn load(&self) -> GatewayResult<SchemaSnapshot> {
        let lease = self.pool.acquire(self.acquire_timeout).await?;
        let (lease, result) = tokio::task::spawn_blocking(move || {
            let result = read_catalog(&lease);
            (lease, result)
        })
        .await?;

        match result {
            Ok(tables) => {
                lease.release();
                Ok(SchemaSnapshot::new(tables))
            }
            Err(err) => {
                lease.discard();
                Err(err.into())
            }
        }
    }
}

/// Scan the catalog on one connection
pub fn read_catalog(conn: &Connection) -> rusqlite::Result<BTreeMap<String, TableSchema>> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_schema \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut column_stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let mut fk_stmt = conn.prepare(
        "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;

    let mut tables = BTreeMap::new();
    for name in names {
        let columns = column_stmt
            .query_map([name.as_str()], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    nullable: row.get::<_, i64>(2)? == 0,
                    default: row.get(3)?,
                    primary_key: row.get::<_, i64>(4)? > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // `to` is NULL when the key targets the referenced table's primary key
        let foreign_keys = fk_stmt
            .query_map([name.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        tables.insert(name, (columns, foreign_keys));
    }

    let primary_keys: HashMap<String, String> = tables
        .iter()
        .filter_map(|(name, (columns, _))| {
            columns
                .iter()
                .find(|col| col.primary_key)
                .map(|col| (name.to_ascii_lowercase(), col.name.clone()))
        })
        .collect();

    Ok(tables
        .into_iter()
        .map(|(name, (columns, raw_keys))| {
            let foreign_keys = raw_keys
                .into_iter()
                .map(|(column, references_table, to)| {
                    let references_column = to
                        .or_else(|| primary_keys.get(&references_table.to_ascii_lowercase()).cloned())
                        .unwrap_or_else(|| "rowid".to_string());
                    ForeignKey {
                        column,
                        references_table,
                        references_column,
                    }
                })
                .collect();
            (
                name,
                TableSchema {
                    columns,
                    foreign_keys,
                },
            )
        })
        .collect())
}
