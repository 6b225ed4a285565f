//! Schema snapshots and the introspection cache
//!
//! The cache serves a shared [`SchemaSnapshot`] until its TTL runs out. Reads
//! of a fresh snapshot are lock-free; refreshes are serialized so concurrent
//! callers share one catalog scan instead of issuing their own.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::GatewayResult;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// Foreign key from one column to a column of another table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Table metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns in declaration order
    pub columns: Vec<ColumnSchema>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Point-in-time view of the readable tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: BTreeMap<String, TableSchema>) -> Self {
        Self {
            tables,
            fetched_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Case-insensitive table lookup
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.keys().any(|table| table.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Keep only tables named in `allowed` (case-insensitive)
    pub fn restrict_to(&mut self, allowed: &HashSet<String>) {
        self.tables
            .retain(|name, _| allowed.contains(&name.to_ascii_lowercase()));
    }

    /// Compact text rendering for LLM prompts
    ///
    /// ```text
    /// customers(id INTEGER PK, email VARCHAR(100) NOT NULL)
    /// orders(id INTEGER PK, customer_id INTEGER)
    ///   orders.customer_id -> customers.id
    /// ```
    pub fn prompt_context(&self) -> String {
        let mut out = String::new();
        for (name, table) in &self.tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|col| {
                    let mut desc = col.name.clone();
                    if !col.data_type.is_empty() {
                        desc.push(' ');
                        desc.push_str(&col.data_type);
                    }
                    if !col.nullable {
                        desc.push_str(" NOT NULL");
                    }
                    if col.primary_key {
                        desc.push_str(" PK");
                    }
                    desc
                })
                .collect();
            let _ = writeln!(out, "{}({})", name, columns.join(", "));
            for fk in &table.foreign_keys {
                let _ = writeln!(
                    out,
                    "  {}.{} -> {}.{}",
                    name, fk.column, fk.references_table, fk.references_column
                );
            }
        }
        out
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Source of fresh snapshots (one catalog scan per call)
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self) -> GatewayResult<SchemaSnapshot>;
}

struct CachedSchema {
    snapshot: Arc<SchemaSnapshot>,
    loaded_at: Instant,
}

/// TTL cache over a [`SchemaLoader`]
pub struct SchemaCache<L> {
    loader: L,
    ttl: Duration,
    allowed: Option<HashSet<String>>,
    current: ArcSwapOption<CachedSchema>,
    refresh: Mutex<()>,
}

impl<L: SchemaLoader> SchemaCache<L> {
    pub fn new(loader: L, ttl: Duration) -> Self {
        Self {
            loader,
            ttl,
            allowed: None,
            current: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
        }
    }

    /// Only expose the named tables in snapshots
    pub fn with_allowed_tables(mut self, tables: &[String]) -> Self {
        self.allowed = Some(tables.iter().map(|t| t.to_ascii_lowercase()).collect());
        self
    }

    /// Return the cached snapshot, loading it when cold, stale, or forced
    pub async fn get_schema(&self, force_refresh: bool) -> GatewayResult<Arc<SchemaSnapshot>> {
        if !force_refresh {
            if let Some(snapshot) = self.fresh() {
                return Ok(snapshot);
            }
        }

        let requested_at = Instant::now();
        let _guard = self.refresh.lock().await;

        // A refresh that finished while we waited answers this request too
        if let Some(cached) = self.current.load_full() {
            let reloaded_since_request = cached.loaded_at >= requested_at;
            let still_fresh = !force_refresh && cached.loaded_at.elapsed() < self.ttl;
            if reloaded_since_request || still_fresh {
                return Ok(Arc::clone(&cached.snapshot));
            }
        }

        let mut snapshot = self.loader.load().await?;
        if let Some(allowed) = &self.allowed {
            snapshot.restrict_to(allowed);
        }
        tracing::info!(
            tables = snapshot.tables.len(),
            forced = force_refresh,
            "Schema snapshot refreshed"
        );

        let snapshot = Arc::new(snapshot);
        self.current.store(Some(Arc::new(CachedSchema {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
        })));
        Ok(snapshot)
    }

    /// Cached snapshot if still within the TTL
    pub fn fresh(&self) -> Option<Arc<SchemaSnapshot>> {
        let guard = self.current.load();
        let cached = (*guard).as_ref()?;
        (cached.loaded_at.elapsed() < self.ttl).then(|| Arc::clone(&cached.snapshot))
    }

    /// Drop the cached snapshot; the next read reloads
    pub fn invalidate(&self) {
        self.current.store(None);
    }
}
