//! Per-table schema metadata tracking
//!
//! Decoding a binlog row image needs the table's column ordering and the
//! position of its primary-key column; the binlog itself usually carries
//! neither (with the default minimal row metadata). The decoder owns one
//! [`MetadataCache`] seeded from the tracked-table configuration and keeps
//! it current from table-map records and DDL-triggered refreshes. Catalog
//! lookups go through the [`SchemaIntrospector`] collaborator so the cache
//! itself stays free of I/O.

use std::collections::HashMap;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use tracing::{debug, warn};

use crate::config::TableConfig;

/// Primary-key index value meaning "not resolved yet".
pub const PK_UNRESOLVED: i32 = -1;

/// Cached schema for one tracked table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    /// Configured primary-key column name. Empty for placeholder metadata.
    pub pk_name: String,
    /// Index of the primary-key column within `columns`, or
    /// [`PK_UNRESOLVED`].
    pub pk_index: i32,
    /// Ordered column names; empty until resolved.
    pub columns: Vec<String>,
}

impl TableMeta {
    /// Metadata for a tracked table before its columns are known.
    pub fn unresolved(pk_name: impl Into<String>) -> Self {
        Self {
            pk_name: pk_name.into(),
            pk_index: PK_UNRESOLVED,
            columns: Vec::new(),
        }
    }

    /// Stand-in for a table that was never configured. Column names and
    /// the primary key degrade to positional handling.
    pub fn placeholder() -> Self {
        Self {
            pk_name: String::new(),
            pk_index: PK_UNRESOLVED,
            columns: Vec::new(),
        }
    }
}

/// Resolves a table's ordered column names from the schema catalog.
///
/// Failure is reported as an empty list (plus a log line), never an error:
/// decoding degrades to positional columns rather than halting.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn columns(&self, schema: &str, table: &str) -> Vec<String>;
}

/// Catalog introspector backed by `INFORMATION_SCHEMA.COLUMNS`.
pub struct MySqlIntrospector {
    pool: mysql_async::Pool,
}

impl MySqlIntrospector {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, schema: &str, table: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let columns: Vec<String> = conn
            .exec(
                r"SELECT COLUMN_NAME
                  FROM INFORMATION_SCHEMA.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await?;
        Ok(columns)
    }
}

#[async_trait]
impl SchemaIntrospector for MySqlIntrospector {
    async fn columns(&self, schema: &str, table: &str) -> Vec<String> {
        match self.fetch(schema, table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!("failed to query columns for {schema}.{table}: {e:#}");
                Vec::new()
            }
        }
    }
}

fn table_key(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

/// Single-owner cache of [`TableMeta`], keyed by `schema.table`.
///
/// Entries are created at startup for every configured table and live for
/// the process lifetime.
pub struct MetadataCache {
    tables: HashMap<String, TableMeta>,
}

impl MetadataCache {
    /// Seed the cache from the tracked-table configuration. Primary-key
    /// indexes start unresolved.
    pub fn from_tables(schema: &str, tables: &[TableConfig]) -> Self {
        let tables = tables
            .iter()
            .map(|t| (table_key(schema, &t.name), TableMeta::unresolved(&t.pk)))
            .collect();
        Self { tables }
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<&TableMeta> {
        self.tables.get(&table_key(schema, table))
    }

    pub fn is_tracked(&self, schema: &str, table: &str) -> bool {
        self.tables.contains_key(&table_key(schema, table))
    }

    /// Handle a table-map record for a tracked table.
    ///
    /// Column ordering comes from inline metadata when the log carried it,
    /// else from the catalog. An unknown answer leaves the entry untouched
    /// so a later record can retry.
    pub async fn observe_table_map(
        &mut self,
        schema: &str,
        table: &str,
        inline_columns: Option<Vec<String>>,
        introspector: &dyn SchemaIntrospector,
    ) {
        let key = table_key(schema, table);
        if !self.tables.contains_key(&key) {
            return;
        }

        let columns = match inline_columns {
            Some(columns) if !columns.is_empty() => columns,
            _ => introspector.columns(schema, table).await,
        };
        if columns.is_empty() {
            warn!("column metadata missing for table {key}, skipping pk index detection");
            return;
        }

        if let Some(meta) = self.tables.get_mut(&key) {
            meta.columns = columns;
            resolve_pk(&key, meta);
        }
    }

    /// Re-resolve every tracked table from the catalog. Called when a DDL
    /// statement may have changed any table definition; the invalidation
    /// is deliberately table-name-insensitive.
    pub async fn refresh_all(&mut self, introspector: &dyn SchemaIntrospector) {
        let keys: Vec<String> = self.tables.keys().cloned().collect();
        for key in keys {
            let (schema, table) = match key.split_once('.') {
                Some(parts) => parts,
                None => continue,
            };
            let columns = introspector.columns(schema, table).await;
            if columns.is_empty() {
                debug!("no columns resolved for {key} during refresh, keeping previous metadata");
                continue;
            }
            if let Some(meta) = self.tables.get_mut(&key) {
                meta.columns = columns;
                resolve_pk(&key, meta);
            }
        }
    }
}

/// Linear name scan for the primary-key column; first match wins. A miss
/// falls back to index 0 with a warning since dropping events would be
/// worse than mis-tagging their key.
fn resolve_pk(key: &str, meta: &mut TableMeta) {
    meta.pk_index = PK_UNRESOLVED;
    for (i, column) in meta.columns.iter().enumerate() {
        if column == &meta.pk_name {
            meta.pk_index = i as i32;
            break;
        }
    }

    if meta.pk_index == PK_UNRESOLVED {
        warn!(
            "pk column {} not found in table {key}, falling back to first column",
            meta.pk_name
        );
        meta.pk_index = 0;
    }
}
