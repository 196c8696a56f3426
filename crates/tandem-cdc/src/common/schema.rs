//! Table metadata and the shared schema cache
//!
//! Read-through cache keyed by `(endpoint, schema, table)`. Entries are
//! immutable snapshots behind `Arc`; invalidation swaps the snapshot out
//! atomically, readers keep whatever they already hold. Connectors own the
//! catalog queries; this module owns caching and optional on-disk snapshots.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One column of a replicated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Engine type name as reported by the catalog (`integer`, `varchar`, ...)
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// Immutable schema snapshot for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDef>,
    /// Primary-key column names; order is significant for composite keys
    pub primary_keys: Vec<String>,
    /// Secondary index names, informational
    pub indexes: Vec<String>,
}

impl TableSchema {
    /// Look up a column definition by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// True when the table has a primary key and every PK column exists.
    pub fn has_usable_pk(&self) -> bool {
        !self.primary_keys.is_empty()
            && self.primary_keys.iter().all(|pk| self.column(pk).is_some())
    }
}

/// Process-wide schema cache, shared read-mostly across connectors.
pub struct SchemaCache {
    entries: RwLock<HashMap<(String, String, String), Arc<TableSchema>>>,
    /// Snapshot directory; `None` disables persistence
    storage_path: Option<PathBuf>,
}

impl SchemaCache {
    /// In-memory cache only.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            storage_path: None,
        }
    }

    /// Cache with JSON snapshots under `path`.
    pub fn with_storage(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            storage_path: Some(path.into()),
        }
    }

    /// Fetch a cached snapshot.
    pub async fn get(&self, endpoint: &str, schema: &str, table: &str) -> Option<Arc<TableSchema>> {
        let key = cache_key(endpoint, schema, table);
        if let Some(entry) = self.entries.read().await.get(&key) {
            return Some(Arc::clone(entry));
        }
        // Miss: try the on-disk snapshot before the caller hits the catalog.
        if let Some(snapshot) = self.load_snapshot(endpoint, schema, table).await {
            let snapshot = Arc::new(snapshot);
            self.entries
                .write()
                .await
                .insert(key, Arc::clone(&snapshot));
            return Some(snapshot);
        }
        None
    }

    /// Install a fresh snapshot, replacing any previous one.
    pub async fn insert(&self, endpoint: &str, table_schema: TableSchema) -> Arc<TableSchema> {
        let key = cache_key(endpoint, &table_schema.schema, &table_schema.table);
        let entry = Arc::new(table_schema);
        self.persist_snapshot(endpoint, &entry).await;
        self.entries.write().await.insert(key, Arc::clone(&entry));
        entry
    }

    /// Drop one table's snapshot. The next read goes back to the catalog.
    pub async fn invalidate(&self, endpoint: &str, schema: &str, table: &str) {
        let key = cache_key(endpoint, schema, table);
        if self.entries.write().await.remove(&key).is_some() {
            debug!(endpoint, schema, table, "schema cache entry invalidated");
        }
        if let Some(path) = self.snapshot_path(endpoint, schema, table) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Drop every snapshot for an endpoint (DDL seen with no table hint).
    pub async fn invalidate_endpoint(&self, endpoint: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|(ep, _, _), _| ep != endpoint);
        debug!(endpoint, "schema cache flushed for endpoint");
    }

    /// Number of cached snapshots.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn snapshot_path(&self, endpoint: &str, schema: &str, table: &str) -> Option<PathBuf> {
        self.storage_path
            .as_ref()
            .map(|dir| dir.join(format!("{endpoint}__{schema}__{table}.json")))
    }

    async fn load_snapshot(&self, endpoint: &str, schema: &str, table: &str) -> Option<TableSchema> {
        let path = self.snapshot_path(endpoint, schema, table)?;
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(?path, error = %e, "discarding unreadable schema snapshot");
                None
            }
        }
    }

    async fn persist_snapshot(&self, endpoint: &str, entry: &TableSchema) {
        let Some(path) = self.snapshot_path(endpoint, &entry.schema, &entry.table) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(?path, error = %e, "failed to persist schema snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize schema snapshot"),
        }
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(endpoint: &str, schema: &str, table: &str) -> (String, String, String) {
    (endpoint.to_string(), schema.to_string(), table.to_string())
}

/// Shared error helper for connectors that require a primary key.
pub fn require_pk(schema: &TableSchema) -> Result<()> {
    if schema.has_usable_pk() {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "table {}.{} has no primary key; replicated tables must have one",
            schema.schema, schema.table
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "users".into(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: "bigint".into(),
                    nullable: false,
                    default: None,
                },
                ColumnDef {
                    name: "name".into(),
                    data_type: "text".into(),
                    nullable: true,
                    default: None,
                },
            ],
            primary_keys: vec!["id".into()],
            indexes: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = SchemaCache::new();
        assert!(cache.get("a", "public", "users").await.is_none());

        cache.insert("a", users_schema()).await;
        let entry = cache.get("a", "public", "users").await.unwrap();
        assert_eq!(entry.primary_keys, vec!["id".to_string()]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = SchemaCache::new();
        cache.insert("a", users_schema()).await;
        cache.invalidate("a", "public", "users").await;
        assert!(cache.get("a", "public", "users").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_keeps_other_endpoints() {
        let cache = SchemaCache::new();
        cache.insert("a", users_schema()).await;
        cache.insert("b", users_schema()).await;
        cache.invalidate_endpoint("a").await;
        assert!(cache.get("a", "public", "users").await.is_none());
        assert!(cache.get("b", "public", "users").await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_persistence_survives_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::with_storage(dir.path());
        cache.insert("a", users_schema()).await;

        // Fresh cache over the same directory picks the snapshot up on miss.
        let cache2 = SchemaCache::with_storage(dir.path());
        let entry = cache2.get("a", "public", "users").await.unwrap();
        assert_eq!(entry.table, "users");
    }

    #[test]
    fn test_usable_pk() {
        let mut schema = users_schema();
        assert!(schema.has_usable_pk());
        assert!(require_pk(&schema).is_ok());

        schema.primary_keys.clear();
        assert!(!schema.has_usable_pk());
        assert!(require_pk(&schema).is_err());

        schema.primary_keys = vec!["ghost".into()];
        assert!(!schema.has_usable_pk());
    }

    #[test]
    fn test_column_lookup() {
        let schema = users_schema();
        assert!(schema.column("ID").is_some());
        assert!(schema.column("missing").is_none());
        assert_eq!(schema.column_names(), vec!["id", "name"]);
    }
}
