//! Durable stream offsets
//!
//! One `offsets.json` maps stream names to the last position that was
//! applied and committed at the target. The file is rewritten through a
//! temp file, fsynced, then renamed, so a crash can never leave a torn
//! record. A position read back on restart is therefore always safe to
//! resume from.

use crate::common::{Error, Position, PositionFlavor, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One persisted stream offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub position: String,
    pub flavor: PositionFlavor,
    pub timestamp: DateTime<Utc>,
}

impl OffsetEntry {
    /// The entry's position in comparator form.
    pub fn position(&self) -> Position {
        Position {
            flavor: self.flavor,
            value: self.position.clone(),
        }
    }
}

/// File-backed offset store.
pub struct OffsetStore {
    file_path: PathBuf,
    cache: RwLock<HashMap<String, OffsetEntry>>,
}

impl OffsetStore {
    /// Open (or create) the store under `dir`. Loads any existing offsets.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::offset_io(format!("create {}: {e}", dir.display())))?;
        let file_path = dir.join("offsets.json");

        let cache = match fs::read(&file_path).await {
            Ok(bytes) => {
                let loaded: HashMap<String, OffsetEntry> = serde_json::from_slice(&bytes)
                    .map_err(|e| {
                        Error::offset_io(format!("parse {}: {e}", file_path.display()))
                    })?;
                info!(
                    path = %file_path.display(),
                    streams = loaded.len(),
                    "loaded offsets"
                );
                loaded
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::offset_io(format!(
                    "read {}: {e}",
                    file_path.display()
                )))
            }
        };

        Ok(Self {
            file_path,
            cache: RwLock::new(cache),
        })
    }

    /// Last confirmed position for a stream, if any.
    pub async fn get(&self, stream: &str) -> Option<OffsetEntry> {
        self.cache.read().await.get(stream).cloned()
    }

    /// Persist a confirmed position. The caller guarantees every event at or
    /// below `position` has been applied and committed at the target.
    pub async fn put(
        &self,
        stream: &str,
        position: &Position,
        wall_time: DateTime<Utc>,
    ) -> Result<()> {
        let entry = OffsetEntry {
            position: position.value.clone(),
            flavor: position.flavor,
            timestamp: wall_time,
        };

        let snapshot = {
            let mut cache = self.cache.write().await;
            cache.insert(stream.to_string(), entry);
            cache.clone()
        };

        self.write_atomic(&snapshot).await?;
        debug!(stream, position = %position, "offset persisted");
        Ok(())
    }

    /// All known stream names.
    pub async fn list(&self) -> Vec<String> {
        self.cache.read().await.keys().cloned().collect()
    }

    async fn write_atomic(&self, snapshot: &HashMap<String, OffsetEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| Error::offset_io(format!("serialize offsets: {e}")))?;

        let tmp_path = self.file_path.with_extension("json.tmp");
        let io_err =
            |what: &str, e: std::io::Error| Error::offset_io(format!("{what}: {e}"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| io_err("open temp offsets file", e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| io_err("write offsets", e))?;
        file.sync_all()
            .await
            .map_err(|e| io_err("fsync offsets", e))?;
        drop(file);

        fs::rename(&tmp_path, &self.file_path)
            .await
            .map_err(|e| io_err("rename offsets into place", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_absent_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::open(dir.path()).await.unwrap();
        assert!(store.get("a->b").await.is_none());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::open(dir.path()).await.unwrap();

        let pos = Position::postgres_lsn(0x1_0000_0010);
        store.put("a->b", &pos, Utc::now()).await.unwrap();

        let entry = store.get("a->b").await.unwrap();
        assert_eq!(entry.position, "1/10");
        assert_eq!(entry.flavor, PositionFlavor::PostgresLsn);
        assert_eq!(entry.position(), pos);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OffsetStore::open(dir.path()).await.unwrap();
            store
                .put("a->b", &Position::mysql_binlog("mysql-bin.000002", 4242), Utc::now())
                .await
                .unwrap();
            store
                .put("b->a", &Position::postgres_lsn(0x99), Utc::now())
                .await
                .unwrap();
        }

        let store = OffsetStore::open(dir.path()).await.unwrap();
        let entry = store.get("a->b").await.unwrap();
        assert_eq!(entry.position, "mysql-bin.000002:4242");
        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::open(dir.path()).await.unwrap();
        store
            .put("a->b", &Position::postgres_lsn(0x10), Utc::now())
            .await
            .unwrap();
        store
            .put("a->b", &Position::postgres_lsn(0x20), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.get("a->b").await.unwrap().position, "0/20");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("offsets.json"), b"{not json")
            .await
            .unwrap();
        let err = OffsetStore::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, Error::OffsetIo(_)));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::open(dir.path()).await.unwrap();
        store
            .put("a->b", &Position::postgres_lsn(0x10), Utc::now())
            .await
            .unwrap();
        assert!(!dir.path().join("offsets.json.tmp").exists());
        assert!(dir.path().join("offsets.json").exists());
    }
}
