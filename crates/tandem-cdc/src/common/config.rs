//! Validated configuration record
//!
//! The relay core never reads the environment or parses CLI arguments; it
//! consumes this record fully formed. `tandemd` deserializes it from a JSON
//! file and calls [`RelayConfig::validate`] before anything connects.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Database engine behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Postgresql,
    Mysql,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Postgresql => write!(f, "postgresql"),
            EndpointKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// One replicated endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable identifier, used in stream names and loop-guard markers
    pub id: String,
    /// Engine type
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// PostgreSQL: logical replication slot name
    #[serde(default)]
    pub slot_name: Option<String>,
    /// PostgreSQL: publication name
    #[serde(default)]
    pub publication: Option<String>,
    /// MySQL: replica server id, unique across all participants
    #[serde(default)]
    pub server_id: Option<u32>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("id", &self.id)
            .field("type", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("slot_name", &self.slot_name)
            .field("publication", &self.publication)
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// Conflict-resolution strategy for bidirectional mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newest timestamp wins; ties break on source id
    LastWriteWins,
    /// Endpoint A always wins
    SourcePriority,
    /// Endpoint B always wins
    TargetPriority,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

/// Synchronization tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enable_bidirectional: bool,
    #[serde(default)]
    pub conflict_resolution: ConflictStrategy,
    /// Tables to replicate (unqualified names, same set on both endpoints)
    pub tables: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_seconds: u64,
    #[serde(default = "default_conflict_window")]
    pub conflict_window_seconds: u64,
    /// Skip events that fail permanently instead of halting the stream
    #[serde(default)]
    pub skip_poison: bool,
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_checkpoint_interval() -> u64 {
    5
}

fn default_conflict_window() -> u64 {
    5
}

/// Where durable relay state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub offset_storage_path: PathBuf,
    pub schema_storage_path: PathBuf,
    /// JSONL sink for poison events; disabled when unset
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,
}

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub a: EndpointConfig,
    pub b: EndpointConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

impl RelayConfig {
    /// Validate the record. All failures are `Error::Config`.
    pub fn validate(&self) -> Result<()> {
        if self.a.id.is_empty() || self.b.id.is_empty() {
            return Err(Error::config("endpoint ids must not be empty"));
        }
        if self.a.id == self.b.id {
            return Err(Error::config(format!(
                "endpoint ids must differ, both are '{}'",
                self.a.id
            )));
        }
        if self.sync.tables.is_empty() {
            return Err(Error::config("no tables configured for replication"));
        }
        if self.sync.batch_size < 1 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        for endpoint in [&self.a, &self.b] {
            validate_endpoint(endpoint)?;
        }
        if self.a.kind == EndpointKind::Mysql
            && self.b.kind == EndpointKind::Mysql
            && self.a.server_id == self.b.server_id
        {
            return Err(Error::config(
                "MySQL endpoints must use distinct server_id values",
            ));
        }
        Ok(())
    }
}

fn validate_endpoint(endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.host.is_empty() {
        return Err(Error::config(format!(
            "endpoint '{}' has no host",
            endpoint.id
        )));
    }
    match endpoint.kind {
        EndpointKind::Postgresql => {
            let slot = endpoint
                .slot_name
                .as_deref()
                .ok_or_else(|| missing(endpoint, "slot_name"))?;
            let publication = endpoint
                .publication
                .as_deref()
                .ok_or_else(|| missing(endpoint, "publication"))?;
            // NAMEDATALEN - 1
            for (field, value) in [("slot_name", slot), ("publication", publication)] {
                if value.is_empty() || value.len() > 63 {
                    return Err(Error::config(format!(
                        "endpoint '{}': {} must be 1..=63 characters",
                        endpoint.id, field
                    )));
                }
                if !value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(Error::config(format!(
                        "endpoint '{}': {} may only contain [a-zA-Z0-9_]",
                        endpoint.id, field
                    )));
                }
            }
        }
        EndpointKind::Mysql => {
            match endpoint.server_id {
                Some(0) | None => {
                    return Err(Error::config(format!(
                        "endpoint '{}': MySQL endpoints need a nonzero server_id",
                        endpoint.id
                    )))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn missing(endpoint: &EndpointConfig, field: &str) -> Error {
    Error::config(format!(
        "endpoint '{}': {} is required for {}",
        endpoint.id, field, endpoint.kind
    ))
}

/// The checkpoint key for a direction. Keeps the two directions of a
/// bidirectional deployment independently resumable.
pub fn stream_name(source_id: &str, target_id: &str) -> String {
    format!("{source_id}->{target_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(id: &str) -> EndpointConfig {
        EndpointConfig {
            id: id.into(),
            kind: EndpointKind::Postgresql,
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "replicator".into(),
            password: "secret".into(),
            slot_name: Some("tandem_slot".into()),
            publication: Some("tandem_pub".into()),
            server_id: None,
        }
    }

    fn my(id: &str) -> EndpointConfig {
        EndpointConfig {
            id: id.into(),
            kind: EndpointKind::Mysql,
            host: "localhost".into(),
            port: 3306,
            database: "app".into(),
            user: "replicator".into(),
            password: "secret".into(),
            slot_name: None,
            publication: None,
            server_id: Some(4001),
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            a: pg("pg-primary"),
            b: my("mysql-primary"),
            sync: SyncConfig {
                enable_bidirectional: true,
                conflict_resolution: ConflictStrategy::LastWriteWins,
                tables: vec!["users".into()],
                batch_size: 1000,
                max_retries: 3,
                checkpoint_interval_seconds: 5,
                conflict_window_seconds: 5,
                skip_poison: false,
            },
            storage: StorageConfig {
                offset_storage_path: "/var/lib/tandem/offsets".into(),
                schema_storage_path: "/var/lib/tandem/schemas".into(),
                dead_letter_path: None,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut cfg = config();
        cfg.b.id = cfg.a.id.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_tables() {
        let mut cfg = config();
        cfg.sync.tables.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_postgres_requires_slot_and_publication() {
        let mut cfg = config();
        cfg.a.slot_name = None;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.a.publication = Some("x".repeat(64));
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.a.slot_name = Some("bad-dash".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mysql_requires_server_id() {
        let mut cfg = config();
        cfg.b.server_id = None;
        assert!(cfg.validate().is_err());
        let mut cfg = config();
        cfg.b.server_id = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let out = format!("{:?}", pg("a"));
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("a", "b"), "a->b");
        assert_ne!(stream_name("a", "b"), stream_name("b", "a"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "a": {"id":"a","type":"postgresql","host":"h","port":5432,
                  "database":"d","user":"u","password":"p",
                  "slot_name":"s","publication":"pub"},
            "b": {"id":"b","type":"mysql","host":"h","port":3306,
                  "database":"d","user":"u","password":"p","server_id":7},
            "sync": {"tables":["users"]},
            "storage": {"offset_storage_path":"/tmp/o","schema_storage_path":"/tmp/s"}
        }"#;
        let cfg: RelayConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.sync.batch_size, 1000);
        assert_eq!(cfg.sync.conflict_resolution, ConflictStrategy::LastWriteWins);
        assert!(!cfg.sync.enable_bidirectional);
    }
}
