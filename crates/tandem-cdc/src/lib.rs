//! # tandem-cdc - Bidirectional CDC relay core
//!
//! Tails the native replication log of one relational database and applies
//! the decoded row changes to a peer, in both directions at once when
//! configured. PostgreSQL is captured via logical replication (`pgoutput`),
//! MySQL via row-based binlog replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                        ┌──────────────┐
//! │ PostgreSQL   │                        │    MySQL     │
//! │     WAL      │                        │    Binlog    │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                   Connector trait                    │
//! └──────┬───────────────────────────────────────┬───────┘
//!        │ ChangeEvent                           │ ChangeEvent
//!        ▼                                       ▼
//! ┌──────────────┐  loop guard / conflicts  ┌──────────────┐
//! │ Pipeline A→B │◄────────────────────────►│ Pipeline B→A │
//! └──────┬───────┘                          └──────┬───────┘
//!        │ apply + checkpoint                      │
//!        ▼                                         ▼
//!      MySQL                                  PostgreSQL
//! ```
//!
//! Each pipeline runs a reader task (blocked on log I/O), a writer task
//! (blocked on target DML), and a periodic checkpoint task. Delivery is
//! at-least-once; the apply engine is idempotent at the row level, which
//! yields effective exactly-once for converged state.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example(config_json: &str) -> tandem_cdc::Result<()> {
//! use tandem_cdc::{connector_for, RelayConfig, SchemaCache};
//! use std::sync::Arc;
//!
//! let config: RelayConfig = serde_json::from_str(config_json)?;
//! config.validate()?;
//!
//! let schema_cache = Arc::new(SchemaCache::new());
//! let source = connector_for(&config.a, &config.b.id, &config, Arc::clone(&schema_cache))?;
//! let target = connector_for(&config.b, &config.a.id, &config, schema_cache)?;
//! # let _ = (source, target);
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod mysql;
pub mod postgres;

pub use common::{
    connector_for, row_key, shutdown_channel, stream_name, ApplyOutcome, ChangeEvent, ColumnDef,
    ConflictResolver, ConflictStrategy, ConflictWindow, Connector, CountersSnapshot,
    EndpointConfig, EndpointKind, Error, ExponentialBackoff, LoopGuard, OffsetEntry, OffsetStore,
    Op, Pipeline, PipelineOptions, Position, PositionFlavor, RelayConfig, Result, Row,
    SchemaCache, StorageConfig, StreamCounters, StreamState, SyncConfig, TableSchema, Value,
};
