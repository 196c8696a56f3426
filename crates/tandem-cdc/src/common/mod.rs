//! Database-agnostic building blocks of the relay:
//!
//! - [`ChangeEvent`] - normalized row-change representation
//! - [`Value`] / [`Row`] - typed column values
//! - [`Position`] - source-log positions with per-flavor ordering
//! - [`Connector`] - capability set implemented per engine
//! - [`SchemaCache`] - read-through table metadata cache
//! - [`OffsetStore`] - durable stream checkpoints
//! - [`ConflictResolver`] / [`LoopGuard`] - bidirectional soundness
//! - [`Pipeline`] - the per-direction orchestrator
//! - [`StreamCounters`] - per-stream observability counters

mod apply;
mod config;
mod conflict;
mod connector;
pub mod error;
mod event;
mod metrics;
mod offsets;
mod pipeline;
mod position;
mod resilience;
pub mod schema;
mod value;

pub use apply::{delete_sql, insert_sql, update_sql, SqlDialect, StatementCache};
pub use config::{
    stream_name, ConflictStrategy, EndpointConfig, EndpointKind, RelayConfig, StorageConfig,
    SyncConfig,
};
pub use conflict::{row_key, AppliedChange, ConflictResolver, ConflictWindow, LoopGuard, Resolution};
pub use connector::{connector_for, ApplyOutcome, Connector};
pub use error::{Error, Result};
pub use event::{ChangeEvent, Op};
pub use metrics::{CountersSnapshot, StreamCounters};
pub use offsets::{OffsetEntry, OffsetStore};
pub use pipeline::{shutdown_channel, Pipeline, PipelineOptions, StreamState};
pub use position::{Position, PositionFlavor};
pub use resilience::ExponentialBackoff;
pub use schema::{ColumnDef, SchemaCache, TableSchema};
pub use value::{Row, Value};
