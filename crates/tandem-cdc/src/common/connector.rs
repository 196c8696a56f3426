//! The connector capability set
//!
//! One trait, two sibling implementations (PostgreSQL, MySQL), and a factory
//! keyed on the engine tag. A connector owns its database sessions: a query
//! session for catalog lookups and DML apply, and a replication session for
//! log streaming.

use crate::common::{
    ChangeEvent, EndpointConfig, EndpointKind, Error, Position, PositionFlavor, RelayConfig,
    Result, SchemaCache, TableSchema,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of applying one event at the target.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Event is durably applied (includes idempotent no-ops such as a
    /// DELETE of an already-missing row)
    Applied,
    /// Failed, worth retrying with backoff
    Transient(Error),
    /// Failed and will keep failing for this event
    Permanent(Error),
    /// Failed in a way that suggests the cached schema is stale
    SchemaDrift(Error),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Per-engine replication plugin.
///
/// `start_streaming` hands back the receiving end of a bounded channel; the
/// connector's reader task writes decoded events into it and the channel
/// bound provides backpressure. The stream ends only on shutdown or on a
/// replication-session failure, and a connector instance cannot stream
/// twice.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Endpoint identifier this connector serves.
    fn endpoint_id(&self) -> &str;

    /// Which position flavor this connector emits.
    fn position_flavor(&self) -> PositionFlavor;

    /// Open the query session (and whatever the replication session needs
    /// later). Classifies failures into `ConnAuth`, `ConnUnreachable`,
    /// `ConnProtocolUnsupported`.
    async fn connect(&mut self) -> Result<()>;

    /// Ensure engine-side CDC objects exist and match the configuration.
    /// Idempotent; mismatches fail with `CdcPrecondition`.
    async fn setup_cdc(&mut self, tables: &[String]) -> Result<()>;

    /// Begin tailing the log. `from` resumes after the given position;
    /// `None` starts at the server's current position.
    async fn start_streaming(
        &mut self,
        from: Option<Position>,
    ) -> Result<mpsc::Receiver<ChangeEvent>>;

    /// Catalog lookup for one table (callers go through the shared
    /// [`SchemaCache`]).
    async fn get_table_schema(&self, table: &str) -> Result<TableSchema>;

    /// Apply one event through the query session.
    async fn apply_change(&self, event: &ChangeEvent) -> ApplyOutcome;

    /// The server's current head position.
    async fn get_current_position(&self) -> Result<Position>;

    /// Tell the source that everything up to `pos` is durable at the
    /// target. PostgreSQL advances the slot's flushed LSN; MySQL advances
    /// the connector's resume pointer.
    async fn confirm_position(&mut self, pos: &Position) -> Result<()>;

    /// Close sessions and stop the reader task.
    async fn close(&mut self) -> Result<()>;
}

/// Build the connector for an endpoint.
///
/// `peer_id` identifies the opposite endpoint; the apply session marks its
/// writes with it so the peer's tailer can tell relay writes from user
/// writes.
pub fn connector_for(
    endpoint: &EndpointConfig,
    peer_id: &str,
    config: &RelayConfig,
    schema_cache: Arc<SchemaCache>,
) -> Result<Box<dyn Connector>> {
    match endpoint.kind {
        EndpointKind::Postgresql => Ok(Box::new(crate::postgres::PostgresConnector::new(
            endpoint.clone(),
            peer_id,
            config.sync.batch_size,
            schema_cache,
        ))),
        EndpointKind::Mysql => Ok(Box::new(crate::mysql::MySqlConnector::new(
            endpoint.clone(),
            peer_id,
            config.sync.batch_size,
            schema_cache,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_outcome_predicates() {
        assert!(ApplyOutcome::Applied.is_applied());
        assert!(!ApplyOutcome::Transient(Error::transient("x")).is_applied());
        assert!(!ApplyOutcome::Permanent(Error::permanent("x")).is_applied());
    }
}
