//! PostgreSQL connector
//!
//! Logical replication via the binary `pgoutput` plugin. Two sessions per
//! endpoint: a `tokio-postgres` query session for catalog lookups and DML
//! apply, and a raw replication session speaking the streaming protocol
//! (`START_REPLICATION ... LOGICAL`) over CopyBoth.

pub mod protocol;
mod source;

pub use source::PostgresConnector;
