//! PostgreSQL replication protocol plumbing
//!
//! - [`message`] - pgoutput logical message shapes
//! - [`decoder`] - binary pgoutput v1 decoding
//! - [`client`] - replication-mode TCP client (CopyBoth streaming,
//!   standby status updates)

mod client;
mod decoder;
mod message;

pub use client::{ReplicationClient, ReplicationStream, WalFrame};
pub use decoder::{decode_message, DecodeError};
pub use message::{
    BeginBody, Column, CommitBody, DeleteBody, InsertBody, LogicalMessage, OriginBody,
    RelationBody, TruncateBody, Tuple, TupleData, TypeBody, UpdateBody, COLUMN_FLAG_KEY,
};
