//! MySQL connector
//!
//! Row-based binlog replication. The query session (catalog lookups, DML
//! apply, binlog precondition checks) runs over `mysql_async`; the
//! replication session is a raw client that registers as a replica and
//! consumes the binlog dump stream.

mod decoder;
mod protocol;
mod source;

pub use decoder::{
    BinlogDecoder, BinlogEvent, ColumnType, EventHeader, RowChange, RowsEvent, RowsKind,
    TableMapEvent,
};
pub use protocol::{BinlogStream, MySqlBinlogClient};
pub use source::MySqlConnector;
