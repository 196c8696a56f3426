//! pgoutput logical replication messages (protocol version 1)

use bytes::Bytes;

/// Flag bit on a relation column that is part of the replica identity key.
pub const COLUMN_FLAG_KEY: u8 = 0x01;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    /// Transaction begin
    Begin(BeginBody),
    /// Transaction commit
    Commit(CommitBody),
    /// Upstream origin of the following transaction
    Origin(OriginBody),
    /// Relation (table) metadata; precedes first reference in a session
    Relation(RelationBody),
    /// Custom type metadata
    Type(TypeBody),
    /// Row insert
    Insert(InsertBody),
    /// Row update
    Update(UpdateBody),
    /// Row delete
    Delete(DeleteBody),
    /// Table truncate
    Truncate(TruncateBody),
}

#[derive(Debug, Clone)]
pub struct BeginBody {
    /// LSN of the transaction's commit record
    pub final_lsn: u64,
    /// Commit timestamp, microseconds since the PostgreSQL epoch
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    /// Commit timestamp, microseconds since the PostgreSQL epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: u64,
    /// Replication origin name set by the upstream session
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    /// 'd' default, 'n' nothing, 'f' full, 'i' index
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

impl RelationBody {
    /// Names of the replica-identity key columns, in column order.
    pub fn key_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.flags & COLUMN_FLAG_KEY != 0)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    /// Type OID
    pub type_id: i32,
    pub type_mode: i32,
}

#[derive(Debug, Clone)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old row: key columns only ('K') or the full row ('O'); absent when
    /// no key column changed under REPLICA IDENTITY DEFAULT
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
}

#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

/// One row image.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// One column within a tuple.
#[derive(Debug, Clone)]
pub enum TupleData {
    /// SQL NULL
    Null,
    /// Unchanged TOASTed value, not present in the message
    Toast,
    /// Text-format value
    Text(Bytes),
}
