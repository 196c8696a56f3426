//! Binary pgoutput v1 decoder

use super::message::*;
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder failures. Surface as `Error::Decode` at the connector boundary.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Decode one pgoutput message from an XLogData payload.
pub fn decode_message(data: &mut Bytes) -> Result<LogicalMessage, DecodeError> {
    if !data.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }

    let msg_type = data.get_u8();
    match msg_type {
        b'B' => decode_begin(data).map(LogicalMessage::Begin),
        b'C' => decode_commit(data).map(LogicalMessage::Commit),
        b'O' => decode_origin(data).map(LogicalMessage::Origin),
        b'R' => decode_relation(data).map(LogicalMessage::Relation),
        b'Y' => decode_type(data).map(LogicalMessage::Type),
        b'I' => decode_insert(data).map(LogicalMessage::Insert),
        b'U' => decode_update(data).map(LogicalMessage::Update),
        b'D' => decode_delete(data).map(LogicalMessage::Delete),
        b'T' => decode_truncate(data).map(LogicalMessage::Truncate),
        t => Err(DecodeError::InvalidType(t)),
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::NotEnoughData)
    } else {
        Ok(())
    }
}

fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, DecodeError> {
    need(buf, 20)?;
    Ok(BeginBody {
        final_lsn: buf.get_u64(),
        timestamp: buf.get_i64(),
        xid: buf.get_u32(),
    })
}

fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, DecodeError> {
    need(buf, 25)?;
    Ok(CommitBody {
        flags: buf.get_u8(),
        commit_lsn: buf.get_u64(),
        end_lsn: buf.get_u64(),
        timestamp: buf.get_i64(),
    })
}

fn decode_origin(buf: &mut Bytes) -> Result<OriginBody, DecodeError> {
    need(buf, 8)?;
    let commit_lsn = buf.get_u64();
    let name = read_cstring(buf)?;
    Ok(OriginBody { commit_lsn, name })
}

fn decode_relation(buf: &mut Bytes) -> Result<RelationBody, DecodeError> {
    need(buf, 4)?;
    let id = buf.get_u32();
    let namespace = read_cstring(buf)?;
    let name = read_cstring(buf)?;
    need(buf, 3)?;
    let replica_identity = buf.get_u8();
    let num_columns = buf.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        need(buf, 1)?;
        let flags = buf.get_u8();
        let col_name = read_cstring(buf)?;
        need(buf, 8)?;
        let type_id = buf.get_i32();
        let type_mode = buf.get_i32();
        columns.push(Column {
            flags,
            name: col_name,
            type_id,
            type_mode,
        });
    }

    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_type(buf: &mut Bytes) -> Result<TypeBody, DecodeError> {
    need(buf, 4)?;
    let id = buf.get_u32();
    let namespace = read_cstring(buf)?;
    let name = read_cstring(buf)?;
    Ok(TypeBody {
        id,
        namespace,
        name,
    })
}

fn decode_insert(buf: &mut Bytes) -> Result<InsertBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    let marker = buf.get_u8();
    if marker != b'N' {
        return Err(DecodeError::Protocol(format!(
            "expected new-tuple marker 'N', got {:#04x}",
            marker
        )));
    }
    let tuple = decode_tuple(buf)?;
    Ok(InsertBody { relation_id, tuple })
}

fn decode_update(buf: &mut Bytes) -> Result<UpdateBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    let marker = buf.get_u8();

    let (old_tuple, new_tuple) = match marker {
        b'K' | b'O' => {
            let old = decode_tuple(buf)?;
            need(buf, 1)?;
            let next = buf.get_u8();
            if next != b'N' {
                return Err(DecodeError::Protocol(format!(
                    "expected 'N' after old tuple, got {:#04x}",
                    next
                )));
            }
            (Some(old), decode_tuple(buf)?)
        }
        b'N' => (None, decode_tuple(buf)?),
        t => return Err(DecodeError::InvalidType(t)),
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(buf: &mut Bytes) -> Result<DeleteBody, DecodeError> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    let marker = buf.get_u8();

    let old_tuple = match marker {
        b'K' | b'O' => Some(decode_tuple(buf)?),
        t => return Err(DecodeError::InvalidType(t)),
    };

    Ok(DeleteBody {
        relation_id,
        old_tuple,
    })
}

fn decode_truncate(buf: &mut Bytes) -> Result<TruncateBody, DecodeError> {
    need(buf, 5)?;
    let num_rels = buf.get_u32();
    let options = buf.get_u8();
    let mut relation_ids = Vec::with_capacity(num_rels as usize);
    for _ in 0..num_rels {
        need(buf, 4)?;
        relation_ids.push(buf.get_u32());
    }
    Ok(TruncateBody {
        options,
        relation_ids,
    })
}

fn read_cstring(buf: &mut Bytes) -> Result<String, DecodeError> {
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let s_bytes = buf.copy_to_bytes(n);
    buf.advance(1); // trailing NUL
    Ok(std::str::from_utf8(&s_bytes)?.to_string())
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, DecodeError> {
    need(buf, 2)?;
    let num_cols = buf.get_u16();
    let mut columns = Vec::with_capacity(num_cols as usize);

    for _ in 0..num_cols {
        need(buf, 1)?;
        let kind = buf.get_u8();
        let data = match kind {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}
