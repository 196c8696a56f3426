//! MySQL binlog event decoder
//!
//! Decodes the row-replication subset of the binlog: FORMAT_DESCRIPTION
//! (checksum negotiation), TABLE_MAP (column types, cached per table id),
//! WRITE/UPDATE/DELETE_ROWS v1/v2, XID (commit), QUERY (DDL hint), ROTATE
//! (file switch) and GTID. Row values decode straight into the relay's
//! typed [`Value`]s; column names are not on the wire and are joined in
//! later from the schema cache.

use crate::common::Value;
use anyhow::{anyhow, bail, Result};
use bytes::{Buf, Bytes};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::str::FromStr;
use tracing::{debug, trace};

/// Binlog event type codes this decoder understands.
mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const HEARTBEAT: u8 = 27;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const GTID: u8 = 33;
    pub const ANONYMOUS_GTID: u8 = 34;
}

/// MySQL wire column types (a subset; unknown types decode as raw strings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    Blob,
    VarString,
    String,
    Geometry,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249..=252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            _ => Self::VarString,
        }
    }
}

/// The 19-byte header in front of every binlog event.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_length: u32,
    /// End position of this event in the current binlog file
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("binlog event header too short: {} bytes", data.len());
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            timestamp: cursor.get_u32_le(),
            event_type: cursor.get_u8(),
            server_id: cursor.get_u32_le(),
            event_length: cursor.get_u32_le(),
            next_position: cursor.get_u32_le(),
            flags: cursor.get_u16_le(),
        })
    }
}

/// Column layout for one table id, valid until the next TABLE_MAP.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_meta: Vec<u16>,
}

/// Whether a rows event writes, rewrites, or removes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// One decoded row change. Values carry their column ordinal (see
/// TABLE_MAP) because a non-FULL row image may omit columns entirely.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub before: Option<Vec<(usize, Value)>>,
    pub after: Option<Vec<(usize, Value)>>,
}

/// A decoded WRITE/UPDATE/DELETE_ROWS event.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub rows: Vec<RowChange>,
}

/// Decoded binlog events the connector consumes.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    /// Format description; sets up checksum stripping
    Format { server_version: String },
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    /// Transaction commit
    Commit { xid: u64 },
    /// Statement event; BEGIN markers and DDL both arrive here
    Query { schema: String, query: String },
    /// Switch to the next binlog file
    Rotate { file: String, position: u64 },
    /// Transaction GTID
    Gtid { gtid: String },
    Heartbeat,
    /// Recognized but irrelevant to the relay
    Ignored,
}

/// Stateful decoder: remembers the table map per table id and whether the
/// server appends CRC32 checksums.
pub struct BinlogDecoder {
    tables: HashMap<u64, TableMapEvent>,
    checksums: bool,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            checksums: false,
        }
    }

    /// Table layout for a table id, if a TABLE_MAP was seen.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.tables.get(&table_id)
    }

    /// Decode one event as delivered by the dump stream.
    pub fn decode(&mut self, data: &Bytes) -> Result<(EventHeader, BinlogEvent)> {
        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];

        // Once the format event announces CRC32, every later event carries
        // a 4-byte trailer that is not part of the body.
        if self.checksums
            && header.event_type != event_type::FORMAT_DESCRIPTION
            && payload.len() >= 4
        {
            payload = &payload[..payload.len() - 4];
        }

        trace!(event_type = header.event_type, len = payload.len(), "binlog event");

        let event = match header.event_type {
            event_type::FORMAT_DESCRIPTION => self.decode_format(payload)?,
            event_type::TABLE_MAP => {
                let map = decode_table_map(payload)?;
                debug!(
                    table = %format!("{}.{}", map.schema_name, map.table_name),
                    table_id = map.table_id,
                    "table map"
                );
                self.tables.insert(map.table_id, map.clone());
                BinlogEvent::TableMap(map)
            }
            event_type::WRITE_ROWS_V1 | event_type::WRITE_ROWS_V2 => BinlogEvent::Rows(
                self.decode_rows(payload, RowsKind::Write, header.event_type)?,
            ),
            event_type::UPDATE_ROWS_V1 | event_type::UPDATE_ROWS_V2 => BinlogEvent::Rows(
                self.decode_rows(payload, RowsKind::Update, header.event_type)?,
            ),
            event_type::DELETE_ROWS_V1 | event_type::DELETE_ROWS_V2 => BinlogEvent::Rows(
                self.decode_rows(payload, RowsKind::Delete, header.event_type)?,
            ),
            event_type::XID => {
                let mut cursor = Cursor::new(payload);
                if cursor.remaining() < 8 {
                    bail!("short XID event");
                }
                BinlogEvent::Commit {
                    xid: cursor.get_u64_le(),
                }
            }
            event_type::QUERY => decode_query(payload)?,
            event_type::ROTATE => decode_rotate(payload)?,
            event_type::GTID | event_type::ANONYMOUS_GTID => decode_gtid(payload)?,
            event_type::HEARTBEAT => BinlogEvent::Heartbeat,
            _ => BinlogEvent::Ignored,
        };

        Ok((header, event))
    }

    fn decode_format(&mut self, payload: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(payload);
        if cursor.remaining() < 2 + 50 + 4 + 1 {
            bail!("short format description event");
        }
        let binlog_version = cursor.get_u16_le();
        if binlog_version != 4 {
            bail!("unsupported binlog version {binlog_version}");
        }
        let mut version_bytes = [0u8; 50];
        cursor.read_exact(&mut version_bytes)?;
        let server_version = String::from_utf8_lossy(&version_bytes)
            .trim_end_matches('\0')
            .to_string();

        // With CRC32 enabled the payload ends with the algorithm byte
        // followed by the event's own 4-byte checksum.
        self.checksums = payload.len() >= 5 && payload[payload.len() - 5] == 1;

        debug!(version = %server_version, checksums = self.checksums, "binlog format");
        Ok(BinlogEvent::Format { server_version })
    }

    fn decode_rows(&self, payload: &[u8], kind: RowsKind, raw_type: u8) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(payload);

        let table_id = read_u48(&mut cursor)?;
        let _flags = cursor.get_u16_le();

        // V2 events carry a variable extra-data block.
        if matches!(
            raw_type,
            event_type::WRITE_ROWS_V2 | event_type::UPDATE_ROWS_V2 | event_type::DELETE_ROWS_V2
        ) {
            let extra_len = cursor.get_u16_le() as usize;
            if extra_len > 2 {
                cursor.advance(extra_len - 2);
            }
        }

        let column_count = read_lenenc(&mut cursor)? as usize;
        let bitmap_len = column_count.div_ceil(8);

        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;
        let present_after = if kind == RowsKind::Update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            Some(bitmap)
        } else {
            None
        };

        let table = self.tables.get(&table_id);
        let mut rows = Vec::new();

        while cursor.has_remaining() {
            let row = match kind {
                RowsKind::Write => RowChange {
                    before: None,
                    after: Some(self.read_image(&mut cursor, table, column_count, &present)?),
                },
                RowsKind::Delete => RowChange {
                    before: Some(self.read_image(&mut cursor, table, column_count, &present)?),
                    after: None,
                },
                RowsKind::Update => {
                    let before = self.read_image(&mut cursor, table, column_count, &present)?;
                    let after_bitmap = present_after.as_deref().unwrap_or(&present);
                    let after =
                        self.read_image(&mut cursor, table, column_count, after_bitmap)?;
                    RowChange {
                        before: Some(before),
                        after: Some(after),
                    }
                }
            };
            rows.push(row);
        }

        Ok(RowsEvent {
            kind,
            table_id,
            rows,
        })
    }

    /// One row image: null bitmap over the present columns, then values.
    fn read_image(
        &self,
        cursor: &mut Cursor<&[u8]>,
        table: Option<&TableMapEvent>,
        column_count: usize,
        present: &[u8],
    ) -> Result<Vec<(usize, Value)>> {
        let present_count = present.iter().map(|b| b.count_ones() as usize).sum::<usize>();
        let null_bitmap_len = present_count.div_ceil(8);
        let mut null_bitmap = vec![0u8; null_bitmap_len];
        cursor.read_exact(&mut null_bitmap)?;

        let mut values = Vec::with_capacity(present_count);
        let mut field_idx = 0usize;
        for col_idx in 0..column_count {
            if !bit_set(present, col_idx) {
                continue;
            }
            if bit_set(&null_bitmap, field_idx) {
                values.push((col_idx, Value::Null));
                field_idx += 1;
                continue;
            }

            let (col_type, meta) = match table {
                Some(map) => (
                    map.column_types
                        .get(col_idx)
                        .copied()
                        .unwrap_or(ColumnType::VarString),
                    map.column_meta.get(col_idx).copied().unwrap_or(0),
                ),
                None => (ColumnType::VarString, 0),
            };
            values.push((col_idx, decode_value(cursor, col_type, meta)?));
            field_idx += 1;
        }
        Ok(values)
    }
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_table_map(payload: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(payload);

    let table_id = read_u48(&mut cursor)?;
    let _flags = cursor.get_u16_le();

    let schema_len = cursor.get_u8() as usize;
    let mut schema_bytes = vec![0u8; schema_len];
    cursor.read_exact(&mut schema_bytes)?;
    cursor.get_u8(); // NUL

    let table_len = cursor.get_u8() as usize;
    let mut table_bytes = vec![0u8; table_len];
    cursor.read_exact(&mut table_bytes)?;
    cursor.get_u8(); // NUL

    let column_count = read_lenenc(&mut cursor)? as usize;
    let mut column_types = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        column_types.push(ColumnType::from_u8(cursor.get_u8()));
    }

    let _meta_len = read_lenenc(&mut cursor)?;
    let column_meta = read_column_meta(&mut cursor, &column_types)?;

    Ok(TableMapEvent {
        table_id,
        schema_name: String::from_utf8_lossy(&schema_bytes).to_string(),
        table_name: String::from_utf8_lossy(&table_bytes).to_string(),
        column_count,
        column_types,
        column_meta,
    })
}

/// Per-type metadata widths, straight from the binlog format spec.
fn read_column_meta(cursor: &mut Cursor<&[u8]>, types: &[ColumnType]) -> Result<Vec<u16>> {
    let mut meta = Vec::with_capacity(types.len());
    for t in types {
        let value = match t {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::Json
            | ColumnType::Geometry => cursor.get_u8() as u16,
            ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => cursor.get_u16_le(),
            ColumnType::NewDecimal => {
                let precision = cursor.get_u8() as u16;
                let scale = cursor.get_u8() as u16;
                (precision << 8) | scale
            }
            ColumnType::String | ColumnType::Enum | ColumnType::Set => cursor.get_u16_le(),
            ColumnType::Time2 | ColumnType::DateTime2 | ColumnType::Timestamp2 => {
                cursor.get_u8() as u16
            }
            _ => 0,
        };
        meta.push(value);
    }
    Ok(meta)
}

fn decode_query(payload: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    if cursor.remaining() < 13 {
        bail!("short query event");
    }
    let _thread_id = cursor.get_u32_le();
    let _exec_time = cursor.get_u32_le();
    let schema_len = cursor.get_u8() as usize;
    let _error_code = cursor.get_u16_le();
    let status_len = cursor.get_u16_le() as usize;
    cursor.advance(status_len);

    let mut schema_bytes = vec![0u8; schema_len];
    cursor.read_exact(&mut schema_bytes)?;
    cursor.get_u8(); // NUL

    let remaining = payload.len() - cursor.position() as usize;
    let mut query_bytes = vec![0u8; remaining];
    cursor.read_exact(&mut query_bytes)?;

    Ok(BinlogEvent::Query {
        schema: String::from_utf8_lossy(&schema_bytes).to_string(),
        query: String::from_utf8_lossy(&query_bytes).to_string(),
    })
}

fn decode_rotate(payload: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    if cursor.remaining() < 8 {
        bail!("short rotate event");
    }
    let position = cursor.get_u64_le();
    let remaining = payload.len() - cursor.position() as usize;
    let mut file_bytes = vec![0u8; remaining];
    cursor.read_exact(&mut file_bytes)?;
    Ok(BinlogEvent::Rotate {
        file: String::from_utf8_lossy(&file_bytes).to_string(),
        position,
    })
}

fn decode_gtid(payload: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(payload);
    if cursor.remaining() < 1 + 16 + 8 {
        bail!("short GTID event");
    }
    let _flags = cursor.get_u8();
    let mut uuid = [0u8; 16];
    cursor.read_exact(&mut uuid)?;
    let gno = cursor.get_u64_le();

    let uuid_str = format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-\
         {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7], uuid[8],
        uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
    );
    Ok(BinlogEvent::Gtid {
        gtid: format!("{uuid_str}:{gno}"),
    })
}

fn decode_value(cursor: &mut Cursor<&[u8]>, col_type: ColumnType, meta: u16) -> Result<Value> {
    let value = match col_type {
        ColumnType::Tiny => Value::Int16(cursor.get_i8() as i16),
        ColumnType::Short => Value::Int16(cursor.get_i16_le()),
        ColumnType::Int24 => {
            let raw = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            let signed = if raw & 0x0080_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
            Value::Int32(signed)
        }
        ColumnType::Long => Value::Int32(cursor.get_i32_le()),
        ColumnType::LongLong => Value::Int64(cursor.get_i64_le()),
        ColumnType::Float => Value::Float32(cursor.get_f32_le()),
        ColumnType::Double => Value::Float64(cursor.get_f64_le()),
        ColumnType::Year => Value::Int16(cursor.get_u8() as i16 + 1900),
        ColumnType::Date => {
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            let day = packed & 0x1F;
            let month = (packed >> 5) & 0x0F;
            let year = (packed >> 9) & 0x7FFF;
            NaiveDate::from_ymd_opt(year as i32, month, day)
                .map(Value::Date)
                .unwrap_or(Value::Null)
        }
        ColumnType::Time => {
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            let (h, m, s) = (packed / 10_000, (packed / 100) % 100, packed % 100);
            NaiveTime::from_hms_opt(h, m, s)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
        ColumnType::Time2 => {
            let packed = read_be_uint(cursor, 3)? as u32;
            let micros = read_fractional_micros(cursor, meta as u8)?;
            let v = packed & 0x7F_FFFF;
            let (h, m, s) = ((v >> 12) & 0x3FF, (v >> 6) & 0x3F, v & 0x3F);
            NaiveTime::from_hms_micro_opt(h, m, s, micros)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
        ColumnType::DateTime => {
            let packed = cursor.get_u64_le();
            let second = (packed % 100) as u32;
            let minute = ((packed / 100) % 100) as u32;
            let hour = ((packed / 10_000) % 100) as u32;
            let day = ((packed / 1_000_000) % 100) as u32;
            let month = ((packed / 100_000_000) % 100) as u32;
            let year = (packed / 10_000_000_000) as i32;
            naive_datetime(year, month, day, hour, minute, second, 0)
        }
        ColumnType::DateTime2 => {
            let packed = read_be_uint(cursor, 5)?;
            let micros = read_fractional_micros(cursor, meta as u8)?;
            let year_month = ((packed >> 22) & 0x1FFFF) as u32;
            let year = (year_month / 13) as i32;
            let month = year_month % 13;
            let day = ((packed >> 17) & 0x1F) as u32;
            let hour = ((packed >> 12) & 0x1F) as u32;
            let minute = ((packed >> 6) & 0x3F) as u32;
            let second = (packed & 0x3F) as u32;
            naive_datetime(year, month, day, hour, minute, second, micros)
        }
        ColumnType::Timestamp => {
            let secs = cursor.get_u32_le();
            Utc.timestamp_opt(secs as i64, 0)
                .single()
                .map(Value::DateTimeTz)
                .unwrap_or(Value::Null)
        }
        ColumnType::Timestamp2 => {
            let secs = read_be_uint(cursor, 4)? as i64;
            let micros = read_fractional_micros(cursor, meta as u8)?;
            Utc.timestamp_opt(secs, micros * 1000)
                .single()
                .map(Value::DateTimeTz)
                .unwrap_or(Value::Null)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.get_u8() as usize
            } else {
                cursor.get_u16_le() as usize
            };
            read_string(cursor, len)?
        }
        ColumnType::String => {
            // ENUM/SET hide behind STRING with the real type in meta.
            let real_type = (meta >> 8) as u8;
            let pack_len = meta & 0xFF;
            if real_type == 247 {
                let idx = if pack_len == 1 {
                    cursor.get_u8() as u16
                } else {
                    cursor.get_u16_le()
                };
                Value::Int32(idx as i32)
            } else if real_type == 248 {
                let bytes = pack_len.div_ceil(8) as usize;
                Value::Int64(read_le_uint(cursor, bytes)? as i64)
            } else {
                let len = if pack_len < 256 {
                    cursor.get_u8() as usize
                } else {
                    cursor.get_u16_le() as usize
                };
                read_string(cursor, len)?
            }
        }
        ColumnType::Enum => {
            let idx = if meta == 1 {
                cursor.get_u8() as u16
            } else {
                cursor.get_u16_le()
            };
            Value::Int32(idx as i32)
        }
        ColumnType::Set => Value::Int64(read_le_uint(cursor, meta as usize)? as i64),
        ColumnType::Blob | ColumnType::Geometry | ColumnType::Json => {
            let len = read_le_uint(cursor, meta as usize)? as usize;
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            // MySQL stores JSON in its own binary format; surfaced as bytes
            Value::Bytes(bytes)
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            let text = decode_decimal(cursor, precision, scale)?;
            Decimal::from_str(&text)
                .map(Value::Decimal)
                .unwrap_or(Value::String(text))
        }
        ColumnType::Bit => {
            let bits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            let len = bits.div_ceil(8);
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Value::Bytes(bytes)
        }
        ColumnType::Null => Value::Null,
        ColumnType::Decimal => {
            // Pre-5.0 decimal; servers in ROW mode emit NewDecimal instead,
            // so this only sees length-prefixed text
            let len = cursor.get_u8() as usize;
            read_string(cursor, len)?
        }
    };
    Ok(value)
}

fn naive_datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> Value {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_micro_opt(hour, minute, second, micros))
        .map(Value::DateTime)
        .unwrap_or(Value::Null)
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Value> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => Value::String(s),
        Err(e) => Value::Bytes(e.into_bytes()),
    })
}

fn read_u48(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    read_le_uint(cursor, 6)
}

fn read_le_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    if cursor.remaining() < bytes {
        return Err(anyhow!("short little-endian integer"));
    }
    let mut value = 0u64;
    for i in 0..bytes {
        value |= (cursor.get_u8() as u64) << (i * 8);
    }
    Ok(value)
}

fn read_be_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    if cursor.remaining() < bytes {
        return Err(anyhow!("short big-endian integer"));
    }
    let mut value = 0u64;
    for _ in 0..bytes {
        value = (value << 8) | cursor.get_u8() as u64;
    }
    Ok(value)
}

/// Length-encoded integer.
fn read_lenenc(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    match cursor.get_u8() {
        n @ 0..=250 => Ok(n as u64),
        252 => Ok(cursor.get_u16_le() as u64),
        253 => read_le_uint(cursor, 3),
        254 => Ok(cursor.get_u64_le()),
        n => Err(anyhow!("invalid length-encoded integer prefix {n}")),
    }
}

fn read_fractional_micros(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    if fsp == 0 {
        return Ok(0);
    }
    let bytes = (fsp as usize).div_ceil(2);
    let raw = read_be_uint(cursor, bytes)? as u32;
    Ok(raw * 10u32.pow(6 - u32::from(fsp).min(6)))
}

fn bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

/// MySQL packed-decimal to text. Digits are grouped in 9-digit words of
/// four bytes with compressed leftovers; the sign bit is stored inverted.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIGITS_PER_WORD: usize = 9;
    fn leftover_bytes(digits: usize) -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    }

    let int_digits = precision.saturating_sub(scale);
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_rest = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_rest = scale % DIGITS_PER_WORD;

    let total =
        leftover_bytes(int_rest) + int_words * 4 + frac_words * 4 + leftover_bytes(frac_rest);
    let mut bytes = vec![0u8; total];
    cursor.read_exact(&mut bytes)?;

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut inner = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();
    if leftover_bytes(int_rest) > 0 {
        let v = read_be_uint(&mut inner, leftover_bytes(int_rest))?;
        if v > 0 || int_words == 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_words {
        let v = inner.get_u32();
        if int_part.is_empty() {
            if v != 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{v:09}"));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&int_part);

    if scale > 0 {
        out.push('.');
        for _ in 0..frac_words {
            out.push_str(&format!("{:09}", inner.get_u32()));
        }
        if leftover_bytes(frac_rest) > 0 {
            let v = read_be_uint(&mut inner, leftover_bytes(frac_rest))?;
            out.push_str(&format!("{v:0width$}", width = frac_rest));
        }
    }
    Ok(out)
}
