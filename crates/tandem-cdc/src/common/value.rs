//! Typed column values
//!
//! Rows travel through the relay as ordered `(column, value)` pairs rather
//! than open JSON maps, so the apply engine can bind parameters with the
//! right driver types on either engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single SQL value as captured from a replication log or a catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// BOOLEAN
    Bool(bool),
    /// SMALLINT
    Int16(i16),
    /// INTEGER
    Int32(i32),
    /// BIGINT
    Int64(i64),
    /// REAL
    Float32(f32),
    /// DOUBLE PRECISION
    Float64(f64),
    /// NUMERIC / DECIMAL, precision preserved
    Decimal(Decimal),
    /// VARCHAR, TEXT, CHAR, ENUM
    String(String),
    /// BYTEA / BLOB / VARBINARY
    Bytes(Vec<u8>),
    /// DATE
    Date(NaiveDate),
    /// TIME
    Time(NaiveTime),
    /// TIMESTAMP without time zone
    DateTime(NaiveDateTime),
    /// TIMESTAMPTZ
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON / JSONB
    Json(serde_json::Value),
}

impl Value {
    /// Check if the value is NULL.
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to read the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to read the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the value into a stable text form used for conflict-window
    /// keys. Not meant for SQL.
    pub fn key_repr(&self) -> String {
        match self {
            Self::Null => "∅".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int16(n) => n.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::Float32(n) => n.to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => hex::encode(b),
            Self::Date(d) => d.to_string(),
            Self::Time(t) => t.to_string(),
            Self::DateTime(dt) => dt.to_string(),
            Self::DateTimeTz(dt) => dt.to_rfc3339(),
            Self::Uuid(u) => u.to_string(),
            Self::Json(j) => j.to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A row as an ordered list of named values.
///
/// Order matters: for primary-key rows it is the key's declared column
/// order, for full rows the table's ordinal order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from parallel column/value vectors.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Create an empty row.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push(column.into());
        self.values.push(value);
    }

    /// Number of columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True when the row has no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in order.
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Look up a value by column name (case-insensitive, like the engines).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Iterate `(column, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// True when every named column is present in this row.
    pub fn covers(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.get(n).is_some())
    }

    /// Project the named columns, preserving the order of `names`.
    /// Returns `None` when a column is missing.
    pub fn project(&self, names: &[String]) -> Option<Row> {
        let mut out = Row::empty();
        for name in names {
            out.push(name.clone(), self.get(name)?.clone());
        }
        Some(out)
    }
}
