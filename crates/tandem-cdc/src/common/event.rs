//! Normalized change events
//!
//! The pipeline's unit of work. Connectors decode their engine's log records
//! into this shape; the apply engine turns it back into SQL on the peer.

use crate::common::{Position, Result, Row};
use crate::common::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row-change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Initial data load; applied with upsert semantics
    Snapshot,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Insert => write!(f, "INSERT"),
            Op::Update => write!(f, "UPDATE"),
            Op::Delete => write!(f, "DELETE"),
            Op::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

/// A single captured row change and its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation type
    pub op: Op,
    /// Schema (PostgreSQL namespace / MySQL database)
    pub schema: String,
    /// Table name
    pub table: String,
    /// Commit time at the source, UTC
    pub timestamp: DateTime<Utc>,
    /// Row image before the change (UPDATE/DELETE)
    pub before: Option<Row>,
    /// Row image after the change (INSERT/UPDATE/SNAPSHOT)
    pub after: Option<Row>,
    /// Primary-key columns and values, always populated
    pub primary_key: Row,
    /// Source-log position, totally ordered within one stream
    pub position: Position,
    /// Stable identifier of the originating endpoint
    pub source_id: String,
}

impl ChangeEvent {
    /// Create an INSERT event.
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        after: Row,
        primary_key: Row,
        position: Position,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            op: Op::Insert,
            schema: schema.into(),
            table: table.into(),
            timestamp,
            before: None,
            after: Some(after),
            primary_key,
            position,
            source_id: source_id.into(),
        }
    }

    /// Create an UPDATE event.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: Row,
        after: Row,
        primary_key: Row,
        position: Position,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            op: Op::Update,
            schema: schema.into(),
            table: table.into(),
            timestamp,
            before: Some(before),
            after: Some(after),
            primary_key,
            position,
            source_id: source_id.into(),
        }
    }

    /// Create a DELETE event.
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: Row,
        primary_key: Row,
        position: Position,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            op: Op::Delete,
            schema: schema.into(),
            table: table.into(),
            timestamp,
            before: Some(before),
            after: None,
            primary_key,
            position,
            source_id: source_id.into(),
        }
    }

    /// Qualified table name.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// The new primary key after this change: for PK-changing updates this
    /// differs from `primary_key` (which carries the old key).
    pub fn new_primary_key(&self) -> Option<Row> {
        self.after
            .as_ref()
            .and_then(|after| after.project(self.primary_key.columns()))
    }

    /// True when an UPDATE moved the row to a different primary key.
    pub fn is_pk_change(&self) -> bool {
        if self.op != Op::Update {
            return false;
        }
        match self.new_primary_key() {
            Some(new_pk) => new_pk != self.primary_key,
            None => false,
        }
    }

    /// Validate the structural invariants of the event.
    pub fn validate(&self) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(Error::decode(format!(
                "{} on {} carries no primary key",
                self.op,
                self.qualified_table()
            )));
        }
        match self.op {
            Op::Insert | Op::Snapshot => {
                if self.before.is_some() {
                    return Err(Error::decode(format!(
                        "{} on {} has a before image",
                        self.op,
                        self.qualified_table()
                    )));
                }
                let after = self.after.as_ref().ok_or_else(|| {
                    Error::decode(format!(
                        "{} on {} is missing the after image",
                        self.op,
                        self.qualified_table()
                    ))
                })?;
                if !after.covers(self.primary_key.columns()) {
                    return Err(Error::decode(format!(
                        "{} after image on {} does not cover the primary key",
                        self.op,
                        self.qualified_table()
                    )));
                }
            }
            Op::Update => {
                let before = self.before.as_ref().ok_or_else(|| {
                    Error::decode(format!(
                        "UPDATE on {} is missing the before image",
                        self.qualified_table()
                    ))
                })?;
                let after = self.after.as_ref().ok_or_else(|| {
                    Error::decode(format!(
                        "UPDATE on {} is missing the after image",
                        self.qualified_table()
                    ))
                })?;
                if !before.covers(self.primary_key.columns())
                    || !after.covers(self.primary_key.columns())
                {
                    return Err(Error::decode(format!(
                        "UPDATE images on {} do not cover the primary key",
                        self.qualified_table()
                    )));
                }
            }
            Op::Delete => {
                if self.after.is_some() {
                    return Err(Error::decode(format!(
                        "DELETE on {} has an after image",
                        self.qualified_table()
                    )));
                }
                let before = self.before.as_ref().ok_or_else(|| {
                    Error::decode(format!(
                        "DELETE on {} is missing the before image",
                        self.qualified_table()
                    ))
                })?;
                if !before.covers(self.primary_key.columns()) {
                    return Err(Error::decode(format!(
                        "DELETE before image on {} does not cover the primary key",
                        self.qualified_table()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;

    fn pk(id: i64) -> Row {
        Row::new(vec!["id".into()], vec![Value::Int64(id)])
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int64(id), Value::from(name)],
        )
    }

    fn pos(lsn: u64) -> Position {
        Position::postgres_lsn(lsn)
    }

    #[test]
    fn test_insert_event_valid() {
        let event = ChangeEvent::insert(
            "public",
            "users",
            row(1, "Ada"),
            pk(1),
            pos(0x100),
            Utc::now(),
            "a",
        );
        assert!(event.validate().is_ok());
        assert_eq!(event.qualified_table(), "public.users");
        assert!(!event.is_pk_change());
    }

    #[test]
    fn test_insert_missing_after_rejected() {
        let mut event = ChangeEvent::insert(
            "public",
            "users",
            row(1, "Ada"),
            pk(1),
            pos(0x100),
            Utc::now(),
            "a",
        );
        event.after = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_update_requires_both_images() {
        let event = ChangeEvent::update(
            "public",
            "users",
            row(1, "Ada"),
            row(1, "Ada L."),
            pk(1),
            pos(0x200),
            Utc::now(),
            "a",
        );
        assert!(event.validate().is_ok());

        let mut broken = event.clone();
        broken.before = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_delete_rejects_after_image() {
        let mut event = ChangeEvent::delete(
            "public",
            "users",
            row(1, "Ada"),
            pk(1),
            pos(0x300),
            Utc::now(),
            "a",
        );
        assert!(event.validate().is_ok());
        event.after = Some(row(1, "Ada"));
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_empty_primary_key_rejected() {
        let event = ChangeEvent::insert(
            "public",
            "users",
            row(1, "Ada"),
            Row::empty(),
            pos(0x100),
            Utc::now(),
            "a",
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_pk_change_detection() {
        let event = ChangeEvent::update(
            "public",
            "users",
            row(1, "Ada"),
            row(2, "Ada"),
            pk(1),
            pos(0x400),
            Utc::now(),
            "a",
        );
        assert!(event.is_pk_change());
        assert_eq!(event.new_primary_key(), Some(pk(2)));
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = ChangeEvent::insert(
            "public",
            "users",
            row(1, "Ada"),
            pk(1),
            pos(0x100),
            Utc::now(),
            "a",
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.op, Op::Insert);
        assert_eq!(parsed.qualified_table(), "public.users");
        assert_eq!(parsed.position, event.position);
    }
}
