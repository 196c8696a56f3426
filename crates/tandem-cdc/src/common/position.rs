//! Source-log positions
//!
//! A position is opaque to everything but the connector that produced it and
//! the comparator below. Each connector advertises its flavor so ordering
//! within one stream uses the right rule:
//!
//! - PostgreSQL LSN `X/Y` compares as the packed 64-bit WAL offset
//! - MySQL binlog `file:offset` compares by (file, offset)
//! - GTID sets fall back to lexicographic comparison

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Which kind of replication position a stream emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionFlavor {
    /// PostgreSQL Log Sequence Number, `<hex>/<hex>`
    PostgresLsn,
    /// MySQL binlog coordinates, `<file>:<offset>`
    MysqlBinlog,
    /// MySQL Global Transaction ID set
    MysqlGtid,
}

/// A position in one source's replication log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Position flavor, drives the comparator
    pub flavor: PositionFlavor,
    /// Canonical string form
    pub value: String,
}

impl Position {
    /// A PostgreSQL LSN from its packed 64-bit form.
    pub fn postgres_lsn(lsn: u64) -> Self {
        Self {
            flavor: PositionFlavor::PostgresLsn,
            value: format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF),
        }
    }

    /// A PostgreSQL LSN from its text form.
    pub fn postgres_lsn_str(lsn: impl Into<String>) -> Self {
        Self {
            flavor: PositionFlavor::PostgresLsn,
            value: lsn.into(),
        }
    }

    /// MySQL binlog coordinates.
    pub fn mysql_binlog(file: &str, offset: u64) -> Self {
        Self {
            flavor: PositionFlavor::MysqlBinlog,
            value: format!("{file}:{offset}"),
        }
    }

    /// A MySQL GTID set.
    pub fn mysql_gtid(gtid: impl Into<String>) -> Self {
        Self {
            flavor: PositionFlavor::MysqlGtid,
            value: gtid.into(),
        }
    }

    /// Parse a PostgreSQL LSN back to its packed form.
    pub fn parse_lsn(&self) -> Option<u64> {
        if self.flavor != PositionFlavor::PostgresLsn {
            return None;
        }
        parse_postgres_lsn(&self.value)
    }

    /// Parse MySQL binlog coordinates.
    pub fn parse_binlog(&self) -> Option<(String, u64)> {
        if self.flavor != PositionFlavor::MysqlBinlog {
            return None;
        }
        let (file, offset) = self.value.rsplit_once(':')?;
        Some((file.to_string(), offset.parse().ok()?))
    }

    /// Compare two positions from the same stream. `None` when the flavors
    /// differ or either value fails to parse, which means the caller must
    /// treat the positions as unordered.
    pub fn compare(&self, other: &Position) -> Option<Ordering> {
        if self.flavor != other.flavor {
            return None;
        }
        match self.flavor {
            PositionFlavor::PostgresLsn => {
                Some(self.parse_lsn()?.cmp(&other.parse_lsn()?))
            }
            PositionFlavor::MysqlBinlog => {
                let (file_a, off_a) = self.parse_binlog()?;
                let (file_b, off_b) = other.parse_binlog()?;
                Some(file_a.cmp(&file_b).then(off_a.cmp(&off_b)))
            }
            PositionFlavor::MysqlGtid => Some(self.value.cmp(&other.value)),
        }
    }

    /// True when `self` is strictly newer than `other`.
    pub fn is_after(&self, other: &Position) -> bool {
        matches!(self.compare(other), Some(Ordering::Greater))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Parse an `X/Y` LSN string to its packed 64-bit form.
pub fn parse_postgres_lsn(lsn: &str) -> Option<u64> {
    let (high, low) = lsn.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_lsn_round_trip() {
        let pos = Position::postgres_lsn(0x0000_0001_1234_5678);
        assert_eq!(pos.value, "1/12345678");
        assert_eq!(pos.parse_lsn(), Some(0x0000_0001_1234_5678));
    }

    #[test]
    fn test_parse_postgres_lsn() {
        assert_eq!(parse_postgres_lsn("0/12345678"), Some(0x1234_5678));
        assert_eq!(parse_postgres_lsn("1/0"), Some(0x1_0000_0000));
        assert_eq!(parse_postgres_lsn("garbage"), None);
    }

    #[test]
    fn test_mysql_binlog_round_trip() {
        let pos = Position::mysql_binlog("mysql-bin.000003", 12345);
        assert_eq!(pos.value, "mysql-bin.000003:12345");
        assert_eq!(
            pos.parse_binlog(),
            Some(("mysql-bin.000003".to_string(), 12345))
        );
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Position::postgres_lsn(0x100);
        let b = Position::postgres_lsn(0x200);
        assert!(b.is_after(&a));
        assert!(!a.is_after(&b));
        assert_eq!(a.compare(&a), Some(Ordering::Equal));
    }

    #[test]
    fn test_binlog_ordering_spans_file_rotation() {
        let early = Position::mysql_binlog("mysql-bin.000003", 99999);
        let late = Position::mysql_binlog("mysql-bin.000004", 4);
        assert!(late.is_after(&early));
    }

    #[test]
    fn test_cross_flavor_is_unordered() {
        let lsn = Position::postgres_lsn(0x100);
        let binlog = Position::mysql_binlog("mysql-bin.000001", 4);
        assert_eq!(lsn.compare(&binlog), None);
        assert!(!lsn.is_after(&binlog));
    }
}
