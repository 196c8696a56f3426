//! Error types for the relay
//!
//! One enum covers the whole core; helpers classify driver errors into the
//! transient / permanent / schema-drift buckets the apply engine retries on.

use thiserror::Error;

/// Relay errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (never produced by the core at runtime; the
    /// config record is validated before the core sees it)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication failed while connecting
    #[error("Authentication failed: {0}")]
    ConnAuth(String),

    /// Endpoint not reachable
    #[error("Endpoint unreachable: {0}")]
    ConnUnreachable(String),

    /// Server speaks a protocol we cannot replicate from
    #[error("Replication protocol unsupported: {0}")]
    ConnProtocolUnsupported(String),

    /// Engine-side CDC objects exist but do not match the configuration,
    /// or a required server setting is off
    #[error("CDC precondition failed: {0}")]
    CdcPrecondition(String),

    /// Replication log record could not be decoded
    #[error("Log decode error: {0}")]
    Decode(String),

    /// Apply failed but may succeed on retry
    #[error("Transient apply error: {0}")]
    ApplyTransient(String),

    /// Apply failed and will keep failing for this event
    #[error("Permanent apply error: {0}")]
    ApplyPermanent(String),

    /// Target rejected a statement in a way that hints at stale cached
    /// schema (unknown column/table)
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// The offset store could not be read or written; fatal for a stream
    #[error("Offset store I/O error: {0}")]
    OffsetIo(String),

    /// Stream was asked to stop
    #[error("Shutdown requested")]
    Shutdown,

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::CdcPrecondition(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::ApplyTransient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::ApplyPermanent(msg.into())
    }

    pub fn drift(msg: impl Into<String>) -> Self {
        Self::SchemaDrift(msg.into())
    }

    pub fn offset_io(msg: impl Into<String>) -> Self {
        Self::OffsetIo(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for errors worth a local retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ApplyTransient(_) | Self::ConnUnreachable(_) => true,
            Self::Postgres(e) => pg_error_is_transient(e),
            Self::MySql(e) => mysql_error_is_transient(e),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::BrokenPipe
                )
            }
            _ => false,
        }
    }

    /// Process exit code when this error takes the relay down.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::ConnAuth(_)
            | Self::ConnUnreachable(_)
            | Self::ConnProtocolUnsupported(_)
            | Self::CdcPrecondition(_) => 2,
            Self::Shutdown => 0,
            _ => 3,
        }
    }
}

/// Transient PostgreSQL SQLSTATE classes: connection exceptions (08),
/// transaction rollback (40), insufficient resources (53), operator
/// intervention (57). Statement timeouts surface as query_canceled (57014)
/// and retry like any other timeout.
pub fn pg_error_is_transient(e: &tokio_postgres::Error) -> bool {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        return code.starts_with("08")
            || code.starts_with("40")
            || code.starts_with("53")
            || code.starts_with("57");
    }
    // No DB error body: connection-level failure
    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timed out")
}

/// Stale-schema PostgreSQL SQLSTATEs: undefined_column, undefined_table.
pub fn pg_error_is_drift(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db| matches!(db.code().code(), "42703" | "42P01"))
        .unwrap_or(false)
}

/// PostgreSQL unique violation (SQLSTATE 23505).
pub fn pg_error_is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db| db.code().code() == "23505")
        .unwrap_or(false)
}

/// Transient MySQL server errors: deadlock (1213), lock wait timeout (1205),
/// server gone / lost connection (2006, 2013), too many connections (1040).
pub fn mysql_error_is_transient(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Server(s) => matches!(s.code, 1040 | 1205 | 1213 | 2006 | 2013),
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Driver(_) => false,
        _ => false,
    }
}

/// Stale-schema MySQL errors: unknown column (1054), table missing (1146).
pub fn mysql_error_is_drift(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Server(s) => matches!(s.code, 1054 | 1146),
        _ => false,
    }
}

/// MySQL duplicate-key error (1062).
pub fn mysql_error_is_unique_violation(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Server(s) => s.code == 1062,
        _ => false,
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::precondition("binlog_format is STATEMENT");
        assert!(err.to_string().contains("CDC precondition"));
        assert!(err.to_string().contains("STATEMENT"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("deadlock").is_transient());
        assert!(Error::ConnUnreachable("refused".into()).is_transient());
        assert!(!Error::permanent("bad type").is_transient());
        assert!(!Error::config("nope").is_transient());
        assert!(!Error::drift("missing column").is_transient());
    }

    #[test]
    fn test_io_transient_kinds() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::Io(reset).is_transient());
        let notfound = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!Error::Io(notfound).is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::config("x").exit_code(), 1);
        assert_eq!(Error::precondition("x").exit_code(), 2);
        assert_eq!(Error::ConnAuth("x".into()).exit_code(), 2);
        assert_eq!(Error::permanent("x").exit_code(), 3);
        assert_eq!(Error::offset_io("x").exit_code(), 3);
        assert_eq!(Error::Shutdown.exit_code(), 0);
    }
}
