//! Conflict resolution and loop prevention
//!
//! Bidirectional operation has two failure modes this module guards:
//!
//! 1. **Echoes** - a change applied by the relay is captured again by the
//!    peer's log tailer and would reflect back forever. The wire-level
//!    markers (PostgreSQL replication origins, MySQL `sql_log_bin = 0`)
//!    stop most echoes at the source; [`LoopGuard`] drops whatever still
//!    arrives carrying a foreign origin.
//! 2. **Concurrent writes** - the same primary key modified on both sides
//!    within the visibility window. [`ConflictWindow`] remembers what each
//!    direction applied recently; [`ConflictResolver`] picks the winner.

use crate::common::{ChangeEvent, ConflictStrategy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Stable key for one row: `schema.table` plus the rendered PK values.
pub fn row_key(event: &ChangeEvent) -> String {
    let mut key = format!("{}.{}", event.schema, event.table);
    for (_, value) in event.primary_key.iter() {
        key.push('|');
        key.push_str(&value.key_repr());
    }
    key
}

/// What one direction recently applied to a row.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    /// Source commit time of the applied event
    pub timestamp: DateTime<Utc>,
    /// Endpoint the applied event originated from
    pub source_id: String,
    applied_at: Instant,
}

/// Short-lived per-row memory of applied changes for one direction.
///
/// Owned by the direction that applies; read by the opposite direction
/// under a short lock. Entries expire after the configured window.
pub struct ConflictWindow {
    entries: Mutex<HashMap<String, AppliedChange>>,
    window: Duration,
}

impl ConflictWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record an applied event.
    pub fn record(&self, event: &ChangeEvent) {
        let mut entries = self.entries.lock().expect("conflict window poisoned");
        let now = Instant::now();
        entries.retain(|_, change| now.duration_since(change.applied_at) < self.window);
        entries.insert(
            row_key(event),
            AppliedChange {
                timestamp: event.timestamp,
                source_id: event.source_id.clone(),
                applied_at: now,
            },
        );
    }

    /// A still-fresh change to the same row, if any.
    pub fn lookup(&self, event: &ChangeEvent) -> Option<AppliedChange> {
        let entries = self.entries.lock().expect("conflict window poisoned");
        entries.get(&row_key(event)).and_then(|change| {
            (change.applied_at.elapsed() < self.window).then(|| change.clone())
        })
    }

    /// Number of unexpired rows tracked.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("conflict window poisoned")
            .values()
            .filter(|c| now.duration_since(c.applied_at) < self.window)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of conflict resolution for an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No overlapping change; apply normally
    NoConflict,
    /// Conflict detected, incoming event wins; apply it
    IncomingWins,
    /// Conflict detected, the already-applied change wins; drop the event
    IncomingLoses,
}

/// Decides the winner when both directions touched the same row.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    /// Endpoint id treated as "source" for the priority strategies
    priority_id: String,
}

impl ConflictResolver {
    /// `priority_id` is endpoint A's id; `source_priority` always favors
    /// events originating there, `target_priority` the other side.
    pub fn new(strategy: ConflictStrategy, priority_id: impl Into<String>) -> Self {
        Self {
            strategy,
            priority_id: priority_id.into(),
        }
    }

    /// Resolve an incoming event against what the opposite direction
    /// recently applied to the same row.
    pub fn resolve(&self, incoming: &ChangeEvent, applied: &AppliedChange) -> Resolution {
        match self.strategy {
            ConflictStrategy::LastWriteWins => {
                if incoming.timestamp > applied.timestamp {
                    Resolution::IncomingWins
                } else if incoming.timestamp < applied.timestamp {
                    Resolution::IncomingLoses
                } else {
                    // Deterministic tie-break on source id
                    if incoming.source_id > applied.source_id {
                        Resolution::IncomingWins
                    } else {
                        Resolution::IncomingLoses
                    }
                }
            }
            ConflictStrategy::SourcePriority => {
                if incoming.source_id == self.priority_id {
                    Resolution::IncomingWins
                } else {
                    Resolution::IncomingLoses
                }
            }
            ConflictStrategy::TargetPriority => {
                if incoming.source_id == self.priority_id {
                    Resolution::IncomingLoses
                } else {
                    Resolution::IncomingWins
                }
            }
        }
    }
}

/// Drops events that did not originate at this pipeline's source endpoint.
///
/// With the session markers in place an echo normally never reaches the log;
/// when one does (PostgreSQL transactions carrying a foreign replication
/// origin are decoded and surfaced with that origin's id), it is filtered
/// here and counted as skipped.
pub struct LoopGuard {
    own_source_id: String,
}

impl LoopGuard {
    pub fn new(own_source_id: impl Into<String>) -> Self {
        Self {
            own_source_id: own_source_id.into(),
        }
    }

    /// True when the event is a reflection of a relay apply.
    pub fn is_echo(&self, event: &ChangeEvent) -> bool {
        event.source_id != self.own_source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Position, Row, Value};
    use chrono::TimeZone;

    fn event_at(source_id: &str, secs: i64) -> ChangeEvent {
        ChangeEvent::update(
            "public",
            "users",
            Row::new(vec!["id".into()], vec![Value::Int64(1)]),
            Row::new(
                vec!["id".into(), "name".into()],
                vec![Value::Int64(1), Value::from("x")],
            ),
            Row::new(vec!["id".into()], vec![Value::Int64(1)]),
            Position::postgres_lsn(0x100),
            Utc.timestamp_opt(secs, 0).unwrap(),
            source_id,
        )
    }

    #[test]
    fn test_row_key_includes_pk_values() {
        let a = event_at("a", 100);
        let mut b = event_at("a", 100);
        b.primary_key = Row::new(vec!["id".into()], vec![Value::Int64(2)]);
        assert_ne!(row_key(&a), row_key(&b));
        assert!(row_key(&a).starts_with("public.users"));
    }

    #[test]
    fn test_window_record_and_lookup() {
        let window = ConflictWindow::new(Duration::from_secs(5));
        let event = event_at("a", 100);
        assert!(window.lookup(&event).is_none());

        window.record(&event);
        let hit = window.lookup(&event).unwrap();
        assert_eq!(hit.source_id, "a");
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_expiry() {
        let window = ConflictWindow::new(Duration::from_millis(0));
        let event = event_at("a", 100);
        window.record(&event);
        assert!(window.lookup(&event).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_last_write_wins_newer_incoming() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriteWins, "a");
        let window = ConflictWindow::new(Duration::from_secs(60));
        window.record(&event_at("a", 100));

        let incoming = event_at("b", 101);
        let applied = window.lookup(&incoming).unwrap();
        assert_eq!(resolver.resolve(&incoming, &applied), Resolution::IncomingWins);
    }

    #[test]
    fn test_last_write_wins_older_incoming() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriteWins, "a");
        let applied = AppliedChange {
            timestamp: Utc.timestamp_opt(101, 0).unwrap(),
            source_id: "a".into(),
            applied_at: Instant::now(),
        };
        let incoming = event_at("b", 100);
        assert_eq!(
            resolver.resolve(&incoming, &applied),
            Resolution::IncomingLoses
        );
    }

    #[test]
    fn test_last_write_wins_tie_breaks_on_source_id() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriteWins, "a");
        let applied = AppliedChange {
            timestamp: Utc.timestamp_opt(100, 0).unwrap(),
            source_id: "a".into(),
            applied_at: Instant::now(),
        };
        let incoming = event_at("b", 100);
        // "b" > "a" lexicographically, so the incoming side wins the tie
        assert_eq!(resolver.resolve(&incoming, &applied), Resolution::IncomingWins);
    }

    #[test]
    fn test_priority_strategies() {
        let applied = AppliedChange {
            timestamp: Utc.timestamp_opt(999, 0).unwrap(),
            source_id: "a".into(),
            applied_at: Instant::now(),
        };

        let source = ConflictResolver::new(ConflictStrategy::SourcePriority, "a");
        assert_eq!(
            source.resolve(&event_at("a", 1), &applied),
            Resolution::IncomingWins
        );
        assert_eq!(
            source.resolve(&event_at("b", 1), &applied),
            Resolution::IncomingLoses
        );

        let target = ConflictResolver::new(ConflictStrategy::TargetPriority, "a");
        assert_eq!(
            target.resolve(&event_at("a", 1), &applied),
            Resolution::IncomingLoses
        );
        assert_eq!(
            target.resolve(&event_at("b", 1), &applied),
            Resolution::IncomingWins
        );
    }

    #[test]
    fn test_loop_guard() {
        let guard = LoopGuard::new("a");
        assert!(!guard.is_echo(&event_at("a", 1)));
        assert!(guard.is_echo(&event_at("b", 1)));
    }
}
