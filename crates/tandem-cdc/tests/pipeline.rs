//! Pipeline behavior over an in-memory connector pair: propagation,
//! idempotent redelivery, conflict resolution, loop-guard filtering,
//! poison handling and checkpointing.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_cdc::{
    row_key, ApplyOutcome, ChangeEvent, ConflictResolver, ConflictStrategy, ConflictWindow,
    Connector, Error, OffsetStore, Op, Pipeline, PipelineOptions, Position, PositionFlavor,
    Result, Row, SchemaCache, StreamCounters, TableSchema, Value,
};
use tokio::sync::{mpsc, watch};

/// In-memory connector: plays a scripted event stream as a source and keeps
/// a primary-key-addressed row store as a target.
struct MockConnector {
    id: String,
    script: Mutex<Vec<ChangeEvent>>,
    /// Holds the stream open after the script drains
    stream_tx: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    store: Arc<Mutex<HashMap<String, Row>>>,
    confirmed: Arc<Mutex<Option<Position>>>,
    transient_failures: Arc<AtomicU32>,
    drift_failures: Arc<AtomicU32>,
}

impl MockConnector {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(Vec::new()),
            stream_tx: Mutex::new(None),
            store: Arc::new(Mutex::new(HashMap::new())),
            confirmed: Arc::new(Mutex::new(None)),
            transient_failures: Arc::new(AtomicU32::new(0)),
            drift_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    fn with_script(self, events: Vec<ChangeEvent>) -> Self {
        *self.script.lock().unwrap() = events;
        self
    }

    fn store_handle(&self) -> Arc<Mutex<HashMap<String, Row>>> {
        Arc::clone(&self.store)
    }

    fn confirmed_handle(&self) -> Arc<Mutex<Option<Position>>> {
        Arc::clone(&self.confirmed)
    }

    fn fail_transiently(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    fn fail_with_drift(&self, times: u32) {
        self.drift_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    fn position_flavor(&self) -> PositionFlavor {
        PositionFlavor::PostgresLsn
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn setup_cdc(&mut self, _tables: &[String]) -> Result<()> {
        Ok(())
    }

    async fn start_streaming(
        &mut self,
        _from: Option<Position>,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        for event in self.script.lock().unwrap().drain(..) {
            tx.try_send(event).expect("script fits the buffer");
        }
        *self.stream_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn get_table_schema(&self, table: &str) -> Result<TableSchema> {
        Ok(TableSchema {
            schema: "public".into(),
            table: table.into(),
            columns: vec![],
            primary_keys: vec!["id".into()],
            indexes: vec![],
        })
    }

    async fn apply_change(&self, event: &ChangeEvent) -> ApplyOutcome {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return ApplyOutcome::Transient(Error::transient("injected failure"));
        }
        let drifts = self.drift_failures.load(Ordering::SeqCst);
        if drifts > 0 {
            self.drift_failures.store(drifts - 1, Ordering::SeqCst);
            return ApplyOutcome::SchemaDrift(Error::drift("unknown column"));
        }

        let key = row_key(event);
        let mut store = self.store.lock().unwrap();
        match event.op {
            // Upsert semantics match the real engines' duplicate-key path.
            Op::Insert | Op::Snapshot | Op::Update => {
                if let Some(after) = &event.after {
                    store.insert(key, after.clone());
                }
            }
            Op::Delete => {
                // Missing row is a no-op, not an error.
                store.remove(&key);
            }
        }
        ApplyOutcome::Applied
    }

    async fn get_current_position(&self) -> Result<Position> {
        Ok(Position::postgres_lsn(0))
    }

    async fn confirm_position(&mut self, pos: &Position) -> Result<()> {
        *self.confirmed.lock().unwrap() = Some(pos.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream_tx.lock().unwrap().take();
        Ok(())
    }
}

fn insert_event(source: &str, id: i64, name: &str, lsn: u64, secs: i64) -> ChangeEvent {
    ChangeEvent::insert(
        "public",
        "users",
        Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int64(id), Value::from(name)],
        ),
        Row::new(vec!["id".into()], vec![Value::Int64(id)]),
        Position::postgres_lsn(lsn),
        Utc.timestamp_opt(secs, 0).unwrap(),
        source,
    )
}

fn update_event(source: &str, id: i64, name: &str, lsn: u64, secs: i64) -> ChangeEvent {
    let row = Row::new(
        vec!["id".into(), "name".into()],
        vec![Value::Int64(id), Value::from(name)],
    );
    ChangeEvent::update(
        "public",
        "users",
        row.clone(),
        row,
        Row::new(vec!["id".into()], vec![Value::Int64(id)]),
        Position::postgres_lsn(lsn),
        Utc.timestamp_opt(secs, 0).unwrap(),
        source,
    )
}

fn delete_event(source: &str, id: i64, lsn: u64, secs: i64) -> ChangeEvent {
    let row = Row::new(vec!["id".into()], vec![Value::Int64(id)]);
    ChangeEvent::delete(
        "public",
        "users",
        row.clone(),
        row,
        Position::postgres_lsn(lsn),
        Utc.timestamp_opt(secs, 0).unwrap(),
        source,
    )
}

struct Harness {
    pipeline: Pipeline,
    counters: Arc<StreamCounters>,
    offsets: Arc<OffsetStore>,
    shutdown_tx: watch::Sender<bool>,
    target_store: Arc<Mutex<HashMap<String, Row>>>,
    source_confirmed: Arc<Mutex<Option<Position>>>,
    peer_window: Arc<ConflictWindow>,
    _dir: tempfile::TempDir,
}

async fn harness(
    source: MockConnector,
    target: MockConnector,
    skip_poison: bool,
    dead_letter: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let offsets = Arc::new(OffsetStore::open(dir.path()).await.unwrap());
    let counters = Arc::new(StreamCounters::new());
    let schema_cache = Arc::new(SchemaCache::new());
    let own_window = Arc::new(ConflictWindow::new(Duration::from_secs(5)));
    let peer_window = Arc::new(ConflictWindow::new(Duration::from_secs(5)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let target_store = target.store_handle();
    let source_confirmed = source.confirmed_handle();

    let opts = PipelineOptions {
        stream: format!("{}->{}", source.endpoint_id(), target.endpoint_id()),
        tables: vec!["users".into()],
        max_retries: 3,
        checkpoint_interval: Duration::from_millis(50),
        skip_poison,
        dead_letter_path: dead_letter.then(|| dir.path().join("dead_letter.jsonl")),
    };

    let pipeline = Pipeline::new(
        opts,
        Box::new(source),
        Box::new(target),
        Arc::clone(&offsets),
        schema_cache,
        Arc::clone(&counters),
        ConflictResolver::new(ConflictStrategy::LastWriteWins, "a"),
        own_window,
        Arc::clone(&peer_window),
        shutdown_rx,
    );

    Harness {
        pipeline,
        counters,
        offsets,
        shutdown_tx,
        target_store,
        source_confirmed,
        peer_window,
        _dir: dir,
    }
}

/// Run the pipeline, give it `wait` to process, then shut down cleanly.
async fn run_for(mut harness: Harness, wait: Duration) -> (Harness, Result<()>) {
    let shutdown_tx = harness.shutdown_tx.clone();
    let handle = tokio::spawn(async move {
        let result = harness.pipeline.run().await;
        (harness, result)
    });
    tokio::time::sleep(wait).await;
    let _ = shutdown_tx.send(true);
    handle.await.unwrap()
}

async fn run_to_quiescence(harness: Harness) -> (Harness, Result<()>) {
    run_for(harness, Duration::from_millis(300)).await
}

#[tokio::test]
async fn insert_propagates_and_checkpoints() {
    let source = MockConnector::new("a").with_script(vec![insert_event("a", 1, "Ada", 0x100, 100)]);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let store = h.target_store.lock().unwrap();
    assert_eq!(store.len(), 1);
    let row = store.values().next().unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("Ada")));
    drop(store);

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_received, 1);
    assert_eq!(snap.events_applied, 1);
    assert_eq!(snap.errors, 0);

    // Offset advanced past the event's position and was confirmed upstream.
    let entry = h.offsets.get("a->b").await.unwrap();
    assert_eq!(entry.position, "0/100");
    assert_eq!(
        h.source_confirmed.lock().unwrap().clone().unwrap().value,
        "0/100"
    );
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    // The same committed events delivered twice, as after a crash before
    // the checkpoint was written.
    let events = vec![
        insert_event("a", 1, "Ada", 0x100, 100),
        update_event("a", 1, "Ada L.", 0x200, 101),
        insert_event("a", 1, "Ada", 0x100, 100),
        update_event("a", 1, "Ada L.", 0x200, 101),
    ];
    let source = MockConnector::new("a").with_script(events);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let store = h.target_store.lock().unwrap();
    assert_eq!(store.len(), 1, "row applied exactly once at the row level");
    assert_eq!(
        store.values().next().unwrap().get("name"),
        Some(&Value::from("Ada L."))
    );
    drop(store);

    assert_eq!(h.counters.snapshot().events_applied, 4);
    assert_eq!(h.counters.snapshot().errors, 0);
}

#[tokio::test]
async fn delete_of_missing_row_is_not_an_error() {
    let source = MockConnector::new("a").with_script(vec![delete_event("a", 7, 0x100, 100)]);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_applied, 1);
    assert_eq!(snap.errors, 0);
}

#[tokio::test]
async fn conflict_last_write_wins_drops_older_incoming() {
    let source = MockConnector::new("a").with_script(vec![update_event("a", 1, "X", 0x100, 100)]);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    // The reverse direction already applied a newer change to the same row.
    h.peer_window.record(&update_event("b", 1, "Y", 0x50, 101));

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_conflicted, 1);
    assert_eq!(snap.events_applied, 0, "older event loses and is dropped");
    assert!(h.target_store.lock().unwrap().is_empty());

    // The dropped event's position still checkpoints.
    assert_eq!(h.offsets.get("a->b").await.unwrap().position, "0/100");
}

#[tokio::test]
async fn conflict_last_write_wins_applies_newer_incoming() {
    let source = MockConnector::new("a").with_script(vec![update_event("a", 1, "X", 0x100, 102)]);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    h.peer_window.record(&update_event("b", 1, "Y", 0x50, 101));

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_conflicted, 1);
    assert_eq!(snap.events_applied, 1, "newer event wins");
    assert_eq!(
        h.target_store
            .lock()
            .unwrap()
            .values()
            .next()
            .unwrap()
            .get("name"),
        Some(&Value::from("X"))
    );
}

#[tokio::test]
async fn loop_guard_filters_echoed_events() {
    // An event surfacing from A's log but originating at B is an echo of
    // the relay's own apply and must not bounce back.
    let events = vec![
        insert_event("b", 1, "echo", 0x100, 100),
        insert_event("a", 2, "real", 0x200, 101),
    ];
    let source = MockConnector::new("a").with_script(events);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_received, 2);
    assert_eq!(snap.events_skipped, 1);
    assert_eq!(snap.events_applied, 1);
    assert_eq!(h.target_store.lock().unwrap().len(), 1);

    // Echo positions checkpoint too, so restart does not replay them.
    assert_eq!(h.offsets.get("a->b").await.unwrap().position, "0/200");
}

#[tokio::test]
async fn transient_failures_retry_until_applied() {
    let source = MockConnector::new("a").with_script(vec![insert_event("a", 1, "Ada", 0x100, 100)]);
    let target = MockConnector::new("b");
    target.fail_transiently(2);
    let h = harness(source, target, false, false).await;

    // Two backoff sleeps precede the successful attempt; leave headroom.
    let (h, result) = run_for(h, Duration::from_millis(1500)).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_applied, 1);
    assert_eq!(snap.retries, 2);
    assert_eq!(h.target_store.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn schema_drift_invalidates_and_retries_once() {
    let source = MockConnector::new("a").with_script(vec![insert_event("a", 1, "Ada", 0x100, 100)]);
    let target = MockConnector::new("b");
    target.fail_with_drift(1);
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.events_applied, 1, "drift triggers one refresh-and-retry");
    assert_eq!(snap.errors, 0);
    assert_eq!(h.target_store.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_schema_drift_is_poison() {
    let source = MockConnector::new("a").with_script(vec![insert_event("a", 1, "Ada", 0x100, 100)]);
    let target = MockConnector::new("b");
    target.fail_with_drift(2);
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    assert!(result.is_err(), "a second drift on the same event halts");
    assert_eq!(h.counters.snapshot().events_applied, 0);
}

#[tokio::test]
async fn poison_event_halts_stream_by_default() {
    let mut poison = insert_event("a", 1, "Ada", 0x100, 100);
    poison.primary_key = Row::empty();
    let source = MockConnector::new("a").with_script(vec![poison]);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    assert!(result.is_err(), "stream halts on poison without skip_poison");
    assert_eq!(h.counters.snapshot().errors, 1);
}

#[tokio::test]
async fn poison_event_skipped_and_dead_lettered_when_configured() {
    let mut poison = insert_event("a", 1, "Ada", 0x100, 100);
    poison.primary_key = Row::empty();
    let events = vec![poison, insert_event("a", 2, "Bob", 0x200, 101)];
    let source = MockConnector::new("a").with_script(events);
    let target = MockConnector::new("b");
    let h = harness(source, target, true, true).await;

    let dead_letter_path = h._dir.path().join("dead_letter.jsonl");
    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let snap = h.counters.snapshot();
    assert_eq!(snap.errors, 1);
    assert_eq!(snap.events_skipped, 1);
    assert_eq!(snap.events_applied, 1, "stream continues past the poison");

    let dead = std::fs::read_to_string(dead_letter_path).unwrap();
    assert_eq!(dead.lines().count(), 1);
    assert!(dead.contains("\"users\""));
}

#[tokio::test]
async fn positions_checkpoint_monotonically() {
    let events = vec![
        insert_event("a", 1, "one", 0x100, 100),
        insert_event("a", 2, "two", 0x200, 101),
        insert_event("a", 3, "three", 0x300, 102),
    ];
    let source = MockConnector::new("a").with_script(events);
    let target = MockConnector::new("b");
    let h = harness(source, target, false, false).await;

    let (h, result) = run_to_quiescence(h).await;
    result.unwrap();

    let entry = h.offsets.get("a->b").await.unwrap();
    assert_eq!(entry.position, "0/300");
    assert_eq!(entry.flavor, PositionFlavor::PostgresLsn);
}
