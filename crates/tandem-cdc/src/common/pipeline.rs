//! Per-direction pipeline orchestrator
//!
//! Wires a source connector's event stream into the apply engine and the
//! offset store. Three tasks cooperate per direction: the connector's reader
//! (producer into a bounded channel), this writer loop (consumer), and the
//! checkpoint tick handled inside the same select so the offset file has
//! exactly one writer per stream.
//!
//! Ordering: the channel is FIFO and the writer applies strictly in arrival
//! order, so apply order equals source commit order. A position is only ever
//! checkpointed after the event carrying it was handled - applied, dropped
//! by the loop guard, or discarded as a conflict loser.

use crate::common::{
    ApplyOutcome, ChangeEvent, ConflictResolver, ConflictWindow, Connector, Error,
    ExponentialBackoff, LoopGuard, OffsetStore, Position, Result, SchemaCache, StreamCounters,
};
use crate::common::conflict::Resolution;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle states of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Connected,
    CdcReady,
    Streaming,
    Retrying,
    Stopping,
    Stopped,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Init => "INIT",
            StreamState::Connected => "CONNECTED",
            StreamState::CdcReady => "CDC_READY",
            StreamState::Streaming => "STREAMING",
            StreamState::Retrying => "RETRYING",
            StreamState::Stopping => "STOPPING",
            StreamState::Stopped => "STOPPED",
        };
        write!(f, "{name}")
    }
}

/// Static knobs for one pipeline direction.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Checkpoint key, `<source_id>-><target_id>`
    pub stream: String,
    /// Tables replicated on this stream
    pub tables: Vec<String>,
    pub max_retries: u32,
    pub checkpoint_interval: Duration,
    /// Skip poison events instead of halting
    pub skip_poison: bool,
    /// JSONL sink for poison events
    pub dead_letter_path: Option<PathBuf>,
}

/// Shape of one dead-letter record.
#[derive(Serialize)]
struct DeadLetterRecord<'a> {
    stream: &'a str,
    error: String,
    event: &'a ChangeEvent,
}

/// One replication direction: source log -> target apply.
pub struct Pipeline {
    opts: PipelineOptions,
    source: Box<dyn Connector>,
    target: Box<dyn Connector>,
    offsets: Arc<OffsetStore>,
    schema_cache: Arc<SchemaCache>,
    counters: Arc<StreamCounters>,
    resolver: ConflictResolver,
    guard: LoopGuard,
    /// Changes this direction applied; the reverse direction reads it
    own_window: Arc<ConflictWindow>,
    /// Changes the reverse direction applied; this direction reads it
    peer_window: Arc<ConflictWindow>,
    shutdown: watch::Receiver<bool>,
    state: StreamState,
    /// Newest handled position not yet checkpointed
    pending: Option<Position>,
    /// Last checkpointed position
    confirmed: Option<Position>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: PipelineOptions,
        source: Box<dyn Connector>,
        target: Box<dyn Connector>,
        offsets: Arc<OffsetStore>,
        schema_cache: Arc<SchemaCache>,
        counters: Arc<StreamCounters>,
        resolver: ConflictResolver,
        own_window: Arc<ConflictWindow>,
        peer_window: Arc<ConflictWindow>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let guard = LoopGuard::new(source.endpoint_id());
        Self {
            opts,
            source,
            target,
            offsets,
            schema_cache,
            counters,
            resolver,
            guard,
            own_window,
            peer_window,
            shutdown,
            state: StreamState::Init,
            pending: None,
            confirmed: None,
        }
    }

    /// Counters handle for external observers.
    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Drive the stream to completion. Returns `Ok` on graceful shutdown,
    /// the halting error otherwise.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;
        self.transition(StreamState::Stopping);

        // Best-effort final checkpoint and session teardown on every path.
        if let Err(e) = self.checkpoint().await {
            warn!(stream = %self.opts.stream, error = %e, "final checkpoint failed");
        }
        if let Err(e) = self.source.close().await {
            debug!(stream = %self.opts.stream, error = %e, "source close failed");
        }
        if let Err(e) = self.target.close().await {
            debug!(stream = %self.opts.stream, error = %e, "target close failed");
        }
        self.transition(StreamState::Stopped);

        info!(
            stream = %self.opts.stream,
            stats = ?self.counters.snapshot(),
            "stream stopped"
        );
        match result {
            Err(Error::Shutdown) => Ok(()),
            other => other,
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.source.connect().await?;
        self.target.connect().await?;
        self.transition(StreamState::Connected);

        self.source.setup_cdc(&self.opts.tables).await?;
        self.transition(StreamState::CdcReady);

        let resume = self
            .offsets
            .get(&self.opts.stream)
            .await
            .map(|entry| entry.position());
        match &resume {
            Some(pos) => info!(
                stream = %self.opts.stream,
                position = %pos,
                flavor = ?self.source.position_flavor(),
                "resuming"
            ),
            None => info!(
                stream = %self.opts.stream,
                flavor = ?self.source.position_flavor(),
                "no saved offset, starting at head"
            ),
        }
        self.confirmed = resume.clone();

        let mut rx = self.source.start_streaming(resume).await?;
        self.transition(StreamState::Streaming);

        let mut ticker = tokio::time::interval(self.opts.checkpoint_interval.max(
            // A zero interval means "checkpoint as often as possible", not
            // a busy loop.
            Duration::from_millis(100),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        info!(stream = %self.opts.stream, "shutdown signal received");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.checkpoint().await?;
                }
                received = rx.recv() => {
                    match received {
                        Some(event) => self.process_event(event).await?,
                        None => {
                            return Err(Error::other(format!(
                                "replication stream {} ended unexpectedly",
                                self.opts.stream
                            )));
                        }
                    }
                }
            }
        }

        // Flush whatever the reader already queued before stopping.
        while let Ok(event) = rx.try_recv() {
            self.process_event(event).await?;
        }
        Err(Error::Shutdown)
    }

    async fn process_event(&mut self, event: ChangeEvent) -> Result<()> {
        self.counters.record_received();

        if let Err(e) = event.validate() {
            return self.handle_poison(&event, e).await;
        }

        // Echo of our own apply reflected by the peer's log.
        if self.guard.is_echo(&event) {
            debug!(
                stream = %self.opts.stream,
                table = %event.qualified_table(),
                origin = %event.source_id,
                "dropping echoed event"
            );
            self.counters.record_skipped();
            self.mark_handled(&event);
            return Ok(());
        }

        // Same row touched by the opposite direction inside the window?
        if let Some(applied) = self.peer_window.lookup(&event) {
            self.counters.record_conflicted();
            match self.resolver.resolve(&event, &applied) {
                Resolution::IncomingLoses => {
                    info!(
                        stream = %self.opts.stream,
                        table = %event.qualified_table(),
                        "conflict resolved against incoming event"
                    );
                    self.mark_handled(&event);
                    return Ok(());
                }
                Resolution::IncomingWins | Resolution::NoConflict => {
                    info!(
                        stream = %self.opts.stream,
                        table = %event.qualified_table(),
                        "conflict resolved for incoming event"
                    );
                }
            }
        }

        match self.apply_with_retry(&event).await {
            Ok(()) => {
                self.counters.record_applied();
                self.own_window.record(&event);
                self.mark_handled(&event);
                Ok(())
            }
            Err(e) if e.is_transient() || matches!(e, Error::Shutdown) => Err(e),
            Err(e) => self.handle_poison(&event, e).await,
        }
    }

    async fn apply_with_retry(&mut self, event: &ChangeEvent) -> Result<()> {
        let mut backoff = ExponentialBackoff::standard();
        let mut drift_retried = false;

        loop {
            if *self.shutdown.borrow() {
                return Err(Error::Shutdown);
            }
            match self.target.apply_change(event).await {
                ApplyOutcome::Applied => {
                    if self.state == StreamState::Retrying {
                        self.transition(StreamState::Streaming);
                    }
                    return Ok(());
                }
                ApplyOutcome::Transient(e) => {
                    if backoff.attempt() >= self.opts.max_retries {
                        error!(
                            stream = %self.opts.stream,
                            error = %e,
                            attempts = backoff.attempt(),
                            "transient error exhausted retries"
                        );
                        return Err(e);
                    }
                    self.counters.record_retry();
                    if self.state == StreamState::Streaming {
                        self.transition(StreamState::Retrying);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        stream = %self.opts.stream,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient apply error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                ApplyOutcome::SchemaDrift(e) => {
                    if drift_retried {
                        return Err(e);
                    }
                    warn!(
                        stream = %self.opts.stream,
                        table = %event.qualified_table(),
                        error = %e,
                        "schema drift suspected, refreshing cached schema"
                    );
                    self.schema_cache
                        .invalidate(self.target.endpoint_id(), &event.schema, &event.table)
                        .await;
                    drift_retried = true;
                }
                ApplyOutcome::Permanent(e) => return Err(e),
            }
        }
    }

    /// A handled event's position becomes eligible for the next checkpoint,
    /// whether it was applied, echoed, or lost a conflict.
    fn mark_handled(&mut self, event: &ChangeEvent) {
        match &self.pending {
            Some(current) if !event.position.is_after(current) => {
                // Positions are non-decreasing per stream; equal positions
                // (several rows in one transaction) are expected.
                if event.position.compare(current).is_none() {
                    warn!(
                        stream = %self.opts.stream,
                        position = %event.position,
                        "event position not comparable to pending checkpoint"
                    );
                }
            }
            _ => self.pending = Some(event.position.clone()),
        }
    }

    async fn checkpoint(&mut self) -> Result<()> {
        let Some(pending) = self.pending.clone() else {
            return Ok(());
        };
        let advanced = match &self.confirmed {
            Some(confirmed) => pending.is_after(confirmed),
            None => true,
        };
        if !advanced {
            return Ok(());
        }

        // Offset write failure is fatal: a stream that cannot checkpoint
        // must not keep consuming.
        self.offsets
            .put(&self.opts.stream, &pending, Utc::now())
            .await?;

        if let Err(e) = self.source.confirm_position(&pending).await {
            // The source will re-request confirmation via keepalive; the
            // durable offset already advanced.
            warn!(stream = %self.opts.stream, error = %e, "confirm_position failed");
        }
        self.confirmed = Some(pending);
        Ok(())
    }

    async fn handle_poison(&mut self, event: &ChangeEvent, cause: Error) -> Result<()> {
        self.counters.record_error();
        error!(
            stream = %self.opts.stream,
            table = %event.qualified_table(),
            position = %event.position,
            event = ?event,
            error = %cause,
            "poison event"
        );
        self.write_dead_letter(event, &cause).await;

        if self.opts.skip_poison {
            self.counters.record_skipped();
            self.mark_handled(event);
            Ok(())
        } else {
            Err(cause)
        }
    }

    async fn write_dead_letter(&self, event: &ChangeEvent, cause: &Error) {
        let Some(path) = &self.opts.dead_letter_path else {
            return;
        };
        let record = DeadLetterRecord {
            stream: &self.opts.stream,
            error: cause.to_string(),
            event,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize dead-letter record");
                return;
            }
        };
        line.push('\n');

        let open = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match open {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "dead-letter write failed");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "dead-letter open failed"),
        }
    }

    fn transition(&mut self, next: StreamState) {
        if self.state == next {
            return;
        }
        info!(
            stream = %self.opts.stream,
            from = %self.state,
            to = %next,
            "stream state"
        );
        self.state = next;
    }
}

/// Convenience for daemon wiring: a shutdown channel pair.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
