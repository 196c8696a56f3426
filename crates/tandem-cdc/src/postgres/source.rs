//! PostgreSQL connector implementation
//!
//! Query session via tokio-postgres, replication session via the raw
//! protocol client. Events are buffered per transaction and emitted on
//! COMMIT carrying the commit-time position, so a consumer never sees a
//! partial transaction from an aborted sender.
//!
//! ## Loop-guard wiring
//!
//! The query session registers a replication origin named after the peer
//! endpoint (`tandem_<peer>`) before any DML apply. Transactions written
//! under that origin reach the WAL tagged with it; the streaming side
//! decodes the Origin message and stamps such events with the peer's id, so
//! the pipeline's loop guard can drop them as echoes.

use crate::common::{
    ApplyOutcome, ChangeEvent, ColumnDef, Connector, EndpointConfig, Error, Op, Position,
    PositionFlavor, Result, Row, SchemaCache, SqlDialect, StatementCache, TableSchema, Value,
};
use crate::common::error::{pg_error_is_drift, pg_error_is_transient, pg_error_is_unique_violation};
use crate::common::schema::require_pk;
use crate::postgres::protocol::{
    decode_message, LogicalMessage, RelationBody, ReplicationClient, Tuple, TupleData, WalFrame,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Idle interval after which the stream proactively reports its positions,
/// keeping WAL retention bounded even on quiet databases.
const STANDBY_INTERVAL: Duration = Duration::from_secs(10);

/// Prefix for the relay's replication origins.
const ORIGIN_PREFIX: &str = "tandem_";

/// PostgreSQL CDC connector.
pub struct PostgresConnector {
    endpoint: EndpointConfig,
    peer_id: String,
    buffer_size: usize,
    schema_cache: Arc<SchemaCache>,
    statements: StatementCache,
    client: Mutex<Option<tokio_postgres::Client>>,
    /// Origin marker installed on the query session (first apply only;
    /// PostgreSQL allows one session per origin, so the source-role
    /// instance of an endpoint must never grab it)
    origin_ready: AtomicBool,
    /// Newest WAL position received by the stream task
    last_received: Arc<AtomicU64>,
    /// Newest WAL position durably applied at the target (flush LSN)
    confirmed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    streaming_started: bool,
}

impl PostgresConnector {
    pub fn new(
        endpoint: EndpointConfig,
        peer_id: &str,
        buffer_size: usize,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            endpoint,
            peer_id: peer_id.to_string(),
            buffer_size,
            schema_cache,
            statements: StatementCache::new(SqlDialect::Postgres),
            client: Mutex::new(None),
            origin_ready: AtomicBool::new(false),
            last_received: Arc::new(AtomicU64::new(0)),
            confirmed: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            streaming_started: false,
        }
    }

    fn slot_name(&self) -> &str {
        self.endpoint.slot_name.as_deref().unwrap_or("tandem_slot")
    }

    fn publication(&self) -> &str {
        self.endpoint.publication.as_deref().unwrap_or("tandem_pub")
    }

    fn origin_name(&self) -> String {
        format!("{ORIGIN_PREFIX}{}", self.peer_id)
    }

    async fn query_client(&self) -> Result<tokio::sync::MutexGuard<'_, Option<tokio_postgres::Client>>> {
        let guard = self.client.lock().await;
        if guard.is_none() {
            return Err(Error::other("postgres connector is not connected"));
        }
        Ok(guard)
    }

    /// Read-through schema lookup for this endpoint.
    async fn cached_schema(&self, schema: &str, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(entry) = self.schema_cache.get(&self.endpoint.id, schema, table).await {
            return Ok(entry);
        }
        let fresh = self.get_table_schema(table).await?;
        Ok(self.schema_cache.insert(&self.endpoint.id, fresh).await)
    }

    fn classify_apply_error(&self, schema: &str, table: &str, e: tokio_postgres::Error) -> ApplyOutcome {
        if pg_error_is_drift(&e) {
            self.statements.invalidate_table(schema, table);
            ApplyOutcome::SchemaDrift(Error::drift(e.to_string()))
        } else if pg_error_is_transient(&e) {
            ApplyOutcome::Transient(Error::Postgres(e))
        } else {
            ApplyOutcome::Permanent(Error::Postgres(e))
        }
    }

    async fn apply_insert(
        &self,
        client: &tokio_postgres::Client,
        event: &ChangeEvent,
        schema: &TableSchema,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let after = event.after.as_ref().expect("validated insert has after");
        let columns = after.columns().to_vec();
        let sql = self
            .statements
            .insert_stmt(&event.schema, &event.table, &columns);
        let params = bind_params(after.values(), &columns, schema);

        match execute(client, &sql, &params).await {
            Ok(_) => Ok(()),
            Err(e) if pg_error_is_unique_violation(&e) => {
                // At-least-once redelivery: the row is already there, finish
                // the write as an update keyed by the new primary key.
                debug!(
                    table = %event.qualified_table(),
                    "duplicate key on insert, falling back to update"
                );
                let pk = event
                    .new_primary_key()
                    .unwrap_or_else(|| event.primary_key.clone());
                self.update_by_pk(client, event, schema, after, &pk).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update_by_pk(
        &self,
        client: &tokio_postgres::Client,
        event: &ChangeEvent,
        schema: &TableSchema,
        after: &Row,
        pk: &Row,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let set_columns: Vec<String> = after
            .columns()
            .iter()
            .filter(|c| !pk.columns().iter().any(|p| p.eq_ignore_ascii_case(c)))
            .cloned()
            .collect();
        if set_columns.is_empty() {
            // Key-only table: the duplicate row is already the target state.
            return Ok(());
        }
        let sql = self.statements.update_stmt(
            &event.schema,
            &event.table,
            &set_columns,
            &pk.columns().to_vec(),
        );

        let mut values: Vec<Value> = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        for c in &set_columns {
            columns.push(c.clone());
            values.push(after.get(c).cloned().unwrap_or(Value::Null));
        }
        for (c, v) in pk.iter() {
            columns.push(c.to_string());
            values.push(v.clone());
        }
        let params = bind_params(&values, &columns, schema);
        let affected = execute(client, &sql, &params).await?;
        if affected == 0 {
            debug!(
                table = %event.qualified_table(),
                "update matched no row, treating as already converged"
            );
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        client: &tokio_postgres::Client,
        event: &ChangeEvent,
        schema: &TableSchema,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let after = event.after.as_ref().expect("validated update has after");

        if event.is_pk_change() {
            // Old row out, new row in, atomically on the target.
            return self.apply_pk_change(client, event, schema).await;
        }
        self.update_by_pk(client, event, schema, after, &event.primary_key)
            .await
    }

    async fn apply_pk_change(
        &self,
        client: &tokio_postgres::Client,
        event: &ChangeEvent,
        schema: &TableSchema,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let after = event.after.as_ref().expect("validated update has after");

        execute(client, "BEGIN", &[]).await?;
        let result: std::result::Result<(), tokio_postgres::Error> = async {
            let pk_columns = event.primary_key.columns().to_vec();
            let delete = self
                .statements
                .delete_stmt(&event.schema, &event.table, &pk_columns);
            let params = bind_params(
                event.primary_key.values(),
                &pk_columns,
                schema,
            );
            execute(client, &delete, &params).await?;

            let columns = after.columns().to_vec();
            let insert = self
                .statements
                .insert_stmt(&event.schema, &event.table, &columns);
            let params = bind_params(after.values(), &columns, schema);
            execute(client, &insert, &params).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => execute(client, "COMMIT", &[]).await.map(|_| ()),
            Err(e) => {
                let _ = execute(client, "ROLLBACK", &[]).await;
                Err(e)
            }
        }
    }

    async fn apply_delete(
        &self,
        client: &tokio_postgres::Client,
        event: &ChangeEvent,
        schema: &TableSchema,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let pk_columns = event.primary_key.columns().to_vec();
        let sql = self
            .statements
            .delete_stmt(&event.schema, &event.table, &pk_columns);
        let params = bind_params(event.primary_key.values(), &pk_columns, schema);
        let affected = execute(client, &sql, &params).await?;
        if affected == 0 {
            debug!(
                table = %event.qualified_table(),
                "delete matched no row, already gone"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    fn position_flavor(&self) -> PositionFlavor {
        PositionFlavor::PostgresLsn
    }

    async fn connect(&mut self) -> Result<()> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.endpoint.host)
            .port(self.endpoint.port)
            .user(&self.endpoint.user)
            .password(&self.endpoint.password)
            .dbname(&self.endpoint.database)
            .application_name("tandem")
            .options("-c statement_timeout=30000")
            .connect_timeout(Duration::from_secs(10));

        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(classify_connect_error)?;

        let endpoint_id = self.endpoint.id.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(endpoint = %endpoint_id, error = %e, "postgres connection task ended");
            }
        });

        info!(endpoint = %self.endpoint.id, "postgres query session ready");
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn setup_cdc(&mut self, tables: &[String]) -> Result<()> {
        let guard = self.query_client().await?;
        let client = guard.as_ref().expect("checked by query_client");

        // Replicated tables must have a catalog primary key.
        for table in tables {
            let schema = fetch_table_schema(client, table).await?;
            require_pk(&schema)?;
            self.schema_cache.insert(&self.endpoint.id, schema).await;
        }

        // Replication slot: create if absent, verify the plugin if present.
        let slot = self.slot_name().to_string();
        let rows = client
            .query(
                "SELECT plugin FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await?;
        match rows.first() {
            Some(row) => {
                let plugin: String = row.get(0);
                if plugin != "pgoutput" {
                    return Err(Error::precondition(format!(
                        "slot {slot} exists with plugin {plugin}, expected pgoutput"
                    )));
                }
                info!(slot = %slot, "replication slot already exists");
            }
            None => {
                client
                    .query(
                        "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                        &[&slot],
                    )
                    .await?;
                info!(slot = %slot, "created replication slot");
            }
        }

        // Publication: create for exactly the configured tables, or verify
        // the existing one covers them.
        let publication = self.publication().to_string();
        let rows = client
            .query(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&publication],
            )
            .await?;
        if rows.is_empty() {
            let dialect = SqlDialect::Postgres;
            let table_list: Vec<String> =
                tables.iter().map(|t| dialect.quote_ident(t)).collect();
            let create = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                dialect.quote_ident(&publication),
                table_list.join(", ")
            );
            client.execute(create.as_str(), &[]).await?;
            info!(publication = %publication, tables = ?tables, "created publication");
        } else {
            // The publication scopes what the slot streams, so it must match
            // the configured set exactly; extra tables would replicate too.
            let published: Vec<String> = client
                .query(
                    "SELECT tablename FROM pg_publication_tables WHERE pubname = $1",
                    &[&publication],
                )
                .await?
                .into_iter()
                .map(|row| row.get::<_, String>(0))
                .collect();
            for table in tables {
                if !published.iter().any(|p| p == table) {
                    return Err(Error::precondition(format!(
                        "publication {publication} exists but does not include table {table}"
                    )));
                }
            }
            for table in &published {
                if !tables.iter().any(|t| t == table) {
                    return Err(Error::precondition(format!(
                        "publication {publication} includes unconfigured table {table}"
                    )));
                }
            }
            info!(publication = %publication, "publication matches configured tables");
        }

        Ok(())
    }

    async fn start_streaming(
        &mut self,
        from: Option<Position>,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        if self.streaming_started {
            return Err(Error::other(
                "postgres connector instance already streamed once",
            ));
        }
        self.streaming_started = true;
        self.running.store(true, Ordering::SeqCst);

        let start_lsn = match &from {
            Some(pos) => pos.parse_lsn().ok_or_else(|| {
                Error::decode(format!("cannot parse resume LSN '{}'", pos.value))
            })?,
            // Zero resumes from the slot's confirmed position.
            None => 0,
        };
        self.confirmed.store(start_lsn, Ordering::SeqCst);
        self.last_received.store(start_lsn, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        let reader = StreamReader {
            endpoint: self.endpoint.clone(),
            slot: self.slot_name().to_string(),
            publication: self.publication().to_string(),
            own_id: self.endpoint.id.clone(),
            start_lsn,
            last_received: Arc::clone(&self.last_received),
            confirmed: Arc::clone(&self.confirmed),
            running: Arc::clone(&self.running),
        };

        tokio::spawn(async move {
            match reader.run(tx).await {
                Ok(()) => info!("postgres replication stream finished"),
                Err(e) => error!(error = %e, "postgres replication stream failed"),
            }
        });

        Ok(rx)
    }

    async fn get_table_schema(&self, table: &str) -> Result<TableSchema> {
        let guard = self.query_client().await?;
        let client = guard.as_ref().expect("checked by query_client");
        fetch_table_schema(client, table).await
    }

    async fn apply_change(&self, event: &ChangeEvent) -> ApplyOutcome {
        let schema = match self.cached_schema(&event.schema, &event.table).await {
            Ok(schema) => schema,
            Err(e) => return ApplyOutcome::Transient(e),
        };

        let guard = match self.query_client().await {
            Ok(guard) => guard,
            Err(e) => return ApplyOutcome::Transient(e),
        };
        let client = guard.as_ref().expect("checked by query_client");

        // Loop-guard marker, installed once on the apply session: writes
        // carry the peer's replication origin so the reverse tailer can
        // recognize them as relay echoes.
        if !self.origin_ready.load(Ordering::SeqCst) {
            let origin = self.origin_name();
            let setup = async {
                client
                    .execute(
                        "SELECT pg_replication_origin_create($1) \
                         WHERE NOT EXISTS \
                         (SELECT 1 FROM pg_replication_origin WHERE roname = $1)",
                        &[&origin],
                    )
                    .await?;
                client
                    .execute("SELECT pg_replication_origin_session_setup($1)", &[&origin])
                    .await
            };
            if let Err(e) = setup.await {
                return ApplyOutcome::Transient(Error::Postgres(e));
            }
            info!(endpoint = %self.endpoint.id, origin = %origin, "apply origin installed");
            self.origin_ready.store(true, Ordering::SeqCst);
        }

        let result = match event.op {
            Op::Insert | Op::Snapshot => self.apply_insert(client, event, &schema).await,
            Op::Update => self.apply_update(client, event, &schema).await,
            Op::Delete => self.apply_delete(client, event, &schema).await,
        };

        match result {
            Ok(()) => ApplyOutcome::Applied,
            Err(e) => self.classify_apply_error(&event.schema, &event.table, e),
        }
    }

    async fn get_current_position(&self) -> Result<Position> {
        let guard = self.query_client().await?;
        let client = guard.as_ref().expect("checked by query_client");
        let row = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        Ok(Position::postgres_lsn_str(row.get::<_, String>(0)))
    }

    async fn confirm_position(&mut self, pos: &Position) -> Result<()> {
        let lsn = pos.parse_lsn().ok_or_else(|| {
            Error::decode(format!("cannot parse LSN '{}' for confirmation", pos.value))
        })?;
        // The stream task reports this as the flush LSN on its next status
        // update, advancing the slot and releasing WAL.
        self.confirmed.fetch_max(lsn, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.client.lock().await.take();
        info!(endpoint = %self.endpoint.id, "postgres connector closed");
        Ok(())
    }
}

/// State carried into the spawned replication reader task.
struct StreamReader {
    endpoint: EndpointConfig,
    slot: String,
    publication: String,
    own_id: String,
    start_lsn: u64,
    last_received: Arc<AtomicU64>,
    confirmed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

/// Per-transaction decode state.
#[derive(Default)]
struct TxnState {
    commit_ts: Option<DateTime<Utc>>,
    origin: Option<String>,
    events: Vec<PendingEvent>,
}

/// Event decoded mid-transaction, before the commit position is known.
struct PendingEvent {
    op: Op,
    schema: String,
    table: String,
    before: Option<Row>,
    after: Option<Row>,
    primary_key: Row,
}

impl StreamReader {
    async fn run(self, tx: mpsc::Sender<ChangeEvent>) -> anyhow::Result<()> {
        let client = ReplicationClient::connect(
            &self.endpoint.host,
            self.endpoint.port,
            &self.endpoint.user,
            &self.endpoint.database,
            Some(&self.endpoint.password),
        )
        .await?;
        let mut stream = client
            .start_replication(&self.slot, self.start_lsn, &self.publication)
            .await?;

        let mut relations: HashMap<u32, RelationBody> = HashMap::new();
        let mut txn = TxnState::default();

        while self.running.load(Ordering::SeqCst) {
            let frame = match tokio::time::timeout(STANDBY_INTERVAL, stream.next_message()).await {
                Ok(Ok(Some(payload))) => WalFrame::parse(payload)?,
                Ok(Ok(None)) => {
                    if !txn.events.is_empty() {
                        warn!(
                            buffered = txn.events.len(),
                            "stream ended mid-transaction, dropping uncommitted events"
                        );
                    }
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // Idle: report progress so the server can trim WAL.
                    let write = self.last_received.load(Ordering::SeqCst);
                    let flush = self.confirmed.load(Ordering::SeqCst);
                    stream.send_status_update(write, flush, false).await?;
                    continue;
                }
            };

            match frame {
                WalFrame::KeepAlive {
                    wal_end,
                    reply_requested,
                } => {
                    self.last_received.fetch_max(wal_end, Ordering::SeqCst);
                    if reply_requested {
                        let write = self.last_received.load(Ordering::SeqCst);
                        let flush = self.confirmed.load(Ordering::SeqCst);
                        stream.send_status_update(write, flush, false).await?;
                    }
                }
                WalFrame::XLogData { wal_end, mut data, .. } => {
                    self.last_received.fetch_max(wal_end, Ordering::SeqCst);
                    let message = match decode_message(&mut data) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable pgoutput message");
                            continue;
                        }
                    };
                    if !self
                        .handle_message(message, &mut relations, &mut txn, &tx)
                        .await
                    {
                        return Ok(()); // receiver dropped
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns false when the event receiver is gone.
    async fn handle_message(
        &self,
        message: LogicalMessage,
        relations: &mut HashMap<u32, RelationBody>,
        txn: &mut TxnState,
        tx: &mpsc::Sender<ChangeEvent>,
    ) -> bool {
        match message {
            LogicalMessage::Relation(rel) => {
                debug!(relation = %format!("{}.{}", rel.namespace, rel.name), "relation metadata");
                relations.insert(rel.id, rel);
            }
            LogicalMessage::Begin(begin) => {
                *txn = TxnState {
                    commit_ts: Some(pg_micros_to_utc(begin.timestamp)),
                    origin: None,
                    events: Vec::new(),
                };
            }
            LogicalMessage::Origin(origin) => {
                txn.origin = Some(origin.name);
            }
            LogicalMessage::Insert(ins) => {
                if let Some(rel) = relations.get(&ins.relation_id) {
                    if let Some(event) = decode_insert_event(rel, &ins.tuple) {
                        txn.events.push(event);
                    }
                }
            }
            LogicalMessage::Update(upd) => {
                if let Some(rel) = relations.get(&upd.relation_id) {
                    if let Some(event) =
                        decode_update_event(rel, upd.old_tuple.as_ref(), &upd.new_tuple)
                    {
                        txn.events.push(event);
                    }
                }
            }
            LogicalMessage::Delete(del) => {
                if let Some(rel) = relations.get(&del.relation_id) {
                    if let Some(event) = decode_delete_event(rel, del.old_tuple.as_ref()) {
                        txn.events.push(event);
                    }
                }
            }
            LogicalMessage::Commit(commit) => {
                let position = Position::postgres_lsn(commit.end_lsn);
                let timestamp = txn
                    .commit_ts
                    .unwrap_or_else(|| pg_micros_to_utc(commit.timestamp));
                // A foreign origin means the relay's own apply session wrote
                // this transaction; surface the true source so the pipeline
                // can drop the echo.
                let source_id = match txn.origin.as_deref().and_then(strip_origin) {
                    Some(peer) => peer.to_string(),
                    None => self.own_id.clone(),
                };

                for pending in txn.events.drain(..) {
                    let event = ChangeEvent {
                        op: pending.op,
                        schema: pending.schema,
                        table: pending.table,
                        timestamp,
                        before: pending.before,
                        after: pending.after,
                        primary_key: pending.primary_key,
                        position: position.clone(),
                        source_id: source_id.clone(),
                    };
                    if tx.send(event).await.is_err() {
                        info!("event receiver dropped, stopping stream");
                        return false;
                    }
                }
            }
            LogicalMessage::Type(_) | LogicalMessage::Truncate(_) => {
                debug!("ignoring non-DML logical message");
            }
        }
        true
    }
}

fn strip_origin(name: &str) -> Option<&str> {
    name.strip_prefix(ORIGIN_PREFIX)
}

fn decode_insert_event(rel: &RelationBody, tuple: &Tuple) -> Option<PendingEvent> {
    let after = tuple_to_row(tuple, rel);
    let key_columns = rel.key_column_names();
    let primary_key = after.project(&key_columns)?;
    Some(PendingEvent {
        op: Op::Insert,
        schema: rel.namespace.clone(),
        table: rel.name.clone(),
        before: None,
        after: Some(after),
        primary_key,
    })
}

fn decode_update_event(
    rel: &RelationBody,
    old_tuple: Option<&Tuple>,
    new_tuple: &Tuple,
) -> Option<PendingEvent> {
    let after = tuple_to_row(new_tuple, rel);
    let key_columns = rel.key_column_names();

    let before = match old_tuple {
        Some(old) => {
            let full = tuple_to_row(old, rel);
            if rel.replica_identity == b'f' {
                full
            } else {
                // Key images carry nulls in non-key columns; restrict the
                // before image to what the source actually sent.
                full.project(&key_columns).unwrap_or(full)
            }
        }
        // No key column changed: the old key equals the new key.
        None => after.project(&key_columns)?,
    };

    let primary_key = before.project(&key_columns).or_else(|| after.project(&key_columns))?;
    Some(PendingEvent {
        op: Op::Update,
        schema: rel.namespace.clone(),
        table: rel.name.clone(),
        before: Some(before),
        after: Some(after),
        primary_key,
    })
}

fn decode_delete_event(rel: &RelationBody, old_tuple: Option<&Tuple>) -> Option<PendingEvent> {
    let old = old_tuple?;
    let full = tuple_to_row(old, rel);
    let key_columns = rel.key_column_names();
    let before = if rel.replica_identity == b'f' {
        full
    } else {
        full.project(&key_columns).unwrap_or(full)
    };
    let primary_key = before.project(&key_columns)?;
    Some(PendingEvent {
        op: Op::Delete,
        schema: rel.namespace.clone(),
        table: rel.name.clone(),
        before: Some(before),
        after: None,
        primary_key,
    })
}

/// Decode a text-format tuple into a typed row using the relation's type
/// OIDs. Unchanged TOAST columns are omitted so the apply engine never
/// overwrites them with placeholders.
fn tuple_to_row(tuple: &Tuple, rel: &RelationBody) -> Row {
    let mut row = Row::empty();
    for (i, data) in tuple.0.iter().enumerate() {
        let Some(column) = rel.columns.get(i) else {
            warn!(
                index = i,
                relation = %rel.name,
                "tuple has more columns than cached relation, possible drift"
            );
            continue;
        };
        match data {
            TupleData::Null => row.push(column.name.clone(), Value::Null),
            TupleData::Toast => {}
            TupleData::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                row.push(column.name.clone(), pg_text_to_value(&text, column.type_id));
            }
        }
    }
    row
}

/// PostgreSQL type OIDs (`pg_type.dat`) the decoder maps to typed values.
mod oid {
    pub const BOOL: i32 = 16;
    pub const BYTEA: i32 = 17;
    pub const INT8: i32 = 20;
    pub const INT2: i32 = 21;
    pub const INT4: i32 = 23;
    pub const OID: i32 = 26;
    pub const JSON: i32 = 114;
    pub const FLOAT4: i32 = 700;
    pub const FLOAT8: i32 = 701;
    pub const DATE: i32 = 1082;
    pub const TIME: i32 = 1083;
    pub const TIMESTAMP: i32 = 1114;
    pub const TIMESTAMPTZ: i32 = 1184;
    pub const NUMERIC: i32 = 1700;
    pub const UUID: i32 = 2950;
    pub const JSONB: i32 = 3802;
}

fn pg_text_to_value(text: &str, type_oid: i32) -> Value {
    match type_oid {
        oid::BOOL => match text {
            "t" | "true" | "TRUE" => Value::Bool(true),
            "f" | "false" | "FALSE" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        oid::INT2 => text
            .parse::<i16>()
            .map(Value::Int16)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::INT4 | oid::OID => text
            .parse::<i32>()
            .map(Value::Int32)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::INT8 => text
            .parse::<i64>()
            .map(Value::Int64)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::FLOAT4 => text
            .parse::<f32>()
            .map(Value::Float32)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::FLOAT8 => text
            .parse::<f64>()
            .map(Value::Float64)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::NUMERIC => Decimal::from_str(text)
            .map(Value::Decimal)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::JSON | oid::JSONB => serde_json::from_str(text)
            .map(Value::Json)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::UUID => uuid::Uuid::parse_str(text)
            .map(Value::Uuid)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::BYTEA => text
            .strip_prefix("\\x")
            .and_then(|h| hex::decode(h).ok())
            .map(Value::Bytes)
            .unwrap_or_else(|| Value::String(text.to_string())),
        oid::DATE => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::TIME => chrono::NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .map(Value::Time)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::TIMESTAMP => {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::DateTime)
                .unwrap_or_else(|_| Value::String(text.to_string()))
        }
        oid::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|dt| Value::DateTimeTz(dt.with_timezone(&Utc)))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// Convert PostgreSQL epoch microseconds (2000-01-01) to UTC.
fn pg_micros_to_utc(micros: i64) -> DateTime<Utc> {
    const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;
    let secs = PG_EPOCH_UNIX_SECS + micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn fetch_table_schema(
    client: &tokio_postgres::Client,
    table: &str,
) -> Result<TableSchema> {
    let column_rows = client
        .query(
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )
        .await?;
    if column_rows.is_empty() {
        return Err(Error::precondition(format!(
            "table {table} does not exist on this endpoint"
        )));
    }

    let columns = column_rows
        .into_iter()
        .map(|row| ColumnDef {
            name: row.get(0),
            data_type: row.get(1),
            nullable: row.get::<_, String>(2) == "YES",
            default: row.get(3),
        })
        .collect();

    let pk_rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = $1::text::regclass AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table],
        )
        .await?;
    let primary_keys = pk_rows.into_iter().map(|row| row.get(0)).collect();

    let index_rows = client
        .query(
            "SELECT indexname FROM pg_indexes \
             WHERE schemaname = 'public' AND tablename = $1",
            &[&table],
        )
        .await?;
    let indexes = index_rows.into_iter().map(|row| row.get(0)).collect();

    Ok(TableSchema {
        schema: "public".to_string(),
        table: table.to_string(),
        columns,
        primary_keys,
        indexes,
    })
}

/// Box typed values into tokio-postgres parameters, coercing each to the
/// target column's declared type first.
fn bind_params(
    values: &[Value],
    columns: &[String],
    schema: &TableSchema,
) -> Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>> {
    values
        .iter()
        .zip(columns.iter())
        .map(|(value, column)| {
            let coerced = match schema.column(column) {
                Some(def) => coerce_value(value.clone(), def),
                None => value.clone(),
            };
            value_to_sql(coerced)
        })
        .collect()
}

/// NULL parameter that binds against any column type. `Option<T>` cannot do
/// this: its type check is tied to `T`, not to the target column.
#[derive(Debug)]
struct SqlNull;

impl tokio_postgres::types::ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &tokio_postgres::types::Type,
        _out: &mut bytes::BytesMut,
    ) -> std::result::Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>>
    {
        Ok(tokio_postgres::types::IsNull::Yes)
    }

    fn accepts(_ty: &tokio_postgres::types::Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn value_to_sql(value: Value) -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(SqlNull),
        Value::Bool(b) => Box::new(b),
        Value::Int16(n) => Box::new(n),
        Value::Int32(n) => Box::new(n),
        Value::Int64(n) => Box::new(n),
        Value::Float32(n) => Box::new(n),
        Value::Float64(n) => Box::new(n),
        Value::Decimal(d) => Box::new(d),
        Value::String(s) => Box::new(s),
        Value::Bytes(b) => Box::new(b),
        Value::Date(d) => Box::new(d),
        Value::Time(t) => Box::new(t),
        Value::DateTime(dt) => Box::new(dt),
        Value::DateTimeTz(dt) => Box::new(dt),
        Value::Uuid(u) => Box::new(u),
        Value::Json(j) => Box::new(j),
    }
}

/// Nudge a value toward the target column's declared type. Cross-engine
/// streams need this constantly: MySQL's binlog widens every integer to
/// 64 bits, while tokio-postgres binds parameters strictly by type.
fn coerce_value(value: Value, column: &ColumnDef) -> Value {
    let ty = column.data_type.to_ascii_lowercase();
    match (&value, ty.as_str()) {
        (Value::Int64(n), "smallint") => i16::try_from(*n).map(Value::Int16).unwrap_or(value),
        (Value::Int64(n), "integer") => i32::try_from(*n).map(Value::Int32).unwrap_or(value),
        (Value::Int32(n), "smallint") => i16::try_from(*n).map(Value::Int16).unwrap_or(value),
        (Value::Int32(n), "bigint") => Value::Int64(i64::from(*n)),
        (Value::Int16(n), "integer") => Value::Int32(i32::from(*n)),
        (Value::Int16(n), "bigint") => Value::Int64(i64::from(*n)),
        (Value::Int16(n), "boolean") => Value::Bool(*n != 0),
        (Value::Int64(n), "boolean") => Value::Bool(*n != 0),
        (Value::Int64(n), "numeric") => Value::Decimal(Decimal::from(*n)),
        (Value::Float64(n), "real") => Value::Float32(*n as f32),
        (Value::Float32(n), "double precision") => Value::Float64(f64::from(*n)),
        (Value::String(s), "numeric") => {
            Decimal::from_str(s).map(Value::Decimal).unwrap_or(value)
        }
        (Value::String(s), "uuid") => uuid::Uuid::parse_str(s).map(Value::Uuid).unwrap_or(value),
        (Value::String(s), "json" | "jsonb") => serde_json::from_str(s)
            .map(Value::Json)
            .unwrap_or(value),
        (Value::DateTime(dt), "timestamp with time zone") => {
            Value::DateTimeTz(Utc.from_utc_datetime(dt))
        }
        (Value::DateTimeTz(dt), "timestamp without time zone") => {
            Value::DateTime(dt.naive_utc())
        }
        _ => value,
    }
}

async fn execute(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[Box<dyn tokio_postgres::types::ToSql + Sync + Send>],
) -> std::result::Result<u64, tokio_postgres::Error> {
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect();
    client.execute(sql, &refs).await
}

fn classify_connect_error(e: tokio_postgres::Error) -> Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code.starts_with("28") {
            return Error::ConnAuth(db.message().to_string());
        }
        if code == "0A000" {
            return Error::ConnProtocolUnsupported(db.message().to_string());
        }
    }
    let msg = e.to_string();
    if msg.contains("timed out") || msg.contains("refused") || msg.contains("error connecting") {
        Error::ConnUnreachable(msg)
    } else {
        Error::Postgres(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::protocol::{Column, COLUMN_FLAG_KEY};
    use bytes::Bytes;

    fn users_relation() -> RelationBody {
        RelationBody {
            id: 16384,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![
                Column {
                    flags: COLUMN_FLAG_KEY,
                    name: "id".into(),
                    type_id: oid::INT8,
                    type_mode: -1,
                },
                Column {
                    flags: 0,
                    name: "name".into(),
                    type_id: 25, // text
                    type_mode: -1,
                },
            ],
        }
    }

    fn text_tuple(values: &[Option<&str>]) -> Tuple {
        Tuple(
            values
                .iter()
                .map(|v| match v {
                    Some(s) => TupleData::Text(Bytes::copy_from_slice(s.as_bytes())),
                    None => TupleData::Null,
                })
                .collect(),
        )
    }

    #[test]
    fn test_pg_text_to_value_typing() {
        assert_eq!(pg_text_to_value("t", oid::BOOL), Value::Bool(true));
        assert_eq!(pg_text_to_value("42", oid::INT4), Value::Int32(42));
        assert_eq!(pg_text_to_value("42", oid::INT8), Value::Int64(42));
        assert_eq!(
            pg_text_to_value("1.5", oid::FLOAT8),
            Value::Float64(1.5)
        );
        assert_eq!(
            pg_text_to_value("12.34", oid::NUMERIC),
            Value::Decimal(Decimal::from_str("12.34").unwrap())
        );
        assert_eq!(
            pg_text_to_value(r#"{"k":1}"#, oid::JSONB),
            Value::Json(serde_json::json!({"k": 1}))
        );
        assert_eq!(
            pg_text_to_value("\\x0102", oid::BYTEA),
            Value::Bytes(vec![1, 2])
        );
        // Unknown OIDs stay textual
        assert_eq!(
            pg_text_to_value("hello", 25),
            Value::String("hello".into())
        );
    }

    #[test]
    fn test_pg_text_timestamp_parsing() {
        match pg_text_to_value("2024-03-01 12:30:45.5", oid::TIMESTAMP) {
            Value::DateTime(dt) => assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-03-01"),
            other => panic!("expected DateTime, got {other:?}"),
        }
        match pg_text_to_value("2024-03-01 12:30:45+00", oid::TIMESTAMPTZ) {
            Value::DateTimeTz(_) => {}
            other => panic!("expected DateTimeTz, got {other:?}"),
        }
    }

    #[test]
    fn test_tuple_to_row_skips_toast() {
        let rel = users_relation();
        let tuple = Tuple(vec![
            TupleData::Text(Bytes::from_static(b"1")),
            TupleData::Toast,
        ]);
        let row = tuple_to_row(&tuple, &rel);
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("id"), Some(&Value::Int64(1)));
        assert!(row.get("name").is_none());
    }

    #[test]
    fn test_decode_insert_event() {
        let rel = users_relation();
        let event = decode_insert_event(&rel, &text_tuple(&[Some("7"), Some("Ada")])).unwrap();
        assert_eq!(event.op, Op::Insert);
        assert_eq!(event.primary_key.get("id"), Some(&Value::Int64(7)));
        assert!(event.before.is_none());
    }

    #[test]
    fn test_decode_update_without_old_tuple_uses_new_key() {
        let rel = users_relation();
        let event =
            decode_update_event(&rel, None, &text_tuple(&[Some("7"), Some("Ada L.")])).unwrap();
        assert_eq!(event.primary_key.get("id"), Some(&Value::Int64(7)));
        // Before restricted to the key when the source sent no old image
        assert_eq!(event.before.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_update_key_image_restricted_to_pk() {
        let rel = users_relation();
        // Key image: non-key columns arrive as nulls
        let old = text_tuple(&[Some("7"), None]);
        let event =
            decode_update_event(&rel, Some(&old), &text_tuple(&[Some("8"), Some("Ada")]))
                .unwrap();
        let before = event.before.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before.get("id"), Some(&Value::Int64(7)));
        // Old key becomes the event's primary key
        assert_eq!(event.primary_key.get("id"), Some(&Value::Int64(7)));
    }

    #[test]
    fn test_decode_delete_event() {
        let rel = users_relation();
        let event = decode_delete_event(&rel, Some(&text_tuple(&[Some("7"), None]))).unwrap();
        assert_eq!(event.op, Op::Delete);
        assert!(event.after.is_none());
        assert_eq!(event.primary_key.get("id"), Some(&Value::Int64(7)));

        assert!(decode_delete_event(&rel, None).is_none());
    }

    #[test]
    fn test_pg_micros_to_utc() {
        // 2000-01-01 00:00:00 UTC exactly
        assert_eq!(
            pg_micros_to_utc(0),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
        );
        // One day later
        assert_eq!(
            pg_micros_to_utc(86_400_000_000),
            Utc.with_ymd_and_hms(2000, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_sql_null_binds_any_type() {
        use tokio_postgres::types::{IsNull, ToSql, Type};
        assert!(<SqlNull as ToSql>::accepts(&Type::INT4));
        assert!(<SqlNull as ToSql>::accepts(&Type::TEXT));
        assert!(<SqlNull as ToSql>::accepts(&Type::TIMESTAMPTZ));
        let mut buf = bytes::BytesMut::new();
        assert!(matches!(
            SqlNull.to_sql(&Type::INT4, &mut buf).unwrap(),
            IsNull::Yes
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_strip_origin() {
        assert_eq!(strip_origin("tandem_mysql-a"), Some("mysql-a"));
        assert_eq!(strip_origin("someone_else"), None);
    }

    #[test]
    fn test_coerce_value_for_target_columns() {
        let int_col = ColumnDef {
            name: "n".into(),
            data_type: "integer".into(),
            nullable: true,
            default: None,
        };
        assert_eq!(coerce_value(Value::Int64(7), &int_col), Value::Int32(7));
        // Out of range stays as-is and lets the driver report it
        assert_eq!(
            coerce_value(Value::Int64(i64::MAX), &int_col),
            Value::Int64(i64::MAX)
        );

        let bool_col = ColumnDef {
            name: "b".into(),
            data_type: "boolean".into(),
            nullable: true,
            default: None,
        };
        assert_eq!(coerce_value(Value::Int64(1), &bool_col), Value::Bool(true));

        let tz_col = ColumnDef {
            name: "ts".into(),
            data_type: "timestamp with time zone".into(),
            nullable: true,
            default: None,
        };
        let naive = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(matches!(
            coerce_value(Value::DateTime(naive), &tz_col),
            Value::DateTimeTz(_)
        ));
    }
}
