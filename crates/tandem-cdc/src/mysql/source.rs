//! MySQL connector implementation
//!
//! The query session is a small `mysql_async` pool whose sessions all run
//! `SET SESSION sql_log_bin = 0` at setup time. That statement is the
//! loop-guard marker on this engine: rows the relay applies never enter the
//! binlog, so the peer-bound tailer cannot re-capture them.
//!
//! Binlog row events carry no column names; they are joined in from the
//! schema cache, which `setup_cdc` seeds for every replicated table.

use crate::common::{
    ApplyOutcome, ChangeEvent, ColumnDef, Connector, EndpointConfig, Error, Op, Position,
    PositionFlavor, Result, Row, SchemaCache, SqlDialect, StatementCache, TableSchema, Value,
};
use crate::common::error::{
    mysql_error_is_drift, mysql_error_is_transient, mysql_error_is_unique_violation,
};
use crate::common::schema::require_pk;
use crate::mysql::decoder::{BinlogDecoder, BinlogEvent, RowChange, RowsKind, TableMapEvent};
use crate::mysql::protocol::MySqlBinlogClient;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use mysql_async::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// MySQL CDC connector.
pub struct MySqlConnector {
    endpoint: EndpointConfig,
    peer_id: String,
    buffer_size: usize,
    schema_cache: Arc<SchemaCache>,
    statements: StatementCache,
    pool: Mutex<Option<mysql_async::Pool>>,
    /// Tables registered by `setup_cdc`; the binlog reader drops everything
    /// else (the binlog carries the whole server, unlike a publication)
    tables: Mutex<Vec<String>>,
    /// Internal resume pointer advanced by `confirm_position`
    resume: Mutex<Option<Position>>,
    running: Arc<AtomicBool>,
    streaming_started: bool,
}

impl MySqlConnector {
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
            statements: StatementCache::new(SqlDialect::MySql),
            pool: Mutex::new(None),
            tables: Mutex::new(Vec::new()),
            resume: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            streaming_started: false,
        }
    }

    fn server_id(&self) -> u32 {
        self.endpoint.server_id.unwrap_or(0)
    }

    async fn pool(&self) -> Result<mysql_async::Pool> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::other("mysql connector is not connected"))
    }

    async fn cached_schema(&self, schema: &str, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(entry) = self.schema_cache.get(&self.endpoint.id, schema, table).await {
            return Ok(entry);
        }
        let pool = self.pool().await?;
        let fresh = fetch_table_schema(&pool, &self.endpoint.database, table).await?;
        Ok(self.schema_cache.insert(&self.endpoint.id, fresh).await)
    }

    fn classify_apply_error(&self, schema: &str, table: &str, e: mysql_async::Error) -> ApplyOutcome {
        if mysql_error_is_drift(&e) {
            self.statements.invalidate_table(schema, table);
            ApplyOutcome::SchemaDrift(Error::drift(e.to_string()))
        } else if mysql_error_is_transient(&e) {
            ApplyOutcome::Transient(Error::MySql(e))
        } else {
            ApplyOutcome::Permanent(Error::MySql(e))
        }
    }

    async fn apply_insert(
        &self,
        conn: &mut mysql_async::Conn,
        event: &ChangeEvent,
    ) -> std::result::Result<(), mysql_async::Error> {
        let after = event.after.as_ref().expect("validated insert has after");
        let columns = after.columns().to_vec();
        let sql = self
            .statements
            .insert_stmt(&event.schema, &event.table, &columns);
        let params: Vec<mysql_async::Value> = after.values().iter().map(value_to_mysql).collect();

        match conn.exec_drop(sql.as_str(), params).await {
            Ok(()) => Ok(()),
            Err(e) if mysql_error_is_unique_violation(&e) => {
                debug!(
                    table = %event.qualified_table(),
                    "duplicate key on insert, falling back to update"
                );
                let pk = event
                    .new_primary_key()
                    .unwrap_or_else(|| event.primary_key.clone());
                self.update_by_pk(conn, event, after, &pk).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update_by_pk(
        &self,
        conn: &mut mysql_async::Conn,
        event: &ChangeEvent,
        after: &Row,
        pk: &Row,
    ) -> std::result::Result<(), mysql_async::Error> {
        let set_columns: Vec<String> = after
            .columns()
            .iter()
            .filter(|c| !pk.columns().iter().any(|p| p.eq_ignore_ascii_case(c)))
            .cloned()
            .collect();
        if set_columns.is_empty() {
            return Ok(());
        }
        let sql = self.statements.update_stmt(
            &event.schema,
            &event.table,
            &set_columns,
            &pk.columns().to_vec(),
        );

        let mut params: Vec<mysql_async::Value> = set_columns
            .iter()
            .map(|c| value_to_mysql(after.get(c).unwrap_or(&Value::Null)))
            .collect();
        params.extend(pk.values().iter().map(value_to_mysql));

        conn.exec_drop(sql.as_str(), params).await?;
        if conn.affected_rows() == 0 {
            debug!(
                table = %event.qualified_table(),
                "update matched no row, treating as already converged"
            );
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        conn: &mut mysql_async::Conn,
        event: &ChangeEvent,
    ) -> std::result::Result<(), mysql_async::Error> {
        let after = event.after.as_ref().expect("validated update has after");

        if event.is_pk_change() {
            let pk_columns = event.primary_key.columns().to_vec();
            let delete = self
                .statements
                .delete_stmt(&event.schema, &event.table, &pk_columns);
            let insert = self.statements.insert_stmt(
                &event.schema,
                &event.table,
                &after.columns().to_vec(),
            );
            let delete_params: Vec<mysql_async::Value> =
                event.primary_key.values().iter().map(value_to_mysql).collect();
            let insert_params: Vec<mysql_async::Value> =
                after.values().iter().map(value_to_mysql).collect();

            let mut tx = conn
                .start_transaction(mysql_async::TxOpts::default())
                .await?;
            tx.exec_drop(delete.as_str(), delete_params).await?;
            tx.exec_drop(insert.as_str(), insert_params).await?;
            tx.commit().await?;
            return Ok(());
        }

        self.update_by_pk(conn, event, after, &event.primary_key).await
    }

    async fn apply_delete(
        &self,
        conn: &mut mysql_async::Conn,
        event: &ChangeEvent,
    ) -> std::result::Result<(), mysql_async::Error> {
        let pk_columns = event.primary_key.columns().to_vec();
        let sql = self
            .statements
            .delete_stmt(&event.schema, &event.table, &pk_columns);
        let params: Vec<mysql_async::Value> =
            event.primary_key.values().iter().map(value_to_mysql).collect();
        conn.exec_drop(sql.as_str(), params).await?;
        if conn.affected_rows() == 0 {
            debug!(
                table = %event.qualified_table(),
                "delete matched no row, already gone"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    fn position_flavor(&self) -> PositionFlavor {
        PositionFlavor::MysqlBinlog
    }

    async fn connect(&mut self) -> Result<()> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.endpoint.host.clone())
            .tcp_port(self.endpoint.port)
            .user(Some(self.endpoint.user.clone()))
            .pass(Some(self.endpoint.password.clone()))
            .db_name(Some(self.endpoint.database.clone()))
            // Loop-guard marker: relay sessions never write to the binlog.
            .setup(vec!["SET SESSION sql_log_bin = 0".to_string()])
            .pool_opts(
                mysql_async::PoolOpts::default().with_constraints(
                    mysql_async::PoolConstraints::new(1, 2).expect("valid pool bounds"),
                ),
            );
        let pool = mysql_async::Pool::new(opts);

        // Force a handshake now so connection errors classify here, not on
        // first use.
        let mut conn = pool.get_conn().await.map_err(classify_connect_error)?;
        conn.query_drop("SELECT 1").await?;
        drop(conn);

        info!(
            endpoint = %self.endpoint.id,
            peer = %self.peer_id,
            "mysql query session ready, binlog suppressed for relay writes"
        );
        *self.pool.lock().await = Some(pool);
        Ok(())
    }

    async fn setup_cdc(&mut self, tables: &[String]) -> Result<()> {
        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await?;

        let log_bin: Option<(String, String)> = conn
            .query_first("SHOW VARIABLES LIKE 'log_bin'")
            .await?;
        match log_bin {
            Some((_, value)) if value.eq_ignore_ascii_case("ON") => {}
            other => {
                return Err(Error::precondition(format!(
                    "binary logging is disabled (log_bin={:?}); enable log_bin before replicating",
                    other.map(|(_, v)| v)
                )))
            }
        }

        let format: Option<(String, String)> = conn
            .query_first("SHOW VARIABLES LIKE 'binlog_format'")
            .await?;
        match format {
            Some((_, value)) if value.eq_ignore_ascii_case("ROW") => {}
            other => {
                return Err(Error::precondition(format!(
                    "binlog_format must be ROW, found {:?}",
                    other.map(|(_, v)| v)
                )))
            }
        }

        let row_image: Option<(String, String)> = conn
            .query_first("SHOW VARIABLES LIKE 'binlog_row_image'")
            .await?;
        if let Some((_, value)) = row_image {
            if !value.eq_ignore_ascii_case("FULL") {
                warn!(
                    binlog_row_image = %value,
                    "binlog_row_image is not FULL; update/delete before-images will be partial"
                );
            }
        }

        drop(conn);
        for table in tables {
            let schema = fetch_table_schema(&pool, &self.endpoint.database, table).await?;
            require_pk(&schema)?;
            self.schema_cache.insert(&self.endpoint.id, schema).await;
        }
        *self.tables.lock().await = tables.to_vec();
        Ok(())
    }

    async fn start_streaming(
        &mut self,
        from: Option<Position>,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        if self.streaming_started {
            return Err(Error::other(
                "mysql connector instance already streamed once",
            ));
        }
        self.streaming_started = true;
        self.running.store(true, Ordering::SeqCst);

        let (file, offset) = match &from {
            Some(pos) => pos.parse_binlog().ok_or_else(|| {
                Error::decode(format!("cannot parse resume position '{}'", pos.value))
            })?,
            None => {
                let current = self.get_current_position().await?;
                current.parse_binlog().ok_or_else(|| {
                    Error::decode(format!("unusable head position '{}'", current.value))
                })?
            }
        };

        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        let reader = BinlogReader {
            endpoint: self.endpoint.clone(),
            server_id: self.server_id(),
            start_file: file,
            start_offset: offset as u32,
            tables: self.tables.lock().await.clone(),
            schema_cache: Arc::clone(&self.schema_cache),
            pool: self.pool().await?,
            running: Arc::clone(&self.running),
        };

        tokio::spawn(async move {
            match reader.run(tx).await {
                Ok(()) => info!("mysql binlog stream finished"),
                Err(e) => error!(error = %e, "mysql binlog stream failed"),
            }
        });

        Ok(rx)
    }

    async fn get_table_schema(&self, table: &str) -> Result<TableSchema> {
        let pool = self.pool().await?;
        fetch_table_schema(&pool, &self.endpoint.database, table).await
    }

    async fn apply_change(&self, event: &ChangeEvent) -> ApplyOutcome {
        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(e) => return ApplyOutcome::Transient(e),
        };
        let mut conn = match pool.get_conn().await {
            Ok(conn) => conn,
            Err(e) => return ApplyOutcome::Transient(Error::MySql(e)),
        };

        let result = match event.op {
            Op::Insert | Op::Snapshot => self.apply_insert(&mut conn, event).await,
            Op::Update => self.apply_update(&mut conn, event).await,
            Op::Delete => self.apply_delete(&mut conn, event).await,
        };

        match result {
            Ok(()) => ApplyOutcome::Applied,
            Err(e) => self.classify_apply_error(&event.schema, &event.table, e),
        }
    }

    async fn get_current_position(&self) -> Result<Position> {
        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await?;
        let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
        let row = row.ok_or_else(|| {
            Error::precondition(
                "SHOW MASTER STATUS returned nothing; binary logging appears disabled",
            )
        })?;
        let file: String = row
            .get("File")
            .ok_or_else(|| Error::decode("SHOW MASTER STATUS row missing File"))?;
        let position: u64 = row
            .get("Position")
            .ok_or_else(|| Error::decode("SHOW MASTER STATUS row missing Position"))?;
        Ok(Position::mysql_binlog(&file, position))
    }

    async fn confirm_position(&mut self, pos: &Position) -> Result<()> {
        // The binlog has no server-side acknowledgement; the resume pointer
        // is what a restart hands back to COM_BINLOG_DUMP.
        *self.resume.lock().await = Some(pos.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pool) = self.pool.lock().await.take() {
            if let Err(e) = pool.disconnect().await {
                debug!(error = %e, "mysql pool disconnect");
            }
        }
        match self.resume.lock().await.as_ref() {
            Some(pos) => info!(
                endpoint = %self.endpoint.id,
                resume = %pos,
                "mysql connector closed"
            ),
            None => info!(endpoint = %self.endpoint.id, "mysql connector closed"),
        }
        Ok(())
    }
}

/// State carried into the spawned binlog reader task.
struct BinlogReader {
    endpoint: EndpointConfig,
    server_id: u32,
    start_file: String,
    start_offset: u32,
    tables: Vec<String>,
    schema_cache: Arc<SchemaCache>,
    pool: mysql_async::Pool,
    running: Arc<AtomicBool>,
}

impl BinlogReader {
    async fn run(self, tx: mpsc::Sender<ChangeEvent>) -> anyhow::Result<()> {
        let mut client = MySqlBinlogClient::connect(
            &self.endpoint.host,
            self.endpoint.port,
            &self.endpoint.user,
            Some(&self.endpoint.password),
            Some(&self.endpoint.database),
        )
        .await?;

        // Checksum negotiation; older servers reject the newer variable.
        if let Err(e) = client
            .query("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            debug!(error = %e, "falling back to legacy checksum variable");
            if let Err(e) = client
                .query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await
            {
                debug!(error = %e, "binlog checksum negotiation failed");
            }
        }

        client.register_slave(self.server_id).await?;
        let mut stream = client
            .binlog_dump(self.server_id, &self.start_file, self.start_offset)
            .await?;

        let mut decoder = BinlogDecoder::new();
        let mut current_file = self.start_file.clone();
        let mut txn: Vec<PendingEvent> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            let data = match stream.next_event().await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    info!("binlog stream ended");
                    break;
                }
                Err(e) => return Err(e),
            };

            let (header, event) = match decoder.decode(&data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable binlog event");
                    continue;
                }
            };
            let event_time = Utc
                .timestamp_opt(i64::from(header.timestamp), 0)
                .single()
                .unwrap_or_else(Utc::now);

            match event {
                BinlogEvent::Rotate { file, .. } => {
                    debug!(file = %file, "binlog rotated");
                    current_file = file;
                }
                BinlogEvent::Rows(rows) => {
                    let Some(map) = decoder.table(rows.table_id).cloned() else {
                        warn!(table_id = rows.table_id, "rows event without table map");
                        continue;
                    };
                    if map.schema_name != self.endpoint.database
                        || !self.tables.iter().any(|t| t == &map.table_name)
                    {
                        continue;
                    }
                    let schema = match self.table_schema(&map).await {
                        Ok(schema) => schema,
                        Err(e) => {
                            warn!(
                                table = %map.table_name,
                                error = %e,
                                "no schema for table, skipping rows"
                            );
                            continue;
                        }
                    };
                    for row in &rows.rows {
                        if let Some(pending) =
                            build_pending(rows.kind, row, &map, &schema, event_time)
                        {
                            txn.push(pending);
                        }
                    }
                }
                BinlogEvent::Commit { .. } => {
                    // Events inherit the commit's end position, mirroring
                    // commit-aligned checkpoints on the other engine.
                    let position = Position::mysql_binlog(
                        &current_file,
                        u64::from(header.next_position),
                    );
                    for pending in txn.drain(..) {
                        let event = pending.into_event(&position, &self.endpoint.id);
                        if tx.send(event).await.is_err() {
                            info!("event receiver dropped, stopping binlog stream");
                            return Ok(());
                        }
                    }
                }
                BinlogEvent::Query { query, .. } => {
                    let statement = query.trim().to_ascii_uppercase();
                    if statement == "BEGIN" {
                        txn.clear();
                    } else if statement.starts_with("COMMIT") {
                        // MyISAM-style commits arrive as plain statements;
                        // handled like an XID with the same position rules.
                        let position = Position::mysql_binlog(
                            &current_file,
                            u64::from(header.next_position),
                        );
                        for pending in txn.drain(..) {
                            let event = pending.into_event(&position, &self.endpoint.id);
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    } else {
                        // DDL: anything cached about this endpoint may now
                        // be stale.
                        debug!(query = %query, "DDL observed, flushing schema cache");
                        self.schema_cache.invalidate_endpoint(&self.endpoint.id).await;
                    }
                }
                BinlogEvent::Gtid { gtid } => {
                    debug!(gtid = %gtid, "transaction gtid");
                }
                BinlogEvent::Format { .. }
                | BinlogEvent::TableMap(_)
                | BinlogEvent::Heartbeat
                | BinlogEvent::Ignored => {}
            }
        }

        Ok(())
    }

    async fn table_schema(&self, map: &TableMapEvent) -> Result<Arc<TableSchema>> {
        if let Some(entry) = self
            .schema_cache
            .get(&self.endpoint.id, &map.schema_name, &map.table_name)
            .await
        {
            return Ok(entry);
        }
        let fresh =
            fetch_table_schema(&self.pool, &map.schema_name, &map.table_name).await?;
        Ok(self.schema_cache.insert(&self.endpoint.id, fresh).await)
    }
}

/// Event decoded mid-transaction, before the commit position is known.
struct PendingEvent {
    op: Op,
    schema: String,
    table: String,
    timestamp: DateTime<Utc>,
    before: Option<Row>,
    after: Option<Row>,
    primary_key: Row,
}

impl PendingEvent {
    fn into_event(self, position: &Position, source_id: &str) -> ChangeEvent {
        ChangeEvent {
            op: self.op,
            schema: self.schema,
            table: self.table,
            timestamp: self.timestamp,
            before: self.before,
            after: self.after,
            primary_key: self.primary_key,
            position: position.clone(),
            source_id: source_id.to_string(),
        }
    }
}

fn build_pending(
    kind: RowsKind,
    row: &RowChange,
    map: &TableMapEvent,
    schema: &TableSchema,
    timestamp: DateTime<Utc>,
) -> Option<PendingEvent> {
    let before = row.before.as_ref().map(|image| image_to_row(image, schema));
    let after = row.after.as_ref().map(|image| image_to_row(image, schema));

    let (op, key_source) = match kind {
        RowsKind::Write => (Op::Insert, after.as_ref()?),
        RowsKind::Update => (Op::Update, before.as_ref()?),
        RowsKind::Delete => (Op::Delete, before.as_ref()?),
    };
    let primary_key = key_source.project(&schema.primary_keys)?;

    Some(PendingEvent {
        op,
        schema: map.schema_name.clone(),
        table: map.table_name.clone(),
        timestamp,
        before,
        after,
        primary_key,
    })
}

/// Join positional binlog values with catalog column names.
fn image_to_row(image: &[(usize, Value)], schema: &TableSchema) -> Row {
    let mut row = Row::empty();
    for (ordinal, value) in image {
        match schema.columns.get(*ordinal) {
            Some(def) => row.push(def.name.clone(), value.clone()),
            None => warn!(
                ordinal,
                table = %schema.table,
                "row image column beyond cached schema, possible drift"
            ),
        }
    }
    row
}

async fn fetch_table_schema(
    pool: &mysql_async::Pool,
    database: &str,
    table: &str,
) -> Result<TableSchema> {
    let mut conn = pool.get_conn().await?;

    let column_rows: Vec<(String, String, String, Option<String>)> = conn
        .exec(
            "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await?;
    if column_rows.is_empty() {
        return Err(Error::precondition(format!(
            "table {table} does not exist in database {database}"
        )));
    }

    let columns = column_rows
        .into_iter()
        .map(|(name, data_type, nullable, default)| ColumnDef {
            name,
            data_type,
            nullable: nullable == "YES",
            default,
        })
        .collect();

    let primary_keys: Vec<String> = conn
        .exec(
            "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await?;

    let indexes: Vec<String> = conn
        .exec(
            "SELECT DISTINCT INDEX_NAME FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            (database, table),
        )
        .await?;

    Ok(TableSchema {
        schema: database.to_string(),
        table: table.to_string(),
        columns,
        primary_keys,
        indexes,
    })
}

fn value_to_mysql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => mysql_async::Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1000,
        ),
        Value::DateTimeTz(dt) => {
            let naive = dt.naive_utc();
            mysql_async::Value::Date(
                naive.year() as u16,
                naive.month() as u8,
                naive.day() as u8,
                naive.hour() as u8,
                naive.minute() as u8,
                naive.second() as u8,
                naive.nanosecond() / 1000,
            )
        }
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn classify_connect_error(e: mysql_async::Error) -> Error {
    match &e {
        mysql_async::Error::Server(s) if s.code == 1045 => Error::ConnAuth(s.message.clone()),
        mysql_async::Error::Driver(mysql_async::DriverError::UnknownAuthPlugin { .. }) => {
            Error::ConnProtocolUnsupported(e.to_string())
        }
        mysql_async::Error::Io(_) => Error::ConnUnreachable(e.to_string()),
        _ => Error::MySql(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::decoder::ColumnType;

    fn users_schema() -> TableSchema {
        TableSchema {
            schema: "app".into(),
            table: "users".into(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: "bigint".into(),
                    nullable: false,
                    default: None,
                },
                ColumnDef {
                    name: "name".into(),
                    data_type: "varchar".into(),
                    nullable: true,
                    default: None,
                },
            ],
            primary_keys: vec!["id".into()],
            indexes: vec![],
        }
    }

    fn users_map() -> TableMapEvent {
        TableMapEvent {
            table_id: 42,
            schema_name: "app".into(),
            table_name: "users".into(),
            column_count: 2,
            column_types: vec![ColumnType::LongLong, ColumnType::Varchar],
            column_meta: vec![0, 50],
        }
    }

    #[test]
    fn test_image_to_row_joins_names() {
        let image = vec![(0usize, Value::Int64(7)), (1usize, Value::from("Ada"))];
        let row = image_to_row(&image, &users_schema());
        assert_eq!(row.get("id"), Some(&Value::Int64(7)));
        assert_eq!(row.get("name"), Some(&Value::from("Ada")));
    }

    #[test]
    fn test_image_to_row_skips_unknown_ordinals() {
        let image = vec![(0usize, Value::Int64(7)), (9usize, Value::from("ghost"))];
        let row = image_to_row(&image, &users_schema());
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_build_pending_insert() {
        let row = RowChange {
            before: None,
            after: Some(vec![(0, Value::Int64(1)), (1, Value::from("Ada"))]),
        };
        let pending = build_pending(
            RowsKind::Write,
            &row,
            &users_map(),
            &users_schema(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(pending.op, Op::Insert);
        assert_eq!(pending.primary_key.get("id"), Some(&Value::Int64(1)));
        assert!(pending.before.is_none());
    }

    #[test]
    fn test_build_pending_update_keys_from_before() {
        let row = RowChange {
            before: Some(vec![(0, Value::Int64(1)), (1, Value::from("Ada"))]),
            after: Some(vec![(0, Value::Int64(2)), (1, Value::from("Ada"))]),
        };
        let pending = build_pending(
            RowsKind::Update,
            &row,
            &users_map(),
            &users_schema(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(pending.op, Op::Update);
        // The key is the OLD primary key so a key change deletes the right row
        assert_eq!(pending.primary_key.get("id"), Some(&Value::Int64(1)));
    }

    #[test]
    fn test_build_pending_delete_without_before_is_dropped() {
        let row = RowChange {
            before: None,
            after: None,
        };
        assert!(build_pending(
            RowsKind::Delete,
            &row,
            &users_map(),
            &users_schema(),
            Utc::now()
        )
        .is_none());
    }

    #[test]
    fn test_value_to_mysql_mapping() {
        assert_eq!(value_to_mysql(&Value::Null), mysql_async::Value::NULL);
        assert_eq!(
            value_to_mysql(&Value::Int64(7)),
            mysql_async::Value::from(7i64)
        );
        assert_eq!(
            value_to_mysql(&Value::from("x")),
            mysql_async::Value::from("x")
        );
        match value_to_mysql(&Value::Date(
            chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        )) {
            mysql_async::Value::Date(y, m, d, ..) => {
                assert_eq!((y, m, d), (2024, 3, 1));
            }
            other => panic!("expected Date, got {other:?}"),
        }
    }
}
