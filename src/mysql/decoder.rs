//! MySQL binlog decoder
//!
//! Registers against the server as a replication client and turns the raw
//! binlog into [`Event`]s on the relay queue. The decoder is the single
//! writer of transaction identity, table metadata, and the resumption
//! offset; the coalescer downstream never touches any of them.
//!
//! Each record passes through three phases: statement/identity handling
//! (adopt or synthesize a transaction id, classify statements), stream
//! structure handling (table maps, row images, log rotation), and boundary
//! handling (emit the commit or rollback signal, checkpoint, clear the
//! identity).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mysql_async::binlog::events::{Event as BinlogEvent, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use offset_store::{Offset, OffsetStore, SourceKind};

use crate::config::{Config, DatabaseConfig};
use crate::event::{BoundaryKind, Event, Operation, RowChange, RowData};
use crate::mysql::metadata::{MetadataCache, MySqlIntrospector, TableMeta};
use crate::mysql::value::binlog_value_to_json;

/// Backoff between retries after a stream read failure.
const STREAM_RETRY: Duration = Duration::from_millis(300);

/// Whether the loop keeps consuming records after handling one.
enum Flow {
    Continue,
    Stop,
}

/// Replication client driving the decode side of the relay.
pub struct BinlogDecoder {
    database: DatabaseConfig,
    store: Box<dyn OffsetStore>,
    metadata: MetadataCache,
    start_from: Option<Offset>,
    current_file: String,
    current_pos: u32,
    current_tx: String,
}

impl BinlogDecoder {
    pub fn new(
        config: &Config,
        store: Box<dyn OffsetStore>,
        start_from: Option<Offset>,
    ) -> Result<Self> {
        if !config.database.kind.is_binlog_based() {
            bail!(
                "database kind {} is not binlog based",
                config.database.kind
            );
        }
        if let Some(from) = &start_from {
            if from.kind() != SourceKind::MysqlBinlog {
                bail!("explicit resume offset {from} does not name a binlog position");
            }
        }

        Ok(Self {
            database: config.database.clone(),
            store,
            metadata: MetadataCache::from_tables(&config.database.dbname, &config.tables),
            start_from,
            current_file: String::new(),
            current_pos: 0,
            current_tx: String::new(),
        })
    }

    /// Tail the binlog until shutdown fires, producing events onto `tx`.
    ///
    /// The sender is dropped on return, which closes the queue and lets the
    /// coalescer drain out.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
        tx: mpsc::Sender<Event>,
    ) -> Result<()> {
        let pool = mysql_async::Pool::from_url(&self.database.url())?;
        let introspector = MySqlIntrospector::new(pool.clone());

        let resume = self.resume_position(&pool).await?;
        let (file, pos) = match resume {
            Offset::Binlog { file, pos } => (file, pos),
            other => bail!("cannot tail the binlog from offset {other}"),
        };
        info!(
            "[binlog] connect {}@{}:{} from {file}:{pos}",
            self.database.user, self.database.host, self.database.port
        );
        self.current_file = file;
        self.current_pos = pos;

        let mut stream = self.open_stream().await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("decoder received shutdown signal");
                    break;
                }
                record = stream.next() => match record {
                    Some(Ok(event)) => {
                        if let Flow::Stop =
                            self.handle_event(&stream, event, &introspector, &mut shutdown, &tx).await?
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(
                            "[binlog] stream error: {e:#}, retrying in {}ms",
                            STREAM_RETRY.as_millis()
                        );
                        tokio::time::sleep(STREAM_RETRY).await;
                    }
                    None => {
                        warn!(
                            "[binlog] stream ended, reconnecting from {}:{}",
                            self.current_file, self.current_pos
                        );
                        tokio::time::sleep(STREAM_RETRY).await;
                        match self.open_stream().await {
                            Ok(next) => stream = next,
                            Err(e) => warn!("[binlog] reconnect failed: {e:#}"),
                        }
                    }
                }
            }
        }

        if let Err(e) = pool.disconnect().await {
            warn!("error closing mysql pool: {e:#}");
        }
        info!(
            "binlog decoder stopped at {}:{}",
            self.current_file, self.current_pos
        );
        Ok(())
    }

    /// Explicit override first, then the offset file, then the server's
    /// current log position.
    async fn resume_position(&self, pool: &mysql_async::Pool) -> Result<Offset> {
        if let Some(from) = &self.start_from {
            info!("resuming from explicit offset {from}");
            return Ok(from.clone());
        }
        if let Some(saved) = self.store.load().await? {
            info!("resuming from saved offset {saved}");
            return Ok(saved);
        }
        let mut conn = pool.get_conn().await?;
        let offset = server_log_position(&mut conn).await?;
        info!("no saved offset, starting from server position {offset}");
        Ok(offset)
    }

    async fn open_stream(&self) -> Result<BinlogStream> {
        let conn = Conn::new(Opts::from_url(&self.database.url())?)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to {}:{} for replication",
                    self.database.host, self.database.port
                )
            })?;
        let stream = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.database.server_id)
                    .with_filename(self.current_file.as_bytes())
                    .with_pos(u64::from(self.current_pos)),
            )
            .await
            .context("failed to register as a replication client")?;
        Ok(stream)
    }

    async fn handle_event(
        &mut self,
        stream: &BinlogStream,
        raw: BinlogEvent,
        introspector: &MySqlIntrospector,
        shutdown: &mut broadcast::Receiver<()>,
        tx: &mpsc::Sender<Event>,
    ) -> Result<Flow> {
        let header = raw.header();
        let log_pos = header.log_pos();
        // Artificial records (the synthetic rotate at stream start) carry
        // position zero and must not move the cursor.
        if log_pos != 0 {
            self.current_pos = log_pos;
        }
        let timestamp = event_time(header.timestamp());

        let data = match raw.read_data() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                warn!(
                    "undecodable binlog record at {}:{log_pos}: {e}",
                    self.current_file
                );
                return Ok(Flow::Continue);
            }
        };

        // Phase 1: transaction identity and statement records.
        let mut marker = None;
        let mut commits = false;
        let mut rolls_back = false;
        match &data {
            EventData::XidEvent(e) => {
                marker = Some(format!("xid:{}", e.xid));
                commits = true;
            }
            EventData::GtidEvent(e) => {
                marker = Some(format!("gtid:{}:{}", format_sid(e.sid()), e.gno()));
                commits = true;
            }
            EventData::QueryEvent(e) => {
                let schema = e.schema();
                if is_system_schema(&schema) {
                    return Ok(Flow::Continue);
                }
                let query = e.query();
                match query.as_ref() {
                    "BEGIN" => return Ok(Flow::Continue),
                    "COMMIT" => commits = true,
                    "ROLLBACK" => rolls_back = true,
                    q => {
                        if q.contains("CREATE TABLE") || q.contains("ALTER TABLE") {
                            info!("[schema] ddl detected: {q}, refreshing table metadata");
                            self.metadata.refresh_all(introspector).await;
                        }
                        if is_dml(q) {
                            if self.current_tx.is_empty() {
                                self.current_tx = format!("query:{log_pos}");
                            }
                        } else {
                            let offset = self.offset_at(log_pos);
                            let ddl = Event::ddl(
                                SourceKind::MysqlBinlog,
                                offset.clone(),
                                timestamp,
                                self.current_tx.clone(),
                                q,
                            );
                            if let Flow::Stop = self.forward(tx, shutdown, ddl).await? {
                                return Ok(Flow::Stop);
                            }
                            self.save_offset(&offset).await;
                        }
                        // Any surviving statement record commits whatever
                        // identity is active once phase 3 runs.
                        commits = true;
                    }
                }
            }
            _ => {}
        }

        if let Some(marker) = marker {
            if self.current_tx.is_empty() {
                self.current_tx = marker;
            }
        }

        // Phase 2: stream structure.
        match data {
            EventData::TableMapEvent(tme) => {
                let schema = tme.database_name().to_string();
                let table = tme.table_name().to_string();
                if !is_system_schema(&schema) {
                    // With the server-default minimal row metadata the
                    // table map carries no column names; the catalog
                    // answers instead.
                    self.metadata
                        .observe_table_map(&schema, &table, None, introspector)
                        .await;
                }
            }
            EventData::RowsEvent(rows) => {
                if let Some(change) = self.decode_rows(stream, &rows, log_pos, timestamp) {
                    if let Flow::Stop = self.forward(tx, shutdown, change).await? {
                        return Ok(Flow::Stop);
                    }
                }
            }
            EventData::RotateEvent(e) => {
                self.current_file = e.name().to_string();
                self.current_pos = e.position() as u32;
                debug!(
                    "[binlog] rotated to {}:{}",
                    self.current_file, self.current_pos
                );
            }
            EventData::XidEvent(_) | EventData::GtidEvent(_) | EventData::QueryEvent(_) => {}
            other => debug!("unhandled binlog record: {other:?}"),
        }

        // Phase 3: boundaries.
        if rolls_back {
            if !self.current_tx.is_empty() {
                let boundary = Event::boundary(
                    SourceKind::MysqlBinlog,
                    self.offset_at(log_pos),
                    timestamp,
                    self.current_tx.clone(),
                    BoundaryKind::Rollback,
                );
                if let Flow::Stop = self.forward(tx, shutdown, boundary).await? {
                    return Ok(Flow::Stop);
                }
                // A rolled-back transaction moves no data, so the
                // checkpoint stays where it was.
                self.current_tx.clear();
            }
        } else if commits && !self.current_tx.is_empty() {
            let offset = self.offset_at(log_pos);
            let boundary = Event::boundary(
                SourceKind::MysqlBinlog,
                offset.clone(),
                timestamp,
                self.current_tx.clone(),
                BoundaryKind::Commit,
            );
            if let Flow::Stop = self.forward(tx, shutdown, boundary).await? {
                return Ok(Flow::Stop);
            }
            self.save_offset(&offset).await;
            self.current_tx.clear();
        }

        Ok(Flow::Continue)
    }

    /// Decode one rows record into a [`Event::RowChange`], or nothing when
    /// the record is filtered or malformed.
    fn decode_rows(
        &mut self,
        stream: &BinlogStream,
        rows: &RowsEventData<'_>,
        log_pos: u32,
        timestamp: DateTime<Utc>,
    ) -> Option<Event> {
        let tme = match stream.get_tme(rows.table_id()) {
            Some(tme) => tme,
            None => {
                warn!(
                    "no table map for table id {}, dropping row record",
                    rows.table_id()
                );
                return None;
            }
        };
        let schema = tme.database_name().to_string();
        let table = tme.table_name().to_string();
        if is_system_schema(&schema) {
            return None;
        }

        if self.current_tx.is_empty() {
            self.current_tx = format!("tx:{log_pos}");
        }

        let op = match rows {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                Operation::Insert
            }
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                Operation::Update
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                Operation::Delete
            }
            _ => return None,
        };

        let decode = |mut row: BinlogRow| {
            (0..row.len())
                .map(|i| {
                    row.take(i)
                        .map(binlog_value_to_json)
                        .unwrap_or(Value::Null)
                })
                .collect::<Vec<_>>()
        };
        let mut pairs = Vec::new();
        for item in rows.rows(tme) {
            match item {
                Ok((before, after)) => {
                    pairs.push((before.map(&decode), after.map(&decode)));
                }
                Err(e) => {
                    warn!("failed to decode row images for {schema}.{table}: {e}");
                    return None;
                }
            }
        }

        let placeholder;
        let meta = match self.metadata.get(&schema, &table) {
            Some(meta) => meta,
            None => {
                warn!("table metadata missing for {schema}.{table}, using positional columns");
                placeholder = TableMeta::placeholder();
                &placeholder
            }
        };

        let rows_data = match assemble_rows(op, meta, pairs) {
            Some(rows_data) => rows_data,
            None => {
                warn!(
                    "malformed {op} row images for {schema}.{table} at {}:{log_pos}, dropping record",
                    self.current_file
                );
                return None;
            }
        };
        if rows_data.is_empty() {
            return None;
        }

        Some(Event::row_change(
            SourceKind::MysqlBinlog,
            self.offset_at(log_pos),
            timestamp,
            self.current_tx.clone(),
            vec![RowChange {
                schema,
                table,
                op,
                rows: rows_data,
            }],
        ))
    }

    /// Queue send racing the shutdown signal, so a full queue never blinds
    /// the decoder to cancellation.
    async fn forward(
        &self,
        tx: &mpsc::Sender<Event>,
        shutdown: &mut broadcast::Receiver<()>,
        event: Event,
    ) -> Result<Flow> {
        tokio::select! {
            sent = tx.send(event) => match sent {
                Ok(()) => Ok(Flow::Continue),
                Err(_) => bail!("event queue closed"),
            },
            _ = shutdown.recv() => {
                info!("decoder received shutdown signal while enqueueing");
                Ok(Flow::Stop)
            }
        }
    }

    async fn save_offset(&self, offset: &Offset) {
        if let Err(e) = self.store.save(offset).await {
            warn!("[binlog] failed to save offset {offset}: {e:#}");
        }
    }

    fn offset_at(&self, pos: u32) -> Offset {
        Offset::binlog(self.current_file.clone(), pos)
    }
}

/// Current write position of the server, for cold starts without a saved
/// offset. `SHOW MASTER STATUS` was removed in MySQL 8.4 in favor of
/// `SHOW BINARY LOG STATUS`.
async fn server_log_position(conn: &mut Conn) -> Result<Offset> {
    let status = match conn
        .query_first::<mysql_async::Row, _>("SHOW MASTER STATUS")
        .await
    {
        Ok(row) => row,
        Err(_) => conn.query_first("SHOW BINARY LOG STATUS").await?,
    };
    let row = status.context("binary logging appears to be disabled, no log status row")?;
    let file: String = row
        .get(0)
        .context("log status row is missing the file column")?;
    let pos: u64 = row
        .get(1)
        .context("log status row is missing the position column")?;
    Ok(Offset::binlog(file, pos as u32))
}

fn event_time(header_timestamp: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(header_timestamp), 0).unwrap_or_default()
}

fn is_dml(query: &str) -> bool {
    query.starts_with("INSERT") || query.starts_with("UPDATE") || query.starts_with("DELETE")
}

fn is_system_schema(schema: &str) -> bool {
    matches!(
        schema,
        "mysql" | "performance_schema" | "information_schema" | "sys"
    )
}

/// Server UUID bytes in canonical hex form, as GTID sets print them.
fn format_sid(sid: [u8; 16]) -> String {
    let hex = |range: &[u8]| {
        range
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(&sid[..4]),
        hex(&sid[4..6]),
        hex(&sid[6..8]),
        hex(&sid[8..10]),
        hex(&sid[10..])
    )
}

/// One decoded row: before and after images as plain JSON values, either
/// side absent when the record did not carry it.
type RowImagePair = (Option<Vec<Value>>, Option<Vec<Value>>);

/// Build the per-row data for one record. `None` means the record is
/// malformed (a row is missing the image its operation requires, which for
/// UPDATE is the odd-image-count case) and must be dropped whole.
fn assemble_rows(op: Operation, meta: &TableMeta, pairs: Vec<RowImagePair>) -> Option<Vec<RowData>> {
    let mut rows = Vec::with_capacity(pairs.len());
    for (before, after) in pairs {
        let row = match op {
            Operation::Insert => {
                let after = after?;
                RowData {
                    pk: extract_pk(meta, &after),
                    before: None,
                    after: Some(row_image(&meta.columns, &after)),
                }
            }
            Operation::Delete => {
                let before = before?;
                RowData {
                    pk: extract_pk(meta, &before),
                    before: Some(row_image(&meta.columns, &before)),
                    after: None,
                }
            }
            Operation::Update => {
                let (before, after) = (before?, after?);
                RowData {
                    pk: extract_pk(meta, &before),
                    before: Some(row_image(&meta.columns, &before)),
                    after: Some(row_image(&meta.columns, &after)),
                }
            }
        };
        rows.push(row);
    }
    Some(rows)
}

/// Single-entry primary-key projection: the resolved index, else index 0,
/// else empty for an empty row. The key is the configured name when known,
/// else the positional column name.
fn extract_pk(meta: &TableMeta, values: &[Value]) -> Map<String, Value> {
    let index = if meta.pk_index >= 0 && (meta.pk_index as usize) < values.len() {
        meta.pk_index as usize
    } else if !values.is_empty() {
        0
    } else {
        return Map::new();
    };

    let name = if meta.pk_name.is_empty() {
        column_name(&meta.columns, index)
    } else {
        meta.pk_name.clone()
    };

    let mut pk = Map::new();
    pk.insert(name, values[index].clone());
    pk
}

/// Row values keyed by column name, in column order. Unknown names degrade
/// to positional `col_N`; values past the known columns are dropped and
/// known columns past the row are null.
fn row_image(columns: &[String], values: &[Value]) -> Map<String, Value> {
    if columns.is_empty() {
        return values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("col_{i}"), v.clone()))
            .collect();
    }

    columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let name = if name.is_empty() {
                format!("col_{i}")
            } else {
                name.clone()
            };
            (name, values.get(i).cloned().unwrap_or(Value::Null))
        })
        .collect()
}

fn column_name(columns: &[String], index: usize) -> String {
    match columns.get(index) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("col_{index}"),
    }
}
