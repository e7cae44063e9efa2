//! MySQL binlog data source
//!
//! Tails the binary log over the replication protocol. The blocking read
//! loop runs on a dedicated reader thread with its own current-thread
//! runtime, decoding binlog events into framed records (transaction begin,
//! row change, commit) pushed through a bounded channel. Transaction
//! framing is applied on the consuming side, in [`MySqlEventStream`], so
//! the advertised position only ever names a transaction whose row events
//! have all been yielded to the caller.
//!
//! Requires the upstream to run with row-based logging, full row images
//! and GTIDs; `connect` refuses to start otherwise. Positions are GTIDs
//! rendered as `uuid:gno`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use mysql_async::binlog::EventType as BinlogEventType;
use mysql_async::binlog::events::Event as BinlogEvent;
use mysql_async::binlog::jsonb;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder, Value as SqlValue};
use mysql_common::packets::{GnoInterval, Sid};
use rand::Rng;

use crate::error::{CdcError, Result};
use crate::serializer;
use crate::types::{ChangeContent, ChangeEvent, EventType, Position, Row, Value};

use super::{DataSource, EventStream};

/// Replication settings the upstream must advertise before we register
const REQUIRED_SETTINGS: &[(&str, &str)] = &[
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
    ("binlog_row_metadata", "FULL"),
    ("gtid_mode", "ON"),
    ("enforce_gtid_consistency", "ON"),
];

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CONNECT_MAX_ATTEMPTS: u32 = 5;
/// How often the reader wakes from a quiet socket to check for shutdown
const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connection settings for the MySQL source
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    /// Replica identifier registered with the primary; replaced with a
    /// random one on collision
    pub server_id: u32,
}

impl MySqlConfig {
    /// Build from `DB_HOST`, `DB_USER`, `DB_PASSWORD`, `DB_PORT` and
    /// `DB_SERVER_ID`.
    pub fn from_env() -> Result<Self> {
        let host = crate::config::require_env("DB_HOST")?;
        let user = crate::config::require_env("DB_USER")?;
        let password = crate::config::require_env("DB_PASSWORD")?;

        let port_raw = crate::config::env_or("DB_PORT", "3306");
        let port = port_raw.parse::<u16>().map_err(|_| {
            CdcError::Configuration(format!("DB_PORT must be a port number, got '{}'", port_raw))
        })?;

        let id_raw = crate::config::env_or("DB_SERVER_ID", "1234");
        let server_id = id_raw
            .parse::<u32>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                CdcError::Configuration(format!(
                    "DB_SERVER_ID must be a positive integer, got '{}'",
                    id_raw
                ))
            })?;

        Ok(MySqlConfig {
            host,
            user,
            password,
            port,
            server_id,
        })
    }

    fn opts(&self) -> Opts {
        Opts::from(
            OptsBuilder::default()
                .ip_or_hostname(self.host.clone())
                .tcp_port(self.port)
                .user(Some(self.user.clone()))
                .pass(Some(self.password.clone())),
        )
    }
}

/// A record decoded from the binlog, before transaction framing
enum FramedRecord {
    /// A transaction started; its events will follow
    TxnBegin(Position),
    /// One row image within the in-flight transaction
    Row(RowRecord),
    /// The in-flight transaction committed
    Commit,
}

struct RowRecord {
    event_type: EventType,
    database: String,
    table: String,
    content: ChangeContent,
    timestamp: u32,
}

struct ReaderHandle {
    thread: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    /// Taken by the first `listen` call of the session
    events: Option<Receiver<std::result::Result<FramedRecord, String>>>,
    committed: Arc<Mutex<Position>>,
}

pub struct MySqlDataSource {
    config: MySqlConfig,
    start_position: Position,
    reader: Option<ReaderHandle>,
}

impl MySqlDataSource {
    pub fn new(config: MySqlConfig) -> Self {
        MySqlDataSource {
            config,
            start_position: Position::empty(),
            reader: None,
        }
    }
}

impl DataSource for MySqlDataSource {
    fn source_type(&self) -> &str {
        "mysql"
    }

    fn source_id(&self) -> &str {
        &self.config.host
    }

    fn set_start_position(&mut self, position: Position) {
        if self.reader.is_some() {
            log::warn!("Ignoring start position set after connect");
            return;
        }
        if !position.is_empty() {
            log::info!("Set starting GTID position to {}", position);
        }
        self.start_position = position;
    }

    fn connect(&mut self) -> Result<()> {
        if self.reader.is_some() {
            log::debug!("Already connected, reconnecting");
            self.disconnect();
        }

        log::info!(
            "Connecting to MySQL at {}:{}",
            self.config.host,
            self.config.port
        );

        let (events_tx, events_rx) = mpsc::sync_channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let config = self.config.clone();
        let start_position = self.start_position.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("binlog-reader".to_string())
            .spawn(move || reader_main(config, start_position, events_tx, ready_tx, thread_shutdown))
            .map_err(|e| CdcError::DataSource(format!("Failed to spawn binlog reader: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.reader = Some(ReaderHandle {
                    thread: Some(handle),
                    shutdown,
                    events: Some(events_rx),
                    committed: Arc::new(Mutex::new(Position::empty())),
                });
                log::info!("Connected to MySQL binlog stream");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CdcError::DataSource(
                    "Binlog reader terminated before becoming ready".to_string(),
                ))
            }
        }
    }

    fn listen(&mut self) -> Result<Box<dyn EventStream>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| CdcError::DataSource("Data source not connected".to_string()))?;
        let events = reader.events.take().ok_or_else(|| {
            CdcError::DataSource(
                "Event stream already consumed for this session; reconnect required".to_string(),
            )
        })?;
        Ok(Box::new(MySqlEventStream {
            events,
            in_flight: None,
            committed: Arc::clone(&reader.committed),
            ended: false,
        }))
    }

    fn current_position(&self) -> Position {
        match &self.reader {
            Some(reader) => match reader.committed.lock() {
                Ok(position) => position.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            None => Position::empty(),
        }
    }

    fn disconnect(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        log::info!("Disconnecting from MySQL");
        reader.shutdown.store(true, Ordering::Release);
        drop(reader.events.take());

        if let Some(handle) = reader.thread.take() {
            // The reader wakes at least every READ_POLL_INTERVAL; give it a
            // little longer before detaching.
            let deadline = Instant::now() + READ_POLL_INTERVAL * 3;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("Binlog reader thread panicked");
                }
            } else {
                log::debug!("Binlog reader still blocked, detaching; it will exit on its own");
            }
        }
    }
}

impl Drop for MySqlDataSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Consumer side of the reader channel; applies transaction framing
struct MySqlEventStream {
    events: Receiver<std::result::Result<FramedRecord, String>>,
    /// Token of the transaction currently being read
    in_flight: Option<Position>,
    /// Advanced only when a commit marker is drained
    committed: Arc<Mutex<Position>>,
    ended: bool,
}

impl EventStream for MySqlEventStream {
    fn next_event(&mut self, max_wait: Duration) -> Result<Option<ChangeEvent>> {
        if self.ended {
            return Err(CdcError::DataSource(
                "Replication stream has ended; reconnect required".to_string(),
            ));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(Ok(FramedRecord::TxnBegin(position))) => {
                    self.in_flight = Some(position);
                }
                Ok(Ok(FramedRecord::Row(row))) => match &self.in_flight {
                    Some(position) => {
                        return Ok(Some(ChangeEvent {
                            event_type: row.event_type,
                            database: row.database,
                            table: row.table,
                            content: row.content,
                            position: position.clone(),
                            timestamp: row.timestamp,
                        }))
                    }
                    None => {
                        log::warn!(
                            "Row event for {}.{} arrived before any transaction marker, skipping",
                            row.database,
                            row.table
                        );
                    }
                },
                Ok(Ok(FramedRecord::Commit)) => {
                    if let Some(position) = &self.in_flight {
                        log::debug!("Transaction {} committed", position);
                        match self.committed.lock() {
                            Ok(mut committed) => *committed = position.clone(),
                            Err(poisoned) => *poisoned.into_inner() = position.clone(),
                        }
                    }
                }
                Ok(Err(message)) => {
                    self.ended = true;
                    return Err(CdcError::DataSource(message));
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    self.ended = true;
                    return Err(CdcError::DataSource(
                        "Binlog reader terminated".to_string(),
                    ));
                }
            }
        }
    }
}

/// Where to begin the binlog dump
enum StartFrom {
    Head { file: String, pos: u64 },
    Gtid { sid: [u8; 16], gno: u64 },
}

/// Entry point of the reader thread
fn reader_main(
    config: MySqlConfig,
    start_position: Position,
    events_tx: SyncSender<std::result::Result<FramedRecord, String>>,
    ready_tx: SyncSender<Result<()>>,
    shutdown: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(CdcError::DataSource(format!(
                "Failed to build reader runtime: {}",
                e
            ))));
            return;
        }
    };

    runtime.block_on(async {
        let opts = config.opts();

        let mut ctl = match Conn::new(opts.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = ready_tx.send(Err(CdcError::DataSource(format!(
                    "Failed to connect to MySQL at {}:{}: {}",
                    config.host, config.port, e
                ))));
                return;
            }
        };

        if let Err(e) = validate_settings(&mut ctl).await {
            let _ = ready_tx.send(Err(e));
            return;
        }

        let start = match resolve_start(&mut ctl, &start_position).await {
            Ok(start) => start,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let mut binlog = match open_with_retry(&opts, config.server_id, &start).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        if ready_tx.send(Ok(())).is_err() {
            return;
        }

        let mut columns = ColumnNameCache::default();
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let event = match tokio::time::timeout(READ_POLL_INTERVAL, binlog.next()).await {
                Err(_) => continue, // quiet socket, re-check shutdown
                Ok(None) => {
                    let _ = events_tx.send(Err(
                        "Replication stream closed by the server".to_string()
                    ));
                    break;
                }
                Ok(Some(Err(e))) => {
                    let _ = events_tx.send(Err(format!(
                        "Error while listening to MySQL binlog: {}",
                        e
                    )));
                    break;
                }
                Ok(Some(Ok(event))) => event,
            };

            let records = match decode_event(&event, &binlog, &mut ctl, &mut columns).await {
                Ok(records) => records,
                Err(message) => {
                    let _ = events_tx.send(Err(message));
                    break;
                }
            };

            let mut receiver_gone = false;
            for record in records {
                if events_tx.send(Ok(record)).is_err() {
                    receiver_gone = true;
                    break;
                }
            }
            if receiver_gone {
                break;
            }
        }

        let _ = ctl.disconnect().await;
    });

    log::debug!("Binlog reader thread exiting");
}

async fn validate_settings(ctl: &mut Conn) -> Result<()> {
    let names = REQUIRED_SETTINGS
        .iter()
        .map(|(name, _)| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");
    let query = format!("SHOW GLOBAL VARIABLES WHERE Variable_name IN ({})", names);

    let rows: Vec<(String, String)> = ctl
        .query(query)
        .await
        .map_err(|e| CdcError::Configuration(format!("Failed to read MySQL settings: {}", e)))?;

    let actual: HashMap<String, String> = rows
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();
    verify_settings(&actual)
}

fn verify_settings(actual: &HashMap<String, String>) -> Result<()> {
    for (name, expected) in REQUIRED_SETTINGS {
        match actual.get(*name) {
            None => {
                return Err(CdcError::Configuration(format!(
                    "MySQL setting {} not found",
                    name
                )))
            }
            Some(value) if !value.eq_ignore_ascii_case(expected) => {
                return Err(CdcError::Configuration(format!(
                    "MySQL setting {} is incorrect: expected={}, actual={}",
                    name, expected, value
                )))
            }
            Some(value) => {
                log::info!("MySQL setting {} is correctly set to {}", name, value);
            }
        }
    }
    Ok(())
}

async fn resolve_start(ctl: &mut Conn, start_position: &Position) -> Result<StartFrom> {
    if start_position.is_empty() {
        log::info!("No stored position, connecting from the current log head");
        let row: Option<mysql_async::Row> = ctl
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| CdcError::DataSource(format!("SHOW MASTER STATUS failed: {}", e)))?;
        let row = row.ok_or_else(|| {
            CdcError::DataSource(
                "SHOW MASTER STATUS returned nothing; is binary logging enabled?".to_string(),
            )
        })?;
        let file: String = row.get(0).ok_or_else(|| {
            CdcError::DataSource("SHOW MASTER STATUS returned no log file name".to_string())
        })?;
        let pos: u64 = row.get(1).ok_or_else(|| {
            CdcError::DataSource("SHOW MASTER STATUS returned no log position".to_string())
        })?;
        Ok(StartFrom::Head { file, pos })
    } else {
        let (sid, gno) = parse_gtid_token(start_position.as_str())?;
        log::info!("Resuming from GTID: {}", start_position);
        Ok(StartFrom::Gtid { sid, gno })
    }
}

async fn open_binlog_stream(
    opts: &Opts,
    server_id: u32,
    start: &StartFrom,
) -> mysql_async::Result<BinlogStream> {
    let conn = Conn::new(opts.clone()).await?;
    match start {
        StartFrom::Head { file, pos } => {
            conn.get_binlog_stream(
                BinlogStreamRequest::new(server_id)
                    .with_filename(file.as_bytes())
                    .with_pos(*pos),
            )
            .await
        }
        StartFrom::Gtid { sid, gno } => {
            // The interval 1..=gno is what we have already seen; the server
            // resumes strictly after it.
            let sids = vec![Sid::new(*sid).with_interval(GnoInterval::new(1, gno + 1))];
            conn.get_binlog_stream(
                BinlogStreamRequest::new(server_id)
                    .with_gtid()
                    .with_gtid_set(sids),
            )
            .await
        }
    }
}

async fn open_with_retry(
    opts: &Opts,
    initial_server_id: u32,
    start: &StartFrom,
) -> Result<BinlogStream> {
    let mut server_id = initial_server_id;
    let mut attempt = 1;
    loop {
        match open_binlog_stream(opts, server_id, start).await {
            Ok(stream) => {
                if attempt > 1 {
                    log::info!("Registered as replica {} after {} attempts", server_id, attempt);
                }
                return Ok(stream);
            }
            Err(e) if is_server_id_collision(&e) => {
                if attempt >= CONNECT_MAX_ATTEMPTS {
                    return Err(CdcError::DataSource(format!(
                        "Server id collision persisted after {} attempts: {}",
                        attempt, e
                    )));
                }
                let delay = collision_backoff(attempt, rand::thread_rng().gen_range(0.5..1.5));
                let new_id = random_server_id();
                log::warn!(
                    "Server id {} already in use, retrying with {} in {:?}",
                    server_id,
                    new_id,
                    delay
                );
                tokio::time::sleep(delay).await;
                server_id = new_id;
                attempt += 1;
            }
            Err(e) => {
                return Err(CdcError::DataSource(format!(
                    "Failed to connect to MySQL binlog stream: {}",
                    e
                )))
            }
        }
    }
}

fn is_server_id_collision(err: &mysql_async::Error) -> bool {
    match err {
        mysql_async::Error::Server(server_err) => {
            // ER_SLAVE_FATAL_ERROR with the duplicate-replica message
            server_err.code == 1593 || server_err.message.contains("server_uuid/server_id")
        }
        _ => false,
    }
}

fn collision_backoff(attempt: u32, jitter: f64) -> Duration {
    let exp = 0.1 * 2f64.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64((exp * jitter).min(5.0))
}

fn random_server_id() -> u32 {
    rand::thread_rng().gen_range(2..=u32::MAX)
}

/// Cached `information_schema` column names per table
#[derive(Default)]
struct ColumnNameCache {
    cache: HashMap<(String, String), Arc<Vec<String>>>,
}

impl ColumnNameCache {
    // TODO: invalidate on DDL query events so column renames are picked up
    // without a reconnect.
    async fn get(&mut self, ctl: &mut Conn, database: &str, table: &str) -> Arc<Vec<String>> {
        let key = (database.to_string(), table.to_string());
        if let Some(names) = self.cache.get(&key) {
            return Arc::clone(names);
        }

        let names: Vec<String> = match ctl
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
        {
            Ok(names) => names,
            Err(e) => {
                log::warn!(
                    "Failed to fetch column names for {}.{}: {}",
                    database,
                    table,
                    e
                );
                Vec::new()
            }
        };

        let names = Arc::new(names);
        self.cache.insert(key, Arc::clone(&names));
        names
    }
}

async fn decode_event(
    event: &BinlogEvent,
    stream: &BinlogStream,
    ctl: &mut Conn,
    columns: &mut ColumnNameCache,
) -> std::result::Result<Vec<FramedRecord>, String> {
    use mysql_async::binlog::events;

    let event_type = event
        .header()
        .event_type()
        .map_err(|e| format!("Unknown binlog event type: {}", e))?;
    let timestamp = event.header().timestamp();

    match event_type {
        BinlogEventType::GTID_EVENT => {
            let ev: events::GtidEvent = event
                .read_event()
                .map_err(|e| format!("Failed to decode GTID event: {}", e))?;
            let position = Position::new(format_gtid(&ev.sid(), ev.gno()));
            Ok(vec![FramedRecord::TxnBegin(position)])
        }
        BinlogEventType::XID_EVENT => Ok(vec![FramedRecord::Commit]),
        BinlogEventType::QUERY_EVENT => {
            let ev: events::QueryEvent = event
                .read_event()
                .map_err(|e| format!("Failed to decode query event: {}", e))?;
            // Non-transactional tables commit through a plain COMMIT query
            if ev.query().eq_ignore_ascii_case("COMMIT") {
                Ok(vec![FramedRecord::Commit])
            } else {
                Ok(Vec::new())
            }
        }
        BinlogEventType::WRITE_ROWS_EVENT => {
            let ev: events::WriteRowsEvent = event
                .read_event()
                .map_err(|e| format!("Failed to decode write rows event: {}", e))?;
            let tme = stream
                .get_tme(ev.table_id())
                .ok_or("No table map event for WRITE_ROWS_EVENT")?;
            let names = columns
                .get(ctl, tme.database_name().as_ref(), tme.table_name().as_ref())
                .await;
            let mut records = Vec::new();
            for row in ev.rows(tme) {
                let (_, after) = row.map_err(|e| format!("Failed to decode row image: {}", e))?;
                let after = after.ok_or("Missing row image in WRITE_ROWS_EVENT")?;
                records.push(FramedRecord::Row(RowRecord {
                    event_type: EventType::Insert,
                    database: tme.database_name().to_string(),
                    table: tme.table_name().to_string(),
                    content: ChangeContent::Row(binlog_row_to_row(&after, &names)),
                    timestamp,
                }));
            }
            Ok(records)
        }
        BinlogEventType::UPDATE_ROWS_EVENT => {
            let ev: events::UpdateRowsEvent = event
                .read_event()
                .map_err(|e| format!("Failed to decode update rows event: {}", e))?;
            let tme = stream
                .get_tme(ev.table_id())
                .ok_or("No table map event for UPDATE_ROWS_EVENT")?;
            let names = columns
                .get(ctl, tme.database_name().as_ref(), tme.table_name().as_ref())
                .await;
            let mut records = Vec::new();
            for row in ev.rows(tme) {
                let (before, after) =
                    row.map_err(|e| format!("Failed to decode row image: {}", e))?;
                let before = before.ok_or("Missing before image in UPDATE_ROWS_EVENT")?;
                let after = after.ok_or("Missing after image in UPDATE_ROWS_EVENT")?;
                records.push(FramedRecord::Row(RowRecord {
                    event_type: EventType::Update,
                    database: tme.database_name().to_string(),
                    table: tme.table_name().to_string(),
                    content: ChangeContent::Pair {
                        before: binlog_row_to_row(&before, &names),
                        after: binlog_row_to_row(&after, &names),
                    },
                    timestamp,
                }));
            }
            Ok(records)
        }
        BinlogEventType::DELETE_ROWS_EVENT => {
            let ev: events::DeleteRowsEvent = event
                .read_event()
                .map_err(|e| format!("Failed to decode delete rows event: {}", e))?;
            let tme = stream
                .get_tme(ev.table_id())
                .ok_or("No table map event for DELETE_ROWS_EVENT")?;
            let names = columns
                .get(ctl, tme.database_name().as_ref(), tme.table_name().as_ref())
                .await;
            let mut records = Vec::new();
            for row in ev.rows(tme) {
                let (before, _) = row.map_err(|e| format!("Failed to decode row image: {}", e))?;
                let before = before.ok_or("Missing row image in DELETE_ROWS_EVENT")?;
                records.push(FramedRecord::Row(RowRecord {
                    event_type: EventType::Delete,
                    database: tme.database_name().to_string(),
                    table: tme.table_name().to_string(),
                    content: ChangeContent::Row(binlog_row_to_row(&before, &names)),
                    timestamp,
                }));
            }
            Ok(records)
        }
        // Rotate, format description and table map events are bookkeeping
        // the stream reader handles internally.
        _ => Ok(Vec::new()),
    }
}

fn binlog_row_to_row(row: &BinlogRow, columns: &[String]) -> Row {
    let mut out = Row::new();
    for idx in 0..row.len() {
        let name = columns
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("col_{}", idx));
        let value = match row.as_ref(idx) {
            Some(BinlogValue::Value(value)) => sql_value_to_value(value),
            Some(BinlogValue::Jsonb(value)) => jsonb_to_value(value),
            Some(BinlogValue::JsonDiff(_)) => {
                log::warn!("Partial JSON update for column {} not supported, storing null", name);
                Value::Null
            }
            None => Value::Null,
        };
        out.insert(name, value);
    }
    out
}

fn sql_value_to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
        SqlValue::Int(i) => Value::Int(*i),
        SqlValue::UInt(u) => {
            if *u <= i64::MAX as u64 {
                Value::Int(*u as i64)
            } else {
                Value::Str(u.to_string())
            }
        }
        SqlValue::Float(f) => Value::Float(f64::from(*f)),
        SqlValue::Double(d) => Value::Float(*d),
        SqlValue::Date(year, month, day, hour, minute, second, micros) => {
            let datetime = chrono::NaiveDate::from_ymd_opt(
                i32::from(*year),
                u32::from(*month),
                u32::from(*day),
            )
            .and_then(|date| {
                date.and_hms_micro_opt(
                    u32::from(*hour),
                    u32::from(*minute),
                    u32::from(*second),
                    *micros,
                )
            });
            match datetime {
                Some(datetime) => Value::Time(datetime),
                // Zero dates have no chrono representation
                None => Value::Str(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                )),
            }
        }
        SqlValue::Time(negative, days, hours, minutes, seconds, micros) => Value::Str(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if *negative { "-" } else { "" },
            u32::from(*hours) + days * 24,
            minutes,
            seconds,
            micros
        )),
    }
}

fn jsonb_to_value(value: &jsonb::Value) -> Value {
    match serde_json::Value::try_from(value.clone()) {
        Ok(json) => serializer::from_json(&json),
        Err(_) => match value {
            jsonb::Value::Opaque(opaque) => {
                Value::Str(opaque.data().into_owned())
            }
            other => {
                log::debug!("Unrepresentable JSONB value, storing debug form");
                Value::Str(format!("{:?}", other))
            }
        },
    }
}

/// Render a GTID as the canonical `uuid:gno` token
fn format_gtid(sid: &[u8; 16], gno: u64) -> String {
    let hex = hex::encode(sid);
    format!(
        "{}-{}-{}-{}-{}:{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32],
        gno
    )
}

/// Parse a `uuid:gno` token back into its parts
fn parse_gtid_token(token: &str) -> Result<([u8; 16], u64)> {
    let (uuid, gno) = token.rsplit_once(':').ok_or_else(|| {
        CdcError::DataSource(format!("Invalid GTID position token: {}", token))
    })?;
    let gno = gno
        .parse::<u64>()
        .ok()
        .filter(|g| *g >= 1)
        .ok_or_else(|| {
            CdcError::DataSource(format!("Invalid transaction number in token: {}", token))
        })?;

    let raw = uuid.replace('-', "");
    let bytes = hex::decode(&raw)
        .map_err(|_| CdcError::DataSource(format!("Invalid server uuid in token: {}", token)))?;
    let sid: [u8; 16] = bytes
        .try_into()
        .map_err(|_| CdcError::DataSource(format!("Invalid server uuid in token: {}", token)))?;
    Ok((sid, gno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gtid_round_trip() {
        let sid: [u8; 16] = [
            0x3e, 0x11, 0xfa, 0x47, 0x71, 0xca, 0x11, 0xe1, 0x9e, 0x33, 0xc8, 0x0a, 0xa9, 0x42,
            0x95, 0x62,
        ];
        let token = format_gtid(&sid, 23);
        assert_eq!(token, "3e11fa47-71ca-11e1-9e33-c80aa9429562:23");
        let (parsed_sid, gno) = parse_gtid_token(&token).unwrap();
        assert_eq!(parsed_sid, sid);
        assert_eq!(gno, 23);
    }

    #[test]
    fn test_parse_gtid_token_rejects_garbage() {
        assert!(parse_gtid_token("").is_err());
        assert!(parse_gtid_token("no-colon").is_err());
        assert!(parse_gtid_token("3e11fa47-71ca-11e1-9e33-c80aa9429562:zero").is_err());
        assert!(parse_gtid_token("3e11fa47-71ca-11e1-9e33-c80aa9429562:0").is_err());
        assert!(parse_gtid_token("nothex:5").is_err());
        assert!(parse_gtid_token("abcd:5").is_err());
    }

    #[test]
    fn test_verify_settings_accepts_correct_configuration() {
        let actual: HashMap<String, String> = REQUIRED_SETTINGS
            .iter()
            .map(|(name, expected)| (name.to_string(), expected.to_string()))
            .collect();
        assert!(verify_settings(&actual).is_ok());
    }

    #[test]
    fn test_verify_settings_is_case_insensitive() {
        let actual: HashMap<String, String> = REQUIRED_SETTINGS
            .iter()
            .map(|(name, expected)| (name.to_string(), expected.to_ascii_lowercase()))
            .collect();
        assert!(verify_settings(&actual).is_ok());
    }

    #[test]
    fn test_verify_settings_rejects_statement_format() {
        let mut actual: HashMap<String, String> = REQUIRED_SETTINGS
            .iter()
            .map(|(name, expected)| (name.to_string(), expected.to_string()))
            .collect();
        actual.insert("binlog_format".to_string(), "STATEMENT".to_string());
        let err = verify_settings(&actual).unwrap_err();
        match err {
            CdcError::Configuration(msg) => {
                assert!(msg.contains("binlog_format"));
                assert!(msg.contains("STATEMENT"));
            }
            other => panic!("Expected Configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_settings_rejects_missing_setting() {
        let err = verify_settings(&HashMap::new()).unwrap_err();
        match err {
            CdcError::Configuration(msg) => assert!(msg.contains("not found")),
            other => panic!("Expected Configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_collision_backoff_doubles_and_caps() {
        assert_eq!(collision_backoff(1, 1.0), Duration::from_millis(100));
        assert_eq!(collision_backoff(2, 1.0), Duration::from_millis(200));
        assert_eq!(collision_backoff(3, 1.0), Duration::from_millis(400));
        // Capped at five seconds regardless of attempt or jitter
        assert_eq!(collision_backoff(10, 1.5), Duration::from_secs(5));
    }

    #[test]
    fn test_collision_backoff_jitter_bounds() {
        let low = collision_backoff(2, 0.5);
        let high = collision_backoff(2, 1.5);
        assert_eq!(low, Duration::from_millis(100));
        assert_eq!(high, Duration::from_millis(300));
    }

    #[test]
    fn test_random_server_id_is_positive() {
        for _ in 0..100 {
            assert!(random_server_id() >= 2);
        }
    }

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(sql_value_to_value(&SqlValue::NULL), Value::Null);
        assert_eq!(sql_value_to_value(&SqlValue::Int(-5)), Value::Int(-5));
        assert_eq!(sql_value_to_value(&SqlValue::UInt(5)), Value::Int(5));
        assert_eq!(
            sql_value_to_value(&SqlValue::UInt(u64::MAX)),
            Value::Str(u64::MAX.to_string())
        );
        assert_eq!(
            sql_value_to_value(&SqlValue::Bytes(b"abc".to_vec())),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(sql_value_to_value(&SqlValue::Double(2.5)), Value::Float(2.5));
    }

    #[test]
    fn test_sql_date_conversion() {
        let value = sql_value_to_value(&SqlValue::Date(2025, 3, 31, 12, 30, 5, 0));
        match value {
            Value::Time(t) => assert_eq!(t.to_string(), "2025-03-31 12:30:05"),
            other => panic!("Expected Time, got {:?}", other),
        }
        // The zero date falls back to a formatted string
        let zero = sql_value_to_value(&SqlValue::Date(0, 0, 0, 0, 0, 0, 0));
        assert_eq!(zero, Value::Str("0000-00-00 00:00:00".to_string()));
    }

    #[test]
    fn test_sql_time_conversion_includes_days() {
        let value = sql_value_to_value(&SqlValue::Time(false, 1, 2, 3, 4, 0));
        assert_eq!(value, Value::Str("26:03:04.000000".to_string()));
        let negative = sql_value_to_value(&SqlValue::Time(true, 0, 1, 2, 3, 500));
        assert_eq!(negative, Value::Str("-01:02:03.000500".to_string()));
    }

    #[test]
    fn test_listen_requires_connect() {
        let mut source = MySqlDataSource::new(MySqlConfig {
            host: "db.example.com".to_string(),
            user: "repl".to_string(),
            password: "secret".to_string(),
            port: 3306,
            server_id: 1234,
        });
        assert!(source.listen().is_err());
        assert!(source.current_position().is_empty());
        assert_eq!(source.source_type(), "mysql");
        assert_eq!(source.source_id(), "db.example.com");
        // Disconnect before connect is a no-op
        source.disconnect();
    }
}
