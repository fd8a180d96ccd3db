//! Request Record Store
//!
//! A handle to the shared SQLite file in the group directory. Cloning the
//! handle is cheap; all clones share one writer thread and one read
//! connection.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = RequestStore::open(StoreConfig::new("/var/lib/netrack"))?;
//! let id = store.append("q=rust", Utc::now(), "www.google.com")?;
//!
//! let changes = store.subscribe();
//! for record in store.fetch_all()? {
//!     println!("{} {}", record.display_date(), record.link);
//! }
//! ```

use crate::notifier::{ChangeNotifier, Subscription};
use crate::record::{RecordId, RequestRecord};
use crate::watcher::ChangeWatcher;
use crate::writer::{spawn_writer, WriteCommand};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Sender};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the shared store inside the group directory.
pub const DEFAULT_DB_FILE: &str = "NetworkTracker.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS requests (
        id   TEXT PRIMARY KEY NOT NULL,
        date INTEGER NOT NULL,
        link TEXT NOT NULL,
        text TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_requests_date ON requests(date DESC);
";

/// Errors from the request store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Invalid record in store: {0}")]
    InvalidRecord(String),

    #[error("Store writer is not running")]
    WriterClosed,

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Group directory shared by interceptor and viewer
    pub dir: PathBuf,
    /// Database file name inside `dir`
    pub file_name: String,
    /// How long to wait for another process holding the write lock
    pub busy_timeout: Duration,
    /// Maximum appends committed in one transaction
    pub max_batch: usize,
}

impl StoreConfig {
    /// Configuration for a group directory with default settings.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Full path of the database file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("netrack-group"),
            file_name: DEFAULT_DB_FILE.to_string(),
            busy_timeout: Duration::from_secs(5),
            max_batch: 256,
        }
    }
}

struct StoreInner {
    path: PathBuf,
    busy_timeout: Duration,
    writer_tx: Sender<WriteCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Connection>,
    notifier: ChangeNotifier,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Queued commands ahead of Shutdown still get processed
        let _ = self.writer_tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.writer.get_mut().ok().and_then(Option::take) {
            if handle.join().is_err() {
                warn!("Store writer panicked");
            }
        }
    }
}

/// Handle to the shared request store.
#[derive(Clone)]
pub struct RequestStore {
    inner: Arc<StoreInner>,
}

impl RequestStore {
    /// Open (or create) the store.
    ///
    /// Failure here means the process has no persistence and must not run.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.dir)?;
        let path = config.path();

        let writer_conn = open_connection(&path, config.busy_timeout)?;
        let mode: String =
            writer_conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!("Store journal mode is {} (WAL unavailable)", mode);
        }
        writer_conn.pragma_update(None, "synchronous", "NORMAL")?;
        writer_conn.execute_batch(SCHEMA)?;

        let reader = open_connection(&path, config.busy_timeout)?;

        let notifier = ChangeNotifier::new();
        let (writer_tx, writer_rx) = unbounded();
        let handle = spawn_writer(writer_conn, writer_rx, notifier.clone(), config.max_batch)?;

        info!("Request store opened at {}", path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                busy_timeout: config.busy_timeout,
                writer_tx,
                writer: Mutex::new(Some(handle)),
                reader: Mutex::new(reader),
                notifier,
            }),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Persist one record and return its id.
    ///
    /// Safe to call from any number of threads; calls are serialized by the
    /// writer thread and return once the record is committed.
    pub fn append(
        &self,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        link: impl Into<String>,
    ) -> Result<RecordId, StoreError> {
        let record = RequestRecord::new(text, timestamp, link);
        debug!("Appending record {} ({})", record.id, record.link);
        self.submit(|reply| WriteCommand::Append { record, reply })
    }

    /// All records, newest first.
    pub fn fetch_all(&self) -> Result<Vec<RequestRecord>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, date, link, text FROM requests ORDER BY date DESC, id DESC",
        )?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Look up one record.
    pub fn fetch_by_id(&self, id: &RecordId) -> Result<Option<RequestRecord>, StoreError> {
        let conn = self.reader()?;
        let record = conn
            .query_row(
                "SELECT id, date, link, text FROM requests WHERE id = ?1",
                [id.to_string()],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Delete one record. Returns whether it existed.
    pub fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        let id = *id;
        self.submit(|reply| WriteCommand::Delete { id, reply })
    }

    /// Delete every record. Returns how many were removed.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        self.submit(|reply| WriteCommand::DeleteAll { reply })
    }

    /// Checkpoint committed writes into the main database file.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.submit(|reply| WriteCommand::Flush { reply })
    }

    /// Subscribe to changes committed through this handle (and any watcher
    /// started with [`RequestStore::watch`]).
    pub fn subscribe(&self) -> Subscription {
        self.inner.notifier.subscribe()
    }

    /// The notifier this store publishes to.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Start watching the file for commits made by other processes.
    pub fn watch(&self, interval: Duration) -> Result<ChangeWatcher, StoreError> {
        let conn = open_connection(&self.inner.path, self.inner.busy_timeout)?;
        ChangeWatcher::spawn(conn, interval, self.inner.notifier.clone())
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(Sender<Result<T, StoreError>>) -> WriteCommand,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inner
            .writer_tx
            .send(make(reply_tx))
            .map_err(|_| StoreError::WriterClosed)?;
        reply_rx.recv().map_err(|_| StoreError::WriterClosed)?
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.inner.reader.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let id: String = row.get(0)?;
    let micros: i64 = row.get(1)?;

    let id = id.parse::<RecordId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let timestamp = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            Box::new(StoreError::InvalidRecord(format!("timestamp {} out of range", micros))),
        )
    })?;

    Ok(RequestRecord {
        id,
        timestamp,
        link: row.get(2)?,
        text: row.get(3)?,
    })
}
