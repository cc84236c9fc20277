use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::data::{Cursor, ImageRecord, NewImageRecord};
use crate::error::{Error, Result};
use crate::store::{InsertSubscription, RecordStore};

/// Buffered insert notifications per subscriber before it starts lagging
const INSERT_CHANNEL_CAPACITY: usize = 256;

/// How often subscribed libraries look for rows written by other connections
pub const INSERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a writer waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Announcement state shared by the library and its watcher task.
///
/// Rows are announced in `created_at` order, each exactly once, whether they
/// were written through this library or by another connection to the file.
struct InsertFeed {
    sender: broadcast::Sender<ImageRecord>,
    /// `created_at` (micros) of the newest row already announced
    seen: Mutex<i64>,
    watching: AtomicBool,
}

/// The Library manages the SQLite table of image records.
/// It assigns ids and creation timestamps, answers cursor queries
/// and notifies subscribers of every insert, including inserts made by
/// other processes sharing the database file.
pub struct Library {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    feed: Arc<InsertFeed>,
    poll_interval: Duration,
}

impl Library {
    /// Open (or create) the database file at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        info!(path = %db_path.display(), "record database opened");

        Self::with_connection(conn, Some(db_path.to_path_buf()))
    }

    /// A private database that disappears with the Library
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        init_schema(&conn)?;
        let seen = newest_created_at(&conn)?;
        let (sender, _) = broadcast::channel(INSERT_CHANNEL_CAPACITY);
        Ok(Library {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            feed: Arc::new(InsertFeed {
                sender,
                seen: Mutex::new(seen),
                watching: AtomicBool::new(false),
            }),
            poll_interval: INSERT_POLL_INTERVAL,
        })
    }

    /// Change how often subscribers are caught up with foreign inserts
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        // tokio intervals reject a zero period
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Get the path to the database file (`None` when in memory)
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Number of live insert subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.feed.sender.receiver_count()
    }

    /// Whether a watcher task is currently polling for foreign inserts
    pub fn is_watching(&self) -> bool {
        self.feed.watching.load(Ordering::SeqCst)
    }

    /// Get a count of images in the library
    pub fn image_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Start the watcher task unless one is already running
    fn ensure_watcher(&self) {
        if self.feed.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, inserts from other connections will not be announced");
            self.feed.watching.store(false, Ordering::SeqCst);
            return;
        };

        let conn = Arc::clone(&self.conn);
        let feed = Arc::clone(&self.feed);
        runtime.spawn(watch_inserts(conn, feed, self.poll_interval));
    }
}

/// Poll for rows committed by other connections while anyone is subscribed
async fn watch_inserts(conn: Arc<Mutex<Connection>>, feed: Arc<InsertFeed>, period: Duration) {
    debug!(?period, "insert watcher started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if feed.sender.receiver_count() == 0 {
            feed.watching.store(false, Ordering::SeqCst);
            // A subscriber may have arrived between the count and the store
            if feed.sender.receiver_count() == 0 || feed.watching.swap(true, Ordering::SeqCst) {
                break;
            }
        }

        let (poll_conn, poll_feed) = (Arc::clone(&conn), Arc::clone(&feed));
        let polled = tokio::task::spawn_blocking(move || {
            let conn = poll_conn.lock();
            announce_new_rows(&conn, &poll_feed)
        })
        .await;

        match polled {
            Ok(Ok(0)) => {}
            Ok(Ok(announced)) => debug!(announced, "announced inserts from the database"),
            Ok(Err(e)) => warn!(error = %e, "polling for new records failed"),
            Err(e) => {
                warn!(error = %e, "insert watcher task failed");
                feed.watching.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
    debug!("insert watcher stopped");
}

/// Initialize the database schema.
/// Creates the images table and its pagination index if they don't exist.
fn init_schema(conn: &Connection) -> Result<()> {
    // created_at is stored as microseconds since the epoch so it sorts numerically
    conn.execute(
        "CREATE TABLE IF NOT EXISTS images (
            id              TEXT PRIMARY KEY,
            storage_path    TEXT NOT NULL UNIQUE,
            author          TEXT NOT NULL,
            moment          TEXT NOT NULL,
            created_at      INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_images_created_at
         ON images(created_at DESC, id DESC)",
        [],
    )?;

    debug!("record schema initialized");
    Ok(())
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn micros_to_datetime(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let id: String = row.get(0)?;
    let moment: String = row.get(3)?;
    Ok(ImageRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        storage_path: row.get(1)?,
        author: row.get(2)?,
        moment: DateTime::parse_from_rfc3339(&moment)
            .map_err(|e| conversion_error(3, e))?
            .with_timezone(&Utc),
        created_at: micros_to_datetime(4, row.get(4)?)?,
    })
}

fn query_page_blocking(conn: &Connection, before: Option<i64>, limit: usize) -> Result<Vec<ImageRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, storage_path, author, moment, created_at
         FROM images
         WHERE (?1 IS NULL OR created_at < ?1)
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(rusqlite::params![before, limit], row_to_record)?;

    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

/// `created_at` of the newest row, 0 for an empty table
fn newest_created_at(conn: &Connection) -> Result<i64> {
    let newest = conn.query_row("SELECT COALESCE(MAX(created_at), 0) FROM images", [], |row| {
        row.get(0)
    })?;
    Ok(newest)
}

/// Broadcast every row newer than the announcement mark, oldest first.
///
/// Callers hold the connection lock, which serializes announcements.
fn announce_new_rows(conn: &Connection, feed: &InsertFeed) -> Result<usize> {
    let mut seen = feed.seen.lock();
    let mut stmt = conn.prepare_cached(
        "SELECT id, storage_path, author, moment, created_at
         FROM images
         WHERE created_at > ?1
         ORDER BY created_at ASC",
    )?;

    let mut announced = 0;
    for record in stmt.query_map([*seen], row_to_record)? {
        let record = record?;
        *seen = record.created_at.timestamp_micros();
        // Sending fails only when nobody is subscribed
        if feed.sender.send(record).is_ok() {
            announced += 1;
        }
    }
    Ok(announced)
}

fn insert_blocking(conn: &mut Connection, new: &NewImageRecord) -> Result<ImageRecord> {
    // IMMEDIATE takes the write lock before reading the newest timestamp, so
    // writers in other processes commit one at a time in created_at order
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // Creation times must be strictly increasing so a cursor never splits a tie
    let last = newest_created_at(&tx)?;
    let now = Utc::now().timestamp_micros();
    let created_micros = if last >= now { last + 1 } else { now };
    let created_at = DateTime::from_timestamp_micros(created_micros)
        .ok_or_else(|| Error::Validation(format!("timestamp out of range: {}", created_micros)))?;

    let record = ImageRecord {
        id: Uuid::new_v4(),
        storage_path: new.storage_path.clone(),
        author: new.author.clone(),
        moment: new.moment,
        created_at,
    };

    tx.execute(
        "INSERT INTO images (id, storage_path, author, moment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            record.id.to_string(),
            &record.storage_path,
            &record.author,
            record.moment.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            created_micros,
        ],
    )?;
    tx.commit()?;

    Ok(record)
}

#[async_trait]
impl RecordStore for Library {
    async fn query_page(&self, before: Option<Cursor>, limit: usize) -> Result<Vec<ImageRecord>> {
        let conn = Arc::clone(&self.conn);
        let before = before.map(|c| c.timestamp_micros());
        let records = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            query_page_blocking(&conn, before, limit)
        })
        .await??;

        debug!(count = records.len(), ?before, limit, "queried record page");
        Ok(records)
    }

    async fn insert_record(&self, record: NewImageRecord) -> Result<ImageRecord> {
        let conn = Arc::clone(&self.conn);
        let feed = Arc::clone(&self.feed);
        let record = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let record = insert_blocking(&mut conn, &record)?;

            // Announced before the lock is released, so in created_at order
            if feed.sender.receiver_count() > 0 {
                if let Err(e) = announce_new_rows(&conn, &feed) {
                    warn!(error = %e, "could not announce new records");
                }
            }
            Ok::<_, Error>(record)
        })
        .await??;

        info!(id = %record.id, path = %record.storage_path, author = %record.author, "record inserted");
        Ok(record)
    }

    fn subscribe_inserts(&self) -> InsertSubscription {
        let rx = {
            let conn = self.conn.lock();
            let mut seen = self.feed.seen.lock();
            if self.feed.sender.receiver_count() == 0 {
                // Nobody was listening, so nothing written so far is owed
                match newest_created_at(&conn) {
                    Ok(newest) => *seen = newest,
                    Err(e) => warn!(error = %e, "could not read the newest record"),
                }
            }
            self.feed.sender.subscribe()
        };
        self.ensure_watcher();
        InsertSubscription::new(rx)
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("db_path", &self.db_path)
            .finish()
    }
}
