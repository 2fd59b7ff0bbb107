//! URL to capture location index for playback
//!
//! Only the write side lives here; a playback reader resolves a URL with
//! [`PlaybackIndex::lookup_latest`] and reads the record at the stored offset.

use crate::errors::Result;
use crate::listener::Listener;
use crate::record::{RecordedUrl, WrittenRecord};
use crate::warc::warc_date;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// One indexed capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackEntry {
  /// Captured URL
  pub url: String,
  /// `WARC-Date` of the record
  pub date: String,
  /// File holding the record
  pub warc_filename: String,
  /// Record offset in the file
  pub offset: u64,
  /// `WARC-Record-ID`
  pub record_id: String,
  /// Payload digest
  pub payload_digest: String,
}

/// SQLite table of captures keyed by URL
#[derive(Clone)]
pub struct PlaybackIndex {
  conn: Arc<Mutex<Connection>>,
}

impl PlaybackIndex {
  /// Open or create the index at `path`
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    Self::init(Connection::open(path)?)
  }

  /// Index held in memory
  pub fn open_in_memory() -> Result<Self> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS captures (
        url TEXT NOT NULL,
        date TEXT NOT NULL,
        warc_filename TEXT NOT NULL,
        offset INTEGER NOT NULL,
        record_id TEXT NOT NULL,
        payload_digest TEXT NOT NULL
      );
      CREATE INDEX IF NOT EXISTS captures_url ON captures (url, date);",
    )?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Add one capture
  pub fn insert(&self, entry: &PlaybackEntry) -> Result<()> {
    self.conn.lock().execute(
      "INSERT INTO captures (url, date, warc_filename, offset, record_id, payload_digest)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![
        entry.url,
        entry.date,
        entry.warc_filename,
        entry.offset as i64,
        entry.record_id,
        entry.payload_digest
      ],
    )?;
    Ok(())
  }

  /// Most recent capture of `url`
  pub fn lookup_latest(&self, url: &str) -> Result<Option<PlaybackEntry>> {
    let conn = self.conn.lock();
    let entry = conn
      .query_row(
        "SELECT url, date, warc_filename, offset, record_id, payload_digest
         FROM captures WHERE url = ?1 ORDER BY date DESC, rowid DESC LIMIT 1",
        params![url],
        |row| {
          Ok(PlaybackEntry {
            url: row.get(0)?,
            date: row.get(1)?,
            warc_filename: row.get(2)?,
            offset: row.get::<_, i64>(3)? as u64,
            record_id: row.get(4)?,
            payload_digest: row.get(5)?,
          })
        },
      )
      .optional()?;
    Ok(entry)
  }
}

#[async_trait::async_trait]
impl Listener for PlaybackIndex {
  fn name(&self) -> &str {
    "playback-index"
  }

  async fn notify(&self, recorded: &RecordedUrl, records: &[WrittenRecord]) -> Result<()> {
    let Some(record) = records
      .iter()
      .find(|r| r.record_type == "response" || r.record_type == "revisit")
    else {
      return Ok(());
    };
    let entry = PlaybackEntry {
      url: recorded.url.clone(),
      date: warc_date(&recorded.timestamp),
      warc_filename: record.warc_filename.clone(),
      offset: record.offset,
      record_id: record.record_id.clone(),
      payload_digest: recorded.payload_digest().to_string(),
    };
    let index = self.clone();
    tokio::task::spawn_blocking(move || index.insert(&entry)).await?
  }
}
