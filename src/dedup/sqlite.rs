use super::{DedupEntry, DedupIndex};
use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// Dedup table in an embedded SQLite database
///
/// Access is serialized through one connection and runs on the blocking pool.
#[derive(Clone)]
pub struct LocalDedupDb {
  conn: Arc<Mutex<Connection>>,
}

impl LocalDedupDb {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    tracing::info!("dedup db at {}", path.display());
    Self::init(conn)
  }

  /// Database living only as long as the value
  pub fn open_in_memory() -> Result<Self> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS dedup (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  fn lookup_blocking(conn: &Connection, key: &str) -> Result<Option<DedupEntry>> {
    let value: Option<String> = conn
      .query_row("SELECT value FROM dedup WHERE key = ?1", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    match value {
      Some(json) => Ok(Some(serde_json::from_str(&json)?)),
      None => Ok(None),
    }
  }
}

#[async_trait]
impl DedupIndex for LocalDedupDb {
  fn name(&self) -> &'static str {
    "local"
  }

  async fn lookup(&self, key: &str, _url: &str) -> Result<Option<DedupEntry>> {
    let conn = self.conn.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || Self::lookup_blocking(&conn.lock(), &key)).await?
  }

  async fn store(&self, key: &str, entry: &DedupEntry) -> Result<()> {
    let conn = self.conn.clone();
    let key = key.to_string();
    let value = serde_json::to_string(entry)?;
    tokio::task::spawn_blocking(move || -> Result<()> {
      conn
        .lock()
        .execute(
          "INSERT OR REPLACE INTO dedup (key, value) VALUES (?1, ?2)",
          params![key, value],
        )
        .map(|_| ())
        .map_err(Into::into)
    })
    .await?
  }
}
