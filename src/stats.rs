//! Per-bucket capture counters
//!
//! Every archived capture bumps the `__all__` bucket and each bucket named in
//! its metadata header exactly once. Counters live in memory; the `local`
//! backend also persists them to SQLite on a timer and at shutdown, and loads
//! existing rows at start.

use crate::config::{StatsBackend, StatsConfig};
use crate::errors::{Error, Result};
use crate::listener::Listener;
use crate::record::{RecordedUrl, WrittenRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Bucket every capture is counted in
pub const ALL_BUCKET: &str = "__all__";
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Url and byte counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
  /// Captures
  pub urls: u64,
  /// Response bytes as received from the origin
  pub wire_bytes: u64,
}

/// Counters of one bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
  /// Every capture
  pub total: Counts,
  /// Written as original response records
  pub new: Counts,
  /// Written as revisit records
  pub revisit: Counts,
}

impl BucketStats {
  fn add(&mut self, wire_bytes: u64, revisit: bool) {
    self.total.urls += 1;
    self.total.wire_bytes += wire_bytes;
    let side = if revisit {
      &mut self.revisit
    } else {
      &mut self.new
    };
    side.urls += 1;
    side.wire_bytes += wire_bytes;
  }
}

/// In-memory stats, optionally backed by SQLite
pub struct StatsDb {
  buckets: DashMap<String, BucketStats>,
  conn: Option<Mutex<Connection>>,
  last_warning: Mutex<Option<Instant>>,
}

impl StatsDb {
  /// Build from config, `None` when stats are disabled
  pub fn from_config(config: &StatsConfig) -> Result<Option<Arc<Self>>> {
    match &config.backend {
      StatsBackend::Disabled => Ok(None),
      StatsBackend::Memory => Ok(Some(Arc::new(Self::in_memory()))),
      StatsBackend::Local { path } => Ok(Some(Arc::new(Self::open(path)?))),
    }
  }

  /// Counters without persistence
  pub fn in_memory() -> Self {
    Self {
      buckets: DashMap::new(),
      conn: None,
      last_warning: Mutex::new(None),
    }
  }

  /// Counters persisted to the SQLite file at `path`, loading existing rows
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS buckets_of_stats (bucket TEXT PRIMARY KEY, stats TEXT NOT NULL);",
    )?;
    let buckets = DashMap::new();
    {
      let mut stmt = conn.prepare("SELECT bucket, stats FROM buckets_of_stats")?;
      let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
      for row in rows {
        let (bucket, json) = row?;
        match serde_json::from_str::<BucketStats>(&json) {
          Ok(stats) => {
            buckets.insert(bucket, stats);
          }
          Err(e) => tracing::warn!(bucket = %bucket, "ignoring unreadable stats row: {}", e),
        }
      }
    }
    tracing::info!("stats db at {} with {} buckets", path.display(), buckets.len());
    Ok(Self {
      buckets,
      conn: Some(Mutex::new(conn)),
      last_warning: Mutex::new(None),
    })
  }

  /// Count one capture in `__all__` and its metadata buckets
  pub fn record(&self, recorded: &RecordedUrl) {
    let wire_bytes = recorded.response_size();
    let revisit = recorded.is_revisit();
    let mut seen: Vec<&str> = Vec::with_capacity(1 + recorded.meta.stats_buckets().len());
    for bucket in std::iter::once(ALL_BUCKET).chain(recorded.meta.stats_buckets().iter().map(String::as_str)) {
      if seen.contains(&bucket) {
        continue;
      }
      seen.push(bucket);
      self
        .buckets
        .entry(bucket.to_string())
        .or_default()
        .add(wire_bytes, revisit);
    }
  }

  /// Snapshot of one bucket
  pub fn value(&self, bucket: &str) -> Option<BucketStats> {
    self.buckets.get(bucket).map(|s| *s)
  }

  /// Names of all buckets
  pub fn bucket_names(&self) -> Vec<String> {
    self.buckets.iter().map(|e| e.key().clone()).collect()
  }

  /// Write every bucket to SQLite; a no-op without persistence
  pub fn flush(&self) -> Result<()> {
    self
      .write_rows()
      .map_err(|e| Error::stats_error(format!("flush failed: {}", e)))
  }

  fn write_rows(&self) -> Result<()> {
    let Some(conn) = &self.conn else {
      return Ok(());
    };
    let rows: Vec<(String, BucketStats)> = self
      .buckets
      .iter()
      .map(|e| (e.key().clone(), *e.value()))
      .collect();
    let mut conn = conn.lock();
    let tx = conn.transaction()?;
    for (bucket, stats) in rows {
      tx.execute(
        "INSERT OR REPLACE INTO buckets_of_stats (bucket, stats) VALUES (?1, ?2)",
        params![bucket, serde_json::to_string(&stats)?],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  /// Flush, logging at most one warning per minute on failure
  fn flush_or_warn(&self) {
    if let Err(e) = self.flush() {
      let mut last = self.last_warning.lock();
      if last.map_or(true, |t| t.elapsed() >= WARN_INTERVAL) {
        *last = Some(Instant::now());
        tracing::warn!("{}; increments are kept in memory", e);
      }
    }
  }

  /// Flush every `interval` until `stop` fires
  pub fn spawn_flusher(
    self: &Arc<Self>,
    interval: Duration,
    stop: CancellationToken,
  ) -> Option<tokio::task::JoinHandle<()>> {
    self.conn.as_ref()?;
    let stats = self.clone();
    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = ticker.tick() => {
            let stats = stats.clone();
            let _ = tokio::task::spawn_blocking(move || stats.flush_or_warn()).await;
          }
        }
      }
    }))
  }
}

#[async_trait::async_trait]
impl Listener for StatsDb {
  fn name(&self) -> &str {
    "stats"
  }

  async fn notify(&self, recorded: &RecordedUrl, _records: &[WrittenRecord]) -> Result<()> {
    self.record(recorded);
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dedup::DedupEntry;
  use crate::listener::tests::recorded_url;
  use crate::record::StatsMeta;

  #[test]
  fn test_new_and_revisit_counts() {
    let stats = StatsDb::in_memory();
    let mut first = recorded_url("http://a/", b"hello");
    first.meta.stats = Some(StatsMeta {
      buckets: vec!["job".to_string(), "job".to_string(), ALL_BUCKET.to_string()],
    });
    stats.record(&first);
    let mut second = recorded_url("http://b/", b"hello");
    second.dedup_info = Some(DedupEntry {
      digest_key: "k".to_string(),
      url: "http://a/".to_string(),
      date: "2024-01-01T00:00:00Z".to_string(),
      record_id: None,
    });
    stats.record(&second);

    let all = stats.value(ALL_BUCKET).unwrap();
    assert_eq!(all.total.urls, 2);
    assert_eq!(all.new.urls, 1);
    assert_eq!(all.revisit.urls, 1);
    assert_eq!(all.total.wire_bytes, first.response_size() + second.response_size());
    let job = stats.value("job").unwrap();
    assert_eq!(job.total.urls, 1);
    let mut names = stats.bucket_names();
    names.sort();
    assert_eq!(names, vec![ALL_BUCKET.to_string(), "job".to_string()]);
    assert!(stats.value("other").is_none());
  }

  #[test]
  fn test_persist_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.sqlite");
    {
      let stats = StatsDb::open(&path).unwrap();
      stats.record(&recorded_url("http://a/", b"x"));
      stats.flush().unwrap();
    }
    let stats = StatsDb::open(&path).unwrap();
    assert_eq!(stats.value(ALL_BUCKET).unwrap().total.urls, 1);
    stats.record(&recorded_url("http://a/", b"x"));
    assert_eq!(stats.value(ALL_BUCKET).unwrap().total.urls, 2);
  }

  #[tokio::test]
  async fn test_concurrent_increments() {
    let stats = Arc::new(StatsDb::in_memory());
    let mut tasks = Vec::new();
    for _ in 0..8 {
      let stats = stats.clone();
      tasks.push(tokio::spawn(async move {
        let recorded = recorded_url("http://a/", b"x");
        for _ in 0..50 {
          stats.record(&recorded);
        }
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    assert_eq!(stats.value(ALL_BUCKET).unwrap().total.urls, 400);
  }
}
