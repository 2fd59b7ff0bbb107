//! Heritrix-style crawl log, one append-only file per WARC prefix

use crate::errors::Result;
use crate::http1::parse_request_head;
use crate::listener::Listener;
use crate::record::{RecordedUrl, WrittenRecord};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Writes one line per archived capture
pub struct CrawlLogger {
  dir: PathBuf,
  default_prefix: String,
  files: Arc<Mutex<HashMap<String, File>>>,
}

impl CrawlLogger {
  /// Logs under `dir`, captures without a prefix go to `default_prefix`
  pub fn new(dir: impl Into<PathBuf>, default_prefix: impl Into<String>) -> Result<Self> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)?;
    Ok(Self {
      dir,
      default_prefix: default_prefix.into(),
      files: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  /// Path of the log for `prefix`
  pub fn path_for(&self, prefix: &str) -> PathBuf {
    self.dir.join(format!("{}.log", prefix.replace(['/', '\\'], "_")))
  }
}

/// Format one crawl log line
///
/// Fields: log time, status, payload size, URL, hop path, referer, mimetype,
/// worker, fetch start and duration, payload digest, source, annotations and a
/// JSON object locating the record.
pub fn format_line(recorded: &RecordedUrl, records: &[WrittenRecord]) -> String {
  let now = Utc::now();
  let referer = parse_request_head(recorded.request_header_bytes())
    .ok()
    .and_then(|head| {
      head
        .headers
        .get(http::header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    })
    .unwrap_or_else(|| "-".to_string());
  let annotations = match (recorded.is_revisit(), recorded.truncated) {
    (true, _) => "duplicate:digest".to_string(),
    (false, Some(reason)) => format!("truncated:{}", reason),
    (false, None) => "-".to_string(),
  };
  let extra = match records.first() {
    Some(record) => json!({
      "contentSize": recorded.response_size(),
      "warcFilename": record.warc_filename,
      "warcFileOffset": record.offset,
    }),
    None => json!({ "contentSize": recorded.response_size() }),
  };
  format!(
    "{} {:>5} {:>10} {} - {} {} - {}+{:03} {} - {} {}\n",
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
    recorded.status.as_u16(),
    recorded.response.payload_len(),
    recorded.url,
    referer,
    recorded.mimetype.as_deref().unwrap_or("-"),
    recorded.timestamp.format("%Y%m%d%H%M%S%3f"),
    recorded.elapsed.as_millis(),
    recorded.payload_digest(),
    annotations,
    extra,
  )
}

#[async_trait::async_trait]
impl Listener for CrawlLogger {
  fn name(&self) -> &str {
    "crawl-log"
  }

  async fn notify(&self, recorded: &RecordedUrl, records: &[WrittenRecord]) -> Result<()> {
    let line = format_line(recorded, records);
    let prefix = recorded.warc_prefix(&self.default_prefix).to_string();
    let path = self.path_for(&prefix);
    let files = self.files.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
      let mut files = files.lock();
      let file = match files.entry(prefix) {
        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
        std::collections::hash_map::Entry::Vacant(e) => e.insert(
          OpenOptions::new().create(true).append(true).open(&path)?,
        ),
      };
      file.write_all(line.as_bytes())?;
      Ok(())
    })
    .await?
  }

  async fn close(&self) -> Result<()> {
    let files = self.files.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
      for (_, file) in files.lock().drain() {
        file.sync_all()?;
      }
      Ok(())
    })
    .await?
  }
}
