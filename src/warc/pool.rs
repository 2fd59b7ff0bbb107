use super::record::{warcinfo_record, WarcRecord};
use super::writer::WarcWriter;
use super::WarcFileName;
use crate::config::WarcConfig;
use crate::errors::{Error, Result};
use crate::record::WrittenRecord;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How the pool names, sizes and closes files
#[derive(Clone, Debug)]
pub struct PoolSettings {
  /// Output directory
  pub directory: PathBuf,
  /// Filename renderer
  pub names: WarcFileName,
  /// Hostname written into warcinfo records
  pub hostname: String,
  /// One gzip member per record
  pub gzip: bool,
  /// Size threshold for rollover
  pub rollover_size: u64,
  /// Idle threshold for rollover
  pub rollover_idle: Option<Duration>,
  /// Suffix while writable
  pub open_suffix: Option<String>,
  /// Start each file with a warcinfo record
  pub warcinfo: bool,
}

impl From<&WarcConfig> for PoolSettings {
  fn from(config: &WarcConfig) -> Self {
    let hostname = config.hostname();
    Self {
      directory: config.directory.clone(),
      names: WarcFileName::new(config.filename_template.clone(), hostname.clone(), config.gzip),
      hostname,
      gzip: config.gzip,
      rollover_size: config.rollover_size,
      rollover_idle: config.rollover_idle(),
      open_suffix: config.open_suffix.clone().filter(|s| !s.is_empty()),
      warcinfo: config.warcinfo,
    }
  }
}

#[derive(Debug, Default)]
struct PrefixSlot {
  writer: Option<WarcWriter>,
  next_serial: u32,
}

/// Open WARC files, at most one per prefix
///
/// All methods block on file I/O; async callers run them on the blocking pool.
#[derive(Debug)]
pub struct WarcWriterPool {
  settings: PoolSettings,
  slots: Mutex<HashMap<String, Arc<Mutex<PrefixSlot>>>>,
}

impl WarcWriterPool {
  /// Empty pool, files are opened on first write
  pub fn new(settings: PoolSettings) -> Self {
    Self {
      settings,
      slots: Mutex::new(HashMap::new()),
    }
  }

  /// Settings in use
  pub fn settings(&self) -> &PoolSettings {
    &self.settings
  }

  fn slot(&self, prefix: &str) -> Arc<Mutex<PrefixSlot>> {
    self
      .slots
      .lock()
      .entry(prefix.to_string())
      .or_default()
      .clone()
  }

  /// Write one record, returning the final filename and the record offset
  pub fn write_record(&self, prefix: &str, record: WarcRecord<'_>) -> Result<(String, u64)> {
    let written = self.write_records(prefix, vec![record])?;
    written
      .into_iter()
      .next()
      .map(|w| (w.warc_filename, w.offset))
      .ok_or_else(|| Error::warc_error("no record written"))
  }

  /// Write the records of one capture contiguously to the current file of
  /// `prefix`, rolling over first when due
  ///
  /// On failure the file is cut back to where this capture started and then
  /// finalized, so a final-named file never holds a torn record. When the
  /// cut itself fails the file is left under its open name.
  pub fn write_records(
    &self,
    prefix: &str,
    records: Vec<WarcRecord<'_>>,
  ) -> Result<Vec<WrittenRecord>> {
    let slot = self.slot(prefix);
    let mut slot = slot.lock();
    let due = slot
      .writer
      .as_ref()
      .is_some_and(|w| self.rollover_due(w, Instant::now()));
    if due {
      if let Some(writer) = slot.writer.take() {
        writer.finalize()?;
      }
    }
    if slot.writer.is_none() {
      let writer = self.open(prefix, &mut slot)?;
      slot.writer = Some(writer);
    }
    let Some(writer) = slot.writer.as_mut() else {
      return Err(Error::warc_error("no open file"));
    };
    let filename = writer.filename();
    let start = writer.bytes_written();
    let mut written = Vec::with_capacity(records.len());
    let mut failure = None;
    for record in records {
      let record_type = record.record_type().to_string();
      let record_id = record.record_id().to_string();
      match writer.write_record(record) {
        Ok((offset, length)) => written.push(WrittenRecord {
          record_type,
          record_id,
          warc_filename: filename.clone(),
          offset,
          length,
        }),
        Err(e) => {
          failure = Some(e);
          break;
        }
      }
    }
    let failure = match failure {
      None => writer.flush().err(),
      some => some,
    };
    if let Some(e) = failure {
      tracing::error!(prefix, file = %filename, "write failed: {}", e);
      if let Some(writer) = slot.writer.take() {
        let open_path = writer.open_path().to_path_buf();
        match writer.discard_from(start) {
          Ok(writer) => {
            if let Err(close_error) = writer.finalize() {
              tracing::error!(file = %filename, "cannot finalize after failed write: {}", close_error);
            }
          }
          Err(cut_error) => tracing::error!(
            file = %open_path.display(),
            "cannot drop partial records, leaving the file open: {}",
            cut_error
          ),
        }
      }
      return Err(e.into());
    }
    Ok(written)
  }

  fn open(&self, prefix: &str, slot: &mut PrefixSlot) -> Result<WarcWriter> {
    let serial = slot.next_serial;
    slot.next_serial += 1;
    let filename = self.settings.names.render(prefix, serial, Utc::now());
    let mut writer = WarcWriter::create(
      &self.settings.directory,
      &filename,
      self.settings.open_suffix.as_deref(),
      self.settings.gzip,
      serial,
    )
    .map_err(|e| Error::warc_error(format!("cannot open {}: {}", filename, e)))?;
    if self.settings.warcinfo {
      writer.write_record(warcinfo_record(&filename, &self.settings.hostname))?;
    }
    Ok(writer)
  }

  fn rollover_due(&self, writer: &WarcWriter, now: Instant) -> bool {
    if writer.bytes_written() >= self.settings.rollover_size {
      return true;
    }
    match self.settings.rollover_idle {
      Some(idle) => now.saturating_duration_since(writer.last_write_at()) >= idle,
      None => false,
    }
  }

  /// Finalize files idle for longer than the idle threshold
  pub fn maybe_idle_rollover(&self) -> Result<()> {
    let Some(idle) = self.settings.rollover_idle else {
      return Ok(());
    };
    let now = Instant::now();
    for (prefix, slot) in self.snapshot() {
      let mut slot = slot.lock();
      let is_idle = slot
        .writer
        .as_ref()
        .is_some_and(|w| now.saturating_duration_since(w.last_write_at()) >= idle);
      if is_idle {
        if let Some(writer) = slot.writer.take() {
          tracing::debug!(prefix = %prefix, "idle rollover of {}", writer.filename());
          writer.finalize()?;
        }
      }
    }
    Ok(())
  }

  /// Check for idle files on a fixed period until `stop` is cancelled
  ///
  /// Runs independently of the writers, so a prefix with no traffic is
  /// finalized even while other prefixes stay busy. Returns `None` when idle
  /// rollover is off.
  pub fn spawn_idle_rollover(
    self: &Arc<Self>,
    stop: CancellationToken,
  ) -> Option<tokio::task::JoinHandle<()>> {
    let idle = self.settings.rollover_idle?;
    let period = (idle / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
    let pool = self.clone();
    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = ticker.tick() => {
            let pool = pool.clone();
            match tokio::task::spawn_blocking(move || pool.maybe_idle_rollover()).await {
              Ok(Ok(())) => {}
              Ok(Err(e)) => tracing::warn!("idle rollover failed: {}", e),
              Err(e) => tracing::warn!("idle rollover task failed: {}", e),
            }
          }
        }
      }
    }))
  }

  /// Finalize every open file
  pub fn close_all(&self) -> Result<()> {
    let mut first_error = None;
    for (prefix, slot) in self.snapshot() {
      if let Some(writer) = slot.lock().writer.take() {
        if let Err(e) = writer.finalize() {
          tracing::error!(prefix = %prefix, "cannot finalize: {}", e);
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e.into()),
      None => Ok(()),
    }
  }

  /// Open file paths (with suffix) per prefix
  pub fn open_files(&self) -> Vec<PathBuf> {
    self
      .snapshot()
      .into_iter()
      .filter_map(|(_, slot)| slot.lock().writer.as_ref().map(|w| w.open_path().to_path_buf()))
      .collect()
  }

  fn snapshot(&self) -> Vec<(String, Arc<Mutex<PrefixSlot>>)> {
    self
      .slots
      .lock()
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }
}
