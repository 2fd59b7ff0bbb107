//! Writer workers: dedup lookup, record writing and listener notification

use crate::config::{DedupScope, ProxyConfig};
use crate::dedup::{dedup_key, DedupEntry, DedupIndex, DedupLocks};
use crate::digest::DigestAlgorithm;
use crate::errors::{Error, Result};
use crate::listener::ListenerChain;
use crate::queue::TimestampedQueue;
use crate::record::{RecordedUrl, WrittenRecord};
use crate::warc::{records_for, warc_date, WarcWriterPool};
use std::sync::Arc;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// What a worker needs to know about writing
#[derive(Clone, Debug)]
pub struct WorkerSettings {
  /// Digest algorithm of captured messages
  pub digest_algorithm: DigestAlgorithm,
  /// Write a request record next to each response record
  pub record_requests: bool,
  /// Dedup key scope
  pub scope: DedupScope,
  /// Payloads below this size are never deduplicated
  pub min_size: u64,
  /// Prefix for captures without one in their metadata
  pub default_prefix: String,
  /// Attempts after the first failed write
  pub max_write_retries: u32,
}

impl WorkerSettings {
  /// Settings from a validated config
  pub fn from_config(config: &ProxyConfig) -> Result<Self> {
    Ok(Self {
      digest_algorithm: config.digest_algorithm()?,
      record_requests: config.warc.record_requests,
      scope: config.dedup.scope,
      min_size: config.dedup.min_size,
      default_prefix: config.warc.prefix.clone(),
      max_write_retries: config.max_write_retries,
    })
  }
}

/// One writer task
pub struct WarcWriterWorker {
  id: usize,
  queue: Arc<TimestampedQueue<RecordedUrl>>,
  pool: Arc<WarcWriterPool>,
  dedup: Arc<dyn DedupIndex>,
  locks: Arc<DedupLocks>,
  listeners: Arc<ListenerChain>,
  settings: WorkerSettings,
}

impl WarcWriterWorker {
  /// New worker `id`; every worker of one proxy shares the same queue, pool,
  /// dedup index, key locks and listeners
  pub fn new(
    id: usize,
    queue: Arc<TimestampedQueue<RecordedUrl>>,
    pool: Arc<WarcWriterPool>,
    dedup: Arc<dyn DedupIndex>,
    locks: Arc<DedupLocks>,
    listeners: Arc<ListenerChain>,
    settings: WorkerSettings,
  ) -> Self {
    Self {
      id,
      queue,
      pool,
      dedup,
      locks,
      listeners,
      settings,
    }
  }

  /// Process captures until the queue is closed and drained
  ///
  /// Returns an error only when a capture could not be written after all
  /// retries; the worker stops in that case.
  pub async fn run(self) -> Result<()> {
    tracing::debug!(worker = self.id, "writer started");
    while let Some(queued) = self.queue.dequeue().await {
      tracing::trace!(worker = self.id, waited = ?queued.waited(), url = %queued.item.url, "dequeued");
      if let Err(e) = self.process(queued.item).await {
        tracing::error!(worker = self.id, "writer stopping: {}", e);
        return Err(e);
      }
    }
    tracing::debug!(worker = self.id, "writer finished");
    Ok(())
  }

  /// Write one capture and notify listeners
  pub async fn process(&self, mut recorded: RecordedUrl) -> Result<()> {
    let key = self.dedup_candidate(&recorded);
    // held until the original's entry is stored
    let key_guard = match &key {
      Some(key) => Some(self.locks.lock(key).await),
      None => None,
    };
    if let Some(key) = &key {
      match self.dedup.lookup(key, &recorded.url).await {
        Ok(hit) => recorded.dedup_info = hit,
        Err(e) => {
          tracing::warn!(
            url = %recorded.url,
            backend = self.dedup.name(),
            "dedup lookup failed, writing original: {}",
            e
          );
        }
      }
    }

    let recorded = self.write_with_retries(recorded).await?;

    if let (Some(key), None) = (&key, &recorded.dedup_info) {
      let entry = DedupEntry {
        digest_key: key.clone(),
        url: recorded.url.clone(),
        date: warc_date(&recorded.timestamp),
        record_id: recorded
          .warc_records
          .iter()
          .find(|r| r.record_type == "response")
          .map(|r| r.record_id.clone()),
      };
      if let Err(e) = self.dedup.store(key, &entry).await {
        tracing::warn!(url = %recorded.url, backend = self.dedup.name(), "dedup store failed: {}", e);
      }
    }
    drop(key_guard);

    let failures = self.listeners.notify(&recorded).await;
    if failures > 0 {
      tracing::debug!(url = %recorded.url, failures, "listener failures");
    }
    Ok(())
  }

  /// Dedup key, or `None` when the capture must be written as an original
  fn dedup_candidate(&self, recorded: &RecordedUrl) -> Option<String> {
    if recorded.truncated.is_some() || recorded.response.payload_len() == 0 {
      return None;
    }
    if recorded.response.payload_len() < self.settings.min_size {
      return None;
    }
    let digest = recorded.payload_digest();
    let label = self.settings.digest_algorithm.label();
    if digest.len() <= label.len() + 1 || !digest.starts_with(label) {
      tracing::warn!(url = %recorded.url, digest, "unexpected payload digest, not deduplicating");
      return None;
    }
    Some(dedup_key(
      self.settings.scope,
      digest,
      recorded.meta.dedup_bucket.as_deref(),
    ))
  }

  async fn write_with_retries(&self, mut recorded: RecordedUrl) -> Result<RecordedUrl> {
    let mut attempt = 0;
    loop {
      let (back, result) = self.write(recorded).await?;
      recorded = back;
      match result {
        Ok(written) => {
          tracing::debug!(
            url = %recorded.url,
            records = written.len(),
            revisit = recorded.is_revisit(),
            "written"
          );
          recorded.warc_records = written;
          return Ok(recorded);
        }
        Err(e) if attempt < self.settings.max_write_retries => {
          attempt += 1;
          tracing::warn!(url = %recorded.url, attempt, "write failed, retrying: {}", e);
          tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt.min(6))).await;
        }
        Err(e) => {
          tracing::error!(
            url = %recorded.url,
            method = %recorded.method,
            status = recorded.status.as_u16(),
            payload_digest = recorded.payload_digest(),
            prefix = recorded.warc_prefix(&self.settings.default_prefix),
            attempts = attempt + 1,
            "giving up on capture: {}",
            e
          );
          return Err(e);
        }
      }
    }
  }

  /// Serialize and write on the blocking pool, handing the capture back
  async fn write(&self, recorded: RecordedUrl) -> Result<(RecordedUrl, Result<Vec<WrittenRecord>>)> {
    let pool = self.pool.clone();
    let algorithm = self.settings.digest_algorithm;
    let with_request = self.settings.record_requests;
    let prefix = recorded.warc_prefix(&self.settings.default_prefix).to_string();
    tokio::task::spawn_blocking(move || {
      let mut recorded = recorded;
      let result = match records_for(&mut recorded, algorithm, with_request) {
        Ok(records) => pool.write_records(&prefix, records),
        Err(e) => Err(Error::warc_error(format!("cannot serialize capture: {}", e))),
      };
      (recorded, result)
    })
    .await
    .map_err(|e| Error::Other(format!("writer task failed: {}", e)))
  }
}
