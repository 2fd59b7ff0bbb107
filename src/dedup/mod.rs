//! Payload deduplication
//!
//! A [`DedupIndex`] maps a payload digest key to the capture that first stored
//! that payload. Workers look up every dedupable response before writing it and
//! store an entry after writing an original record. The backend is chosen once
//! from [`DedupConfig`]; the rest of the pipeline only sees the trait object.
#[cfg(feature = "cdx")]
mod cdx;
#[cfg(feature = "shared-dedup")]
mod shared;
mod sqlite;

#[cfg(feature = "cdx")]
pub use cdx::CdxServerDedup;
#[cfg(feature = "shared-dedup")]
pub use shared::SharedDedupStore;
pub use sqlite::LocalDedupDb;

use crate::config::{DedupBackend, DedupConfig, DedupScope};
use crate::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Bucket used when a request names none
pub const DEFAULT_BUCKET: &str = "__unspecified__";

/// Where a payload was first archived
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
  /// Key the entry is stored under
  pub digest_key: String,
  /// URL of the original capture
  pub url: String,
  /// `WARC-Date` of the original record
  pub date: String,
  /// `WARC-Record-ID` of the original record, unknown for CDX hits
  pub record_id: Option<String>,
}

/// Digest to original capture lookups
#[async_trait]
pub trait DedupIndex: Send + Sync {
  /// Backend name for logs
  fn name(&self) -> &'static str;
  /// Original capture for `key`, if any
  async fn lookup(&self, key: &str, url: &str) -> Result<Option<DedupEntry>>;
  /// Remember `entry` under `key`; storing the same key twice keeps the last
  async fn store(&self, key: &str, entry: &DedupEntry) -> Result<()>;
  /// Release resources
  async fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// Dedup turned off: every lookup misses
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDedup;

#[async_trait]
impl DedupIndex for NoDedup {
  fn name(&self) -> &'static str {
    "disabled"
  }
  async fn lookup(&self, _key: &str, _url: &str) -> Result<Option<DedupEntry>> {
    Ok(None)
  }
  async fn store(&self, _key: &str, _entry: &DedupEntry) -> Result<()> {
    Ok(())
  }
}

/// Key for `digest` under `scope`
///
/// Global scope keys by digest alone; bucket scope appends `|bucket`.
pub fn dedup_key(scope: DedupScope, digest: &str, bucket: Option<&str>) -> String {
  match scope {
    DedupScope::Global => digest.to_string(),
    DedupScope::Bucket => format!("{}|{}", digest, bucket.unwrap_or(DEFAULT_BUCKET)),
  }
}

/// The digest part of a key built by [`dedup_key`]
pub fn digest_of_key(key: &str) -> &str {
  key.split('|').next().unwrap_or(key)
}

/// Per-key locks shared by all writer workers
///
/// A worker holds the lock for a key from lookup until the original's entry
/// is stored, so concurrent captures of one payload yield a single original.
/// Entries are removed once no worker holds or waits on them.
#[derive(Debug, Default)]
pub struct DedupLocks {
  keys: DashMap<String, Arc<Mutex<()>>>,
}

impl DedupLocks {
  /// Empty lock table
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive use of `key`
  pub async fn lock(&self, key: &str) -> DedupKeyGuard<'_> {
    let mutex = self.keys.entry(key.to_string()).or_default().clone();
    let guard = mutex.lock_owned().await;
    DedupKeyGuard {
      locks: self,
      key: key.to_string(),
      guard: Some(guard),
    }
  }

  /// Keys currently held or waited on
  pub fn len(&self) -> usize {
    self.keys.len()
  }

  /// No key is held
  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }
}

/// Held key of a [`DedupLocks`] table
#[derive(Debug)]
pub struct DedupKeyGuard<'a> {
  locks: &'a DedupLocks,
  key: String,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DedupKeyGuard<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    // waiters hold a clone of the mutex, so a count of one means nobody else
    self
      .locks
      .keys
      .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
  }
}

/// Build the configured backend
pub fn build_dedup_index(config: &DedupConfig) -> Result<Arc<dyn DedupIndex>> {
  let index: Arc<dyn DedupIndex> = match &config.backend {
    DedupBackend::Disabled => Arc::new(NoDedup),
    DedupBackend::Local { path } => Arc::new(LocalDedupDb::open(path)?),
    #[cfg(feature = "shared-dedup")]
    DedupBackend::Shared { store, root } => Arc::new(SharedDedupStore::new(store, root)?),
    #[cfg(not(feature = "shared-dedup"))]
    DedupBackend::Shared { .. } => {
      return Err(crate::Error::config_error(
        "shared dedup requires the `shared-dedup` feature",
      ))
    }
    #[cfg(feature = "cdx")]
    DedupBackend::Cdx { url } => Arc::new(CdxServerDedup::new(url)?),
    #[cfg(not(feature = "cdx"))]
    DedupBackend::Cdx { .. } => {
      return Err(crate::Error::config_error("cdx dedup requires the `cdx` feature"))
    }
  };
  tracing::info!("dedup backend: {}", index.name());
  Ok(index)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys() {
    assert_eq!(dedup_key(DedupScope::Global, "sha1:AB", Some("x")), "sha1:AB");
    assert_eq!(dedup_key(DedupScope::Bucket, "sha1:AB", Some("x")), "sha1:AB|x");
    assert_eq!(
      dedup_key(DedupScope::Bucket, "sha1:AB", None),
      "sha1:AB|__unspecified__"
    );
    assert_eq!(digest_of_key("sha1:AB|x"), "sha1:AB");
    assert_eq!(digest_of_key("sha1:AB"), "sha1:AB");
  }

  #[tokio::test]
  async fn test_key_lock_is_exclusive_and_cleaned_up() {
    let locks = Arc::new(DedupLocks::new());
    let held = locks.lock("sha1:AB").await;
    let other = locks.clone();
    let waiter = tokio::spawn(async move {
      let _guard = other.lock("sha1:AB").await;
    });
    // a different key is not blocked
    drop(locks.lock("sha1:CD").await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    drop(held);
    waiter.await.unwrap();
    assert!(locks.is_empty());
  }

  #[tokio::test]
  async fn test_disabled_always_misses() {
    let config = DedupConfig {
      backend: DedupBackend::Disabled,
      ..Default::default()
    };
    let index = build_dedup_index(&config).unwrap();
    let entry = DedupEntry {
      digest_key: "k".to_string(),
      url: "http://a/".to_string(),
      date: "2024-01-01T00:00:00Z".to_string(),
      record_id: None,
    };
    index.store("k", &entry).await.unwrap();
    assert!(index.lookup("k", "http://a/").await.unwrap().is_none());
  }
}
