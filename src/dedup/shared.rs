use super::{DedupEntry, DedupIndex};
use crate::config::SharedStore;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use opendal::{services, Operator};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

/// Dedup entries as JSON objects on a store shared by several proxies
///
/// Layout: `{root}/{percent-encoded key}.json`. Concurrent writers of the same
/// key overwrite each other with equivalent entries.
#[derive(Clone, Debug)]
pub struct SharedDedupStore {
  operator: Operator,
  root: String,
}

impl SharedDedupStore {
  /// Connect to the configured store
  pub fn new(store: &SharedStore, root: &str) -> Result<Self> {
    let operator = match store {
      SharedStore::Fs { root } => {
        let builder = services::Fs::default().root(&root.to_string_lossy());
        Operator::new(builder)?.finish()
      }
      SharedStore::Memory => Operator::new(services::Memory::default())?.finish(),
      #[cfg(feature = "s3")]
      SharedStore::S3 {
        bucket,
        region,
        endpoint,
      } => {
        let mut builder = services::S3::default().bucket(bucket).region(region);
        if let Some(endpoint) = endpoint {
          builder = builder.endpoint(endpoint);
        }
        Operator::new(builder)?.finish()
      }
      #[cfg(not(feature = "s3"))]
      SharedStore::S3 { .. } => {
        return Err(Error::config_error(
          "S3 dedup store requires the `s3` feature",
        ))
      }
    };
    Ok(Self {
      operator,
      root: root.trim_matches('/').to_string(),
    })
  }

  fn path(&self, key: &str) -> String {
    let name = utf8_percent_encode(key, NON_ALPHANUMERIC);
    if self.root.is_empty() {
      format!("{}.json", name)
    } else {
      format!("{}/{}.json", self.root, name)
    }
  }
}

#[async_trait]
impl DedupIndex for SharedDedupStore {
  fn name(&self) -> &'static str {
    "shared"
  }

  async fn lookup(&self, key: &str, _url: &str) -> Result<Option<DedupEntry>> {
    match self.operator.read(&self.path(key)).await {
      Ok(buffer) => Ok(Some(serde_json::from_slice(&buffer.to_vec())?)),
      Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(Error::dedup_error(format!("shared store read failed: {}", e))),
    }
  }

  async fn store(&self, key: &str, entry: &DedupEntry) -> Result<()> {
    let body = serde_json::to_vec(entry)?;
    self.operator.write(&self.path(key), body).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry() -> DedupEntry {
    DedupEntry {
      digest_key: "sha1:AB|job/1".to_string(),
      url: "http://a/".to_string(),
      date: "2024-01-01T00:00:00Z".to_string(),
      record_id: Some("<urn:uuid:1>".to_string()),
    }
  }

  #[tokio::test]
  async fn test_memory_store() {
    let store = SharedDedupStore::new(&SharedStore::Memory, "dedup").unwrap();
    assert!(store.lookup("sha1:AB|job/1", "").await.unwrap().is_none());
    store.store("sha1:AB|job/1", &entry()).await.unwrap();
    assert_eq!(store.lookup("sha1:AB|job/1", "").await.unwrap(), Some(entry()));
  }

  #[tokio::test]
  async fn test_fs_store_is_visible_to_a_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedStore::Fs {
      root: dir.path().to_path_buf(),
    };
    let a = SharedDedupStore::new(&shared, "dedup").unwrap();
    let b = SharedDedupStore::new(&shared, "dedup").unwrap();
    a.store("sha1:AB|job/1", &entry()).await.unwrap();
    assert_eq!(b.lookup("sha1:AB|job/1", "").await.unwrap(), Some(entry()));
    assert!(dir
      .path()
      .join("dedup")
      .join("sha1%3AAB%7Cjob%2F1.json")
      .exists());
  }
}
