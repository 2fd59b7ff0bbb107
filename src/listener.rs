//! Post-write notification of archived captures

use crate::errors::Result;
use crate::record::{RecordedUrl, WrittenRecord};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Receives every capture after its records are written
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
  /// Name used in logs
  fn name(&self) -> &str;

  /// Called once per capture, in registration order
  async fn notify(&self, recorded: &RecordedUrl, records: &[WrittenRecord]) -> Result<()>;

  /// Flush and release resources at shutdown
  async fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// Listeners in registration order
///
/// A failing or panicking listener is logged and skipped; the rest still run.
#[derive(Clone, Default)]
pub struct ListenerChain {
  listeners: Vec<Arc<dyn Listener>>,
}

impl ListenerChain {
  /// Empty chain
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a listener
  pub fn add(&mut self, listener: Arc<dyn Listener>) {
    tracing::debug!("registered listener {}", listener.name());
    self.listeners.push(listener);
  }

  /// Registered listeners
  pub fn len(&self) -> usize {
    self.listeners.len()
  }

  /// No listeners registered
  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }

  /// Notify every listener, returning how many failed
  pub async fn notify(&self, recorded: &RecordedUrl) -> usize {
    let mut failures = 0;
    for listener in &self.listeners {
      let call = listener.notify(recorded, &recorded.warc_records);
      match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          failures += 1;
          tracing::warn!(listener = listener.name(), url = %recorded.url, "listener failed: {}", e);
        }
        Err(_) => {
          failures += 1;
          tracing::error!(listener = listener.name(), url = %recorded.url, "listener panicked");
        }
      }
    }
    failures
  }

  /// Close every listener, logging failures
  pub async fn close(&self) {
    for listener in &self.listeners {
      match AssertUnwindSafe(listener.close()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(listener = listener.name(), "close failed: {}", e),
        Err(_) => tracing::error!(listener = listener.name(), "listener panicked on close"),
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::digest::DigestAlgorithm;
  use crate::record::RequestMeta;
  use crate::recorder::Recorder;
  use parking_lot::Mutex;

  /// Capture of `GET url` answered with `body`
  pub(crate) fn recorded_url(url: &str, body: &[u8]) -> RecordedUrl {
    let mut request = Recorder::new(DigestAlgorithm::Sha1, 1024);
    request
      .record_head(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n")
      .unwrap();
    let mut response = Recorder::new(DigestAlgorithm::Sha1, 1024);
    let head = format!(
      "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
      body.len()
    );
    response.record_head(head.as_bytes()).unwrap();
    response.record(body).unwrap();
    response.payload(body);
    RecordedUrl {
      url: url.to_string(),
      method: http::Method::GET,
      host: "example.test".to_string(),
      port: 443,
      client_ip: "127.0.0.1".parse().unwrap(),
      remote_ip: Some("127.0.0.1".parse().unwrap()),
      timestamp: chrono::Utc::now(),
      elapsed: std::time::Duration::from_millis(5),
      request: request.finish().unwrap(),
      response: response.finish().unwrap(),
      status: http::StatusCode::OK,
      mimetype: Some("text/plain".to_string()),
      truncated: None,
      meta: RequestMeta::default(),
      dedup_info: None,
      warc_records: Vec::new(),
    }
  }

  struct Collect(Mutex<Vec<String>>, &'static str);

  #[async_trait::async_trait]
  impl Listener for Collect {
    fn name(&self) -> &str {
      self.1
    }
    async fn notify(&self, recorded: &RecordedUrl, _records: &[WrittenRecord]) -> Result<()> {
      self.0.lock().push(format!("{}:{}", self.1, recorded.url));
      Ok(())
    }
  }

  struct Failing;

  #[async_trait::async_trait]
  impl Listener for Failing {
    fn name(&self) -> &str {
      "failing"
    }
    async fn notify(&self, _recorded: &RecordedUrl, _records: &[WrittenRecord]) -> Result<()> {
      Err(crate::Error::Other("boom".to_string()))
    }
  }

  struct Panicking;

  #[async_trait::async_trait]
  impl Listener for Panicking {
    fn name(&self) -> &str {
      "panicking"
    }
    async fn notify(&self, _recorded: &RecordedUrl, _records: &[WrittenRecord]) -> Result<()> {
      panic!("listener bug")
    }
  }

  #[tokio::test]
  async fn test_errors_and_panics_are_isolated() {
    let first = Arc::new(Collect(Mutex::new(Vec::new()), "a"));
    let last = Arc::new(Collect(Mutex::new(Vec::new()), "b"));
    let mut chain = ListenerChain::new();
    chain.add(first.clone());
    chain.add(Arc::new(Failing));
    chain.add(Arc::new(Panicking));
    chain.add(last.clone());
    let recorded = recorded_url("https://example.test/a", b"hello");
    assert_eq!(chain.notify(&recorded).await, 2);
    assert_eq!(*first.0.lock(), vec!["a:https://example.test/a".to_string()]);
    assert_eq!(*last.0.lock(), vec!["b:https://example.test/a".to_string()]);
  }
}
