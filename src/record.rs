use crate::dedup::DedupEntry;
use crate::errors::{Error, Result};
use crate::recorder::CapturedMessage;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Why a capture is incomplete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truncation {
  /// Payload exceeded `max_resource_size`
  Length,
  /// Origin stopped sending before the response completed
  Time,
  /// Client went away mid-response
  Disconnect,
}

impl Truncation {
  /// Value of the `WARC-Truncated` header
  pub fn as_str(&self) -> &'static str {
    match self {
      Truncation::Length => "length",
      Truncation::Time => "time",
      Truncation::Disconnect => "disconnect",
    }
  }
}

impl fmt::Display for Truncation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Per-request metadata sent by the client in a JSON header
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestMeta {
  /// WARC filename prefix for this capture
  #[serde(rename = "warc-prefix")]
  pub warc_prefix: Option<String>,
  /// Stats buckets
  pub stats: Option<StatsMeta>,
  /// Dedup bucket when dedup is scoped per bucket
  #[serde(rename = "dedup-bucket")]
  pub dedup_bucket: Option<String>,
}

/// `stats` member of [`RequestMeta`]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatsMeta {
  /// Bucket names
  pub buckets: Vec<String>,
}

impl RequestMeta {
  /// Parse the header value
  pub fn parse(value: &[u8]) -> Result<Self> {
    serde_json::from_slice(value)
      .map_err(|e| Error::invalid_request(format!("bad metadata header: {}", e)))
  }
  /// Stats buckets named by the client
  pub fn stats_buckets(&self) -> &[String] {
    self.stats.as_ref().map(|s| s.buckets.as_slice()).unwrap_or(&[])
  }
}

/// Where a record landed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenRecord {
  /// `WARC-Type`
  pub record_type: String,
  /// `WARC-Record-ID`, including angle brackets
  pub record_id: String,
  /// Final filename (without the open suffix)
  pub warc_filename: String,
  /// Offset of the record (or its gzip member) in the file
  pub offset: u64,
  /// Bytes taken in the file
  pub length: u64,
}

/// One captured HTTP transaction
///
/// Built by the capture connection, then owned by whichever writer worker
/// dequeues it.
#[derive(Debug)]
pub struct RecordedUrl {
  /// Absolute URL
  pub url: String,
  /// Request method
  pub method: http::Method,
  /// Target host as requested by the client
  pub host: String,
  /// Target port
  pub port: u16,
  /// Client address
  pub client_ip: IpAddr,
  /// Address of the origin the proxy talked to
  pub remote_ip: Option<IpAddr>,
  /// When the request started
  pub timestamp: DateTime<Utc>,
  /// Request start to response end
  pub elapsed: Duration,
  /// Request as sent to the origin
  pub request: CapturedMessage,
  /// Response as received from the origin
  pub response: CapturedMessage,
  /// Response status
  pub status: http::StatusCode,
  /// Response content type without parameters
  pub mimetype: Option<String>,
  /// Why the capture is incomplete, if it is
  pub truncated: Option<Truncation>,
  /// Client-supplied metadata
  pub meta: RequestMeta,
  /// Original capture, when this one was written as a revisit
  pub dedup_info: Option<DedupEntry>,
  /// Records written for this capture
  pub warc_records: Vec<WrittenRecord>,
}

impl RecordedUrl {
  /// Raw request head
  pub fn request_header_bytes(&self) -> &[u8] {
    self.request.head()
  }
  /// Digest of the decoded request body
  pub fn request_body_digest(&self) -> &str {
    self.request.payload_digest()
  }
  /// Bytes sent to the origin
  pub fn request_size(&self) -> u64 {
    self.request.len()
  }
  /// Raw response head
  pub fn response_header_bytes(&self) -> &[u8] {
    self.response.head()
  }
  /// Digest of the decoded response body
  pub fn response_body_digest(&self) -> &str {
    self.response.payload_digest()
  }
  /// Alias of [`RecordedUrl::response_body_digest`], the dedup key digest
  pub fn payload_digest(&self) -> &str {
    self.response.payload_digest()
  }
  /// Bytes received from the origin
  pub fn response_size(&self) -> u64 {
    self.response.len()
  }
  /// Prefix this capture is written under
  pub fn warc_prefix<'a>(&'a self, default: &'a str) -> &'a str {
    self.meta.warc_prefix.as_deref().unwrap_or(default)
  }
  /// Whether the last write produced a revisit
  pub fn is_revisit(&self) -> bool {
    self.dedup_info.is_some()
  }
}

/// Content type essence of a response head, e.g. `text/html`
pub(crate) fn mimetype_of(headers: &http::HeaderMap) -> Option<String> {
  headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<mime::Mime>().ok())
    .map(|m| m.essence_str().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_meta_parse() {
    let meta = RequestMeta::parse(
      br#"{"warc-prefix":"job1","stats":{"buckets":["job1","all"]},"dedup-bucket":"b"}"#,
    )
    .unwrap();
    assert_eq!(meta.warc_prefix.as_deref(), Some("job1"));
    assert_eq!(meta.stats_buckets(), &["job1".to_string(), "all".to_string()]);
    assert_eq!(meta.dedup_bucket.as_deref(), Some("b"));
    assert!(RequestMeta::parse(b"{not json").is_err());
  }

  #[test]
  fn test_mimetype_of() {
    let mut headers = http::HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      http::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    assert_eq!(mimetype_of(&headers).as_deref(), Some("text/html"));
  }
}
