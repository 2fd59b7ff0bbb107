use crate::digest::DigestAlgorithm;
use crate::record::RecordedUrl;
use crate::CR_LF;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::{self, Read, Write};
use uuid::Uuid;

/// Version line of every record
pub const WARC_VERSION: &str = "WARC/1.0";
/// Profile of revisit records written for identical payloads
pub const REVISIT_PROFILE: &str =
  "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest";
const HTTP_RESPONSE_TYPE: &str = "application/http; msgtype=response";
const HTTP_REQUEST_TYPE: &str = "application/http; msgtype=request";

/// `WARC-Type`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
  /// File level metadata
  Warcinfo,
  /// Full HTTP response
  Response,
  /// Full HTTP request
  Request,
  /// Response whose payload was already archived
  Revisit,
}

impl RecordType {
  /// Header value
  pub fn as_str(&self) -> &'static str {
    match self {
      RecordType::Warcinfo => "warcinfo",
      RecordType::Response => "response",
      RecordType::Request => "request",
      RecordType::Revisit => "revisit",
    }
  }
}

impl fmt::Display for RecordType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Record content
pub enum Block<'a> {
  /// In memory
  Bytes(Bytes),
  /// Streamed from a spool
  Stream {
    /// Source of the block
    reader: Box<dyn Read + Send + 'a>,
    /// Exact number of bytes the reader yields
    len: u64,
  },
}

impl Block<'_> {
  /// Block length
  pub fn len(&self) -> u64 {
    match self {
      Block::Bytes(b) => b.len() as u64,
      Block::Stream { len, .. } => *len,
    }
  }
  /// Whether the block is empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// One WARC record ready to be serialized
pub struct WarcRecord<'a> {
  record_type: RecordType,
  record_id: String,
  headers: Vec<(&'static str, String)>,
  block: Block<'a>,
}

impl<'a> WarcRecord<'a> {
  /// New record with a fresh id, dated `date`
  pub fn new(record_type: RecordType, date: DateTime<Utc>, block: Block<'a>) -> Self {
    let record_id = new_record_id();
    Self {
      record_type,
      headers: vec![
        ("WARC-Type", record_type.as_str().to_string()),
        ("WARC-Record-ID", record_id.clone()),
        ("WARC-Date", warc_date(&date)),
      ],
      record_id,
      block,
    }
  }

  /// Append a header
  pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
    self.headers.push((name, value.into()));
    self
  }

  /// `WARC-Type`
  pub fn record_type(&self) -> RecordType {
    self.record_type
  }

  /// `WARC-Record-ID`
  pub fn record_id(&self) -> &str {
    &self.record_id
  }

  /// Value of the first header called `name`
  pub fn get_header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Serialize, returning the number of bytes written
  pub fn write_to<W: Write>(self, w: &mut W) -> io::Result<u64> {
    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(WARC_VERSION.as_bytes());
    head.extend_from_slice(CR_LF);
    for (name, value) in &self.headers {
      head.extend_from_slice(name.as_bytes());
      head.extend_from_slice(b": ");
      head.extend_from_slice(value.as_bytes());
      head.extend_from_slice(CR_LF);
    }
    head.extend_from_slice(format!("Content-Length: {}", self.block.len()).as_bytes());
    head.extend_from_slice(CR_LF);
    head.extend_from_slice(CR_LF);
    w.write_all(&head)?;
    let block_len = match self.block {
      Block::Bytes(b) => {
        w.write_all(&b)?;
        b.len() as u64
      }
      Block::Stream { mut reader, len } => {
        let copied = io::copy(&mut reader, w)?;
        if copied != len {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("record block ended after {} of {} bytes", copied, len),
          ));
        }
        copied
      }
    };
    w.write_all(CR_LF)?;
    w.write_all(CR_LF)?;
    Ok(head.len() as u64 + block_len + 4)
  }
}

impl fmt::Debug for WarcRecord<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WarcRecord")
      .field("headers", &self.headers)
      .field("block_len", &self.block.len())
      .finish()
  }
}

/// `<urn:uuid:...>`
pub fn new_record_id() -> String {
  format!("<urn:uuid:{}>", Uuid::new_v4())
}

/// ISO 8601 UTC with second precision
pub fn warc_date(date: &DateTime<Utc>) -> String {
  date.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// The `warcinfo` record opening a file
pub fn warcinfo_record(filename: &str, hostname: &str) -> WarcRecord<'static> {
  let mut fields = String::new();
  fields.push_str(&format!(
    "software: {}/{}\r\n",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION")
  ));
  fields.push_str("format: WARC File Format 1.0\r\n");
  fields.push_str(
    "conformsTo: http://bibnum.bnf.fr/WARC/WARC_ISO_28500_version1_latestdraft.pdf\r\n",
  );
  fields.push_str(&format!("hostname: {}\r\n", hostname));
  WarcRecord::new(
    RecordType::Warcinfo,
    Utc::now(),
    Block::Bytes(Bytes::from(fields)),
  )
  .header("WARC-Filename", filename)
  .header("Content-Type", "application/warc-fields")
}

/// Records for one capture
///
/// A `response` record (plus a concurrent `request` record when
/// `with_request` is set), or a `revisit` record when the capture carries
/// dedup info.
pub fn records_for(
  recorded: &mut RecordedUrl,
  algorithm: DigestAlgorithm,
  with_request: bool,
) -> io::Result<Vec<WarcRecord<'_>>> {
  let RecordedUrl {
    url,
    timestamp,
    remote_ip,
    request,
    response,
    truncated,
    dedup_info,
    ..
  } = recorded;
  let mut records = Vec::with_capacity(2);
  let mut primary = match dedup_info.as_ref() {
    Some(original) => {
      let head = response.head().clone();
      let mut record = WarcRecord::new(RecordType::Revisit, *timestamp, Block::Bytes(head.clone()))
        .header("WARC-Target-URI", url.clone())
        .header("WARC-Profile", REVISIT_PROFILE);
      if let Some(id) = &original.record_id {
        record = record.header("WARC-Refers-To", id.clone());
      }
      record
        .header("WARC-Refers-To-Target-URI", original.url.clone())
        .header("WARC-Refers-To-Date", original.date.clone())
        .header("WARC-Truncated", "length")
        .header("Content-Type", HTTP_RESPONSE_TYPE)
        .header("WARC-Block-Digest", algorithm.digest(&head))
        .header("WARC-Payload-Digest", response.payload_digest().to_string())
    }
    None => {
      let block_digest = response.block_digest().to_string();
      let payload_digest = response.payload_digest().to_string();
      let len = response.len();
      let mut record = WarcRecord::new(
        RecordType::Response,
        *timestamp,
        Block::Stream {
          reader: Box::new(response.reader()?),
          len,
        },
      )
      .header("WARC-Target-URI", url.clone())
      .header("Content-Type", HTTP_RESPONSE_TYPE)
      .header("WARC-Block-Digest", block_digest)
      .header("WARC-Payload-Digest", payload_digest);
      if let Some(reason) = *truncated {
        record = record.header("WARC-Truncated", reason.as_str());
      }
      record
    }
  };
  if let Some(ip) = *remote_ip {
    primary = primary.header("WARC-IP-Address", ip.to_string());
  }
  let concurrent_to = primary.record_id().to_string();
  records.push(primary);
  if with_request {
    let block_digest = request.block_digest().to_string();
    let len = request.len();
    let mut record = WarcRecord::new(
      RecordType::Request,
      *timestamp,
      Block::Stream {
        reader: Box::new(request.reader()?),
        len,
      },
    )
    .header("WARC-Target-URI", url.clone())
    .header("WARC-Concurrent-To", concurrent_to)
    .header("Content-Type", HTTP_REQUEST_TYPE)
    .header("WARC-Block-Digest", block_digest);
    if let Some(ip) = *remote_ip {
      record = record.header("WARC-IP-Address", ip.to_string());
    }
    records.push(record);
  }
  Ok(records)
}
