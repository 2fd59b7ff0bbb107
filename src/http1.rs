//! Minimal HTTP/1.x head parsing and body relaying
//!
//! Bodies are never buffered: every chunk read from one side is written to
//! the other side and mirrored into a [`Recorder`] in the same step.

use crate::errors::{Error, Result};
use crate::recorder::Recorder;
use crate::{CR_LF, SPACE};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted message head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest accepted chunk-size or trailer line
const MAX_LINE_SIZE: usize = 8 * 1024;

/// Parsed request line and headers
#[derive(Clone, Debug)]
pub struct RequestHead {
  /// Method
  pub method: Method,
  /// Request target as sent (absolute-form, origin-form or authority-form)
  pub target: String,
  /// Protocol version
  pub version: Version,
  /// Headers in arrival order
  pub headers: HeaderMap,
}

/// Parsed status line and headers
#[derive(Clone, Debug)]
pub struct ResponseHead {
  /// Protocol version
  pub version: Version,
  /// Status code
  pub status: StatusCode,
  /// Headers
  pub headers: HeaderMap,
}

/// How a message body is delimited
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body
  Empty,
  /// `Content-Length`
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Read until the connection closes
  UntilClose,
}

/// Why a body relay stopped early
#[derive(Debug)]
pub enum RelayError {
  /// Reading from the source failed or it closed early
  Source(io::Error),
  /// No data from the source within the read timeout
  Timeout,
  /// Writing to the sink failed
  Sink(io::Error),
  /// Mirroring into the recorder failed
  Recorder(io::Error),
  /// Payload reached the configured size limit
  Limit,
}

impl From<RelayError> for Error {
  fn from(value: RelayError) -> Self {
    match value {
      RelayError::Source(e) | RelayError::Sink(e) | RelayError::Recorder(e) => Error::IO(e),
      RelayError::Timeout => {
        crate::errors::new_io_error(io::ErrorKind::TimedOut, "relay read timed out")
      }
      RelayError::Limit => Error::Other("payload size limit reached".to_string()),
    }
  }
}

/// Read one message head, up to and including the blank line
///
/// Returns `None` when the peer closed the connection before sending
/// anything. Leading empty lines are skipped.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::with_capacity(1024);
  loop {
    let start = head.len();
    let n = (&mut *reader)
      .take((MAX_HEAD_SIZE - start + 1) as u64)
      .read_until(b'\n', &mut head)
      .await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(None);
      }
      return Err(Error::invalid_request("connection closed inside message head"));
    }
    if head.len() > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("message head too large"));
    }
    let line = &head[start..];
    if line == b"\r\n" || line == b"\n" {
      if start == 0 {
        // stray CRLF between messages
        head.clear();
        continue;
      }
      return Ok(Some(head));
    }
  }
}

fn parse_version(s: &[u8]) -> Result<Version> {
  match s {
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    _ => Err(Error::invalid_request(format!(
      "unsupported version: {}",
      String::from_utf8_lossy(s)
    ))),
  }
}

fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

/// Header values are kept as raw bytes; obs-text such as Latin-1 passes
/// through untouched.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  for line in lines {
    let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
      Error::invalid_request(format!(
        "malformed header line: {:?}",
        String::from_utf8_lossy(line)
      ))
    })?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);
    let name = HeaderName::from_bytes(name.trim_ascii()).map_err(|_| {
      Error::invalid_request(format!(
        "invalid header name: {:?}",
        String::from_utf8_lossy(name)
      ))
    })?;
    let value = HeaderValue::from_bytes(value.trim_ascii())
      .map_err(|_| Error::invalid_request(format!("invalid value for header {}", name)))?;
    headers.append(name, value);
  }
  Ok(headers)
}

/// Lines of a raw head without line endings, up to the blank line
fn head_lines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
  raw
    .split(|&b| b == b'\n')
    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
    .take_while(|line| !line.is_empty())
}

/// Parse a raw request head
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
  let mut lines = head_lines(raw);
  let request_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty request"))?;
  let request_line = std::str::from_utf8(request_line)
    .map_err(|_| Error::invalid_request("request line is not valid UTF-8"))?;
  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {:?}",
      request_line
    )));
  }
  let method = Method::from_bytes(parts[0].as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", parts[0])))?;
  Ok(RequestHead {
    method,
    target: parts[1].to_string(),
    version: parse_version(parts[2].as_bytes())?,
    headers: parse_headers(lines)?,
  })
}

/// Parse a raw response head
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
  let mut lines = head_lines(raw);
  let status_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty response"))?;
  // the reason phrase may carry any bytes and is never interpreted
  let mut parts = status_line.splitn(3, |&b| b == b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .and_then(|code| StatusCode::from_bytes(code).ok())
    .ok_or_else(|| {
      Error::invalid_request(format!(
        "invalid status line: {:?}",
        String::from_utf8_lossy(status_line)
      ))
    })?;
  Ok(ResponseHead {
    version,
    status,
    headers: parse_headers(lines)?,
  })
}

impl RequestHead {
  /// Serialize in origin-form for the upstream connection
  pub fn to_origin_form(&self, path: &str, host: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(self.method.as_str().as_bytes());
    buf.extend_from_slice(SPACE);
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(SPACE);
    buf.extend_from_slice(version_str(self.version).as_bytes());
    buf.extend_from_slice(CR_LF);
    if !self.headers.contains_key(HOST) {
      buf.extend_from_slice(b"host: ");
      buf.extend_from_slice(host.as_bytes());
      buf.extend_from_slice(CR_LF);
    }
    write_headers(&mut buf, &self.headers);
    buf.extend_from_slice(CR_LF);
    buf
  }

  /// Body framing of this request
  pub fn framing(&self) -> Result<BodyFraming> {
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(&self.headers)? {
      Some(0) | None => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
    }
  }

  /// Whether the client wants the connection kept open after this exchange
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

impl ResponseHead {
  /// Body framing of this response to `method`
  pub fn framing(&self, method: &Method) -> Result<BodyFraming> {
    if method == Method::HEAD
      || self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED
      || (method == Method::CONNECT && self.status.is_success())
    {
      return Ok(BodyFraming::Empty);
    }
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(&self.headers)? {
      Some(0) => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
      None => Ok(BodyFraming::UntilClose),
    }
  }

  /// Whether the origin allows another request on this connection
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(CONTENT_LENGTH) {
    let n = value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .ok_or_else(|| Error::invalid_request("invalid Content-Length"))?;
    if length.is_some_and(|l| l != n) {
      return Err(Error::invalid_request("conflicting Content-Length headers"));
    }
    length = Some(n);
  }
  Ok(length)
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let tokens: Vec<String> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|v| v.trim().to_ascii_lowercase())
    .collect();
  if tokens.iter().any(|t| t == "close") {
    return false;
  }
  version == Version::HTTP_11 || tokens.iter().any(|t| t == "keep-alive")
}

/// A small complete response generated by the proxy itself
pub fn error_response(status: StatusCode, message: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown"),
    message.len(),
    message
  )
  .into_bytes()
}

/// Copies a body from `src` to `dst`, mirroring it into `recorder`
pub struct BodyRelay<'a> {
  recorder: &'a mut Recorder,
  read_timeout: Option<Duration>,
  limit: Option<u64>,
}

impl<'a> BodyRelay<'a> {
  /// New relay; `limit` caps the decoded payload
  pub fn new(recorder: &'a mut Recorder, read_timeout: Option<Duration>, limit: Option<u64>) -> Self {
    Self {
      recorder,
      read_timeout,
      limit,
    }
  }

  /// Relay one body with the given framing
  pub async fn relay<R, W>(
    &mut self,
    src: &mut R,
    dst: &mut W,
    framing: BodyFraming,
  ) -> std::result::Result<(), RelayError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    match framing {
      BodyFraming::Empty => Ok(()),
      BodyFraming::Length(n) => self.copy(src, dst, Some(n)).await,
      BodyFraming::UntilClose => self.copy(src, dst, None).await,
      BodyFraming::Chunked => self.relay_chunked(src, dst).await,
    }?;
    dst.flush().await.map_err(RelayError::Sink)
  }

  async fn relay_chunked<R, W>(&mut self, src: &mut R, dst: &mut W) -> std::result::Result<(), RelayError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    loop {
      let line = self.framing_line(src, dst).await?;
      let size = std::str::from_utf8(&line)
        .ok()
        .map(|l| l.trim().split(';').next().unwrap_or_default().trim().to_string())
        .and_then(|hex| u64::from_str_radix(&hex, 16).ok())
        .ok_or_else(|| {
          RelayError::Source(io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
        })?;
      if size == 0 {
        // trailers up to the terminating blank line
        loop {
          let trailer = self.framing_line(src, dst).await?;
          if trailer.trim_ascii().is_empty() {
            return Ok(());
          }
        }
      }
      self.copy(src, dst, Some(size)).await?;
      let crlf = self.framing_line(src, dst).await?;
      if !crlf.trim_ascii().is_empty() {
        return Err(RelayError::Source(io::Error::new(
          io::ErrorKind::InvalidData,
          "missing CRLF after chunk",
        )));
      }
    }
  }

  /// Relay one framing line verbatim; it counts toward the block but not
  /// the payload
  async fn framing_line<R, W>(&mut self, src: &mut R, dst: &mut W) -> std::result::Result<Vec<u8>, RelayError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut line = Vec::new();
    let mut limited = (&mut *src).take(MAX_LINE_SIZE as u64);
    let read = limited.read_until(b'\n', &mut line);
    let n = self.timed(read).await?.map_err(RelayError::Source)?;
    if n == 0 || !line.ends_with(b"\n") {
      return Err(RelayError::Source(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      )));
    }
    self.recorder.record(&line).map_err(RelayError::Recorder)?;
    dst.write_all(&line).await.map_err(RelayError::Sink)?;
    Ok(line)
  }

  async fn copy<R, W>(
    &mut self,
    src: &mut R,
    dst: &mut W,
    mut remaining: Option<u64>,
  ) -> std::result::Result<(), RelayError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    while remaining != Some(0) {
      let buf = self.timed(src.fill_buf()).await?.map_err(RelayError::Source)?;
      if buf.is_empty() {
        return match remaining {
          None => Ok(()),
          Some(_) => Err(RelayError::Source(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before end of body",
          ))),
        };
      }
      let mut n = match remaining {
        Some(r) => buf.len().min(r as usize),
        None => buf.len(),
      };
      let mut over_limit = false;
      if let Some(limit) = self.limit {
        let room = limit.saturating_sub(self.recorder.payload_len());
        if n as u64 > room {
          n = room as usize;
          over_limit = true;
        }
      }
      let chunk = &buf[..n];
      self.recorder.record(chunk).map_err(RelayError::Recorder)?;
      self.recorder.payload(chunk);
      dst.write_all(chunk).await.map_err(RelayError::Sink)?;
      src.consume(n);
      if over_limit {
        return Err(RelayError::Limit);
      }
      if let Some(r) = remaining.as_mut() {
        *r -= n as u64;
      }
    }
    Ok(())
  }

  async fn timed<F, T>(&self, fut: F) -> std::result::Result<T, RelayError>
  where
    F: std::future::Future<Output = T>,
  {
    match self.read_timeout {
      None => Ok(fut.await),
      Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| RelayError::Timeout),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::digest::DigestAlgorithm;
  use tokio::io::BufReader;

  #[test]
  fn test_parse_request_head() {
    let head = parse_request_head(
      b"GET http://example.test/a?b=1 HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n",
    )
    .unwrap();
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "http://example.test/a?b=1");
    assert_eq!(head.headers.get(HOST).unwrap(), "example.test");
    assert_eq!(head.framing().unwrap(), BodyFraming::Empty);
    assert!(head.keep_alive());
    assert!(parse_request_head(b"GARBAGE\r\n\r\n").is_err());
  }

  #[test]
  fn test_response_framing() {
    let head = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
    assert_eq!(head.framing(&Method::GET).unwrap(), BodyFraming::Length(5));
    assert_eq!(head.framing(&Method::HEAD).unwrap(), BodyFraming::Empty);
    let head =
      parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n").unwrap();
    assert_eq!(head.framing(&Method::GET).unwrap(), BodyFraming::Chunked);
    let head = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
    assert_eq!(head.framing(&Method::GET).unwrap(), BodyFraming::UntilClose);
    assert!(!head.keep_alive());
  }

  #[test]
  fn test_non_utf8_header_bytes_are_kept() {
    let raw = b"HTTP/1.1 200 D\xe9j\xe0 vu\r\nX-Title: caf\xe9\r\nContent-Length: 0\r\n\r\n";
    let head = parse_response_head(raw).unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.headers.get("x-title").unwrap().as_bytes(), b"caf\xe9");
    assert_eq!(head.framing(&Method::GET).unwrap(), BodyFraming::Empty);
    let request = parse_request_head(b"GET / HTTP/1.1\r\nCookie: n=\xff\r\n\r\n").unwrap();
    assert_eq!(request.headers.get("cookie").unwrap().as_bytes(), b"n=\xff");
    // control bytes are still rejected
    assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nX-Bad: a\x00b\r\n\r\n").is_err());
  }

  #[tokio::test]
  async fn test_chunk_size_line_limit() {
    let mut wire = vec![b'1'; MAX_LINE_SIZE + 10];
    wire.extend_from_slice(b"\r\n");
    let mut src = BufReader::new(&wire[..]);
    let mut dst = Vec::new();
    let mut recorder = Recorder::new(DigestAlgorithm::Sha1, 1024);
    let result = BodyRelay::new(&mut recorder, None, None)
      .relay(&mut src, &mut dst, BodyFraming::Chunked)
      .await;
    assert!(matches!(result, Err(RelayError::Source(_))));
  }

  #[tokio::test]
  async fn test_read_head_skips_leading_crlf() {
    let mut reader = BufReader::new(&b"\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\nrest"[..]);
    let head = read_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(head, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec());
    let mut empty = BufReader::new(&b""[..]);
    assert!(read_head(&mut empty).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_chunked_relay_digests_payload_only() {
    let wire = b"5\r\nhel\r\n\r\n0\r\n\r\n";
    // "hel\r\n" is five payload bytes
    let mut src = BufReader::new(&wire[..]);
    let mut dst = Vec::new();
    let mut recorder = Recorder::new(DigestAlgorithm::Sha1, 1024);
    BodyRelay::new(&mut recorder, None, None)
      .relay(&mut src, &mut dst, BodyFraming::Chunked)
      .await
      .unwrap();
    assert_eq!(dst, wire.to_vec());
    let captured = recorder.finish().unwrap();
    assert_eq!(captured.len(), wire.len() as u64);
    assert_eq!(
      captured.payload_digest(),
      DigestAlgorithm::Sha1.digest(b"hel\r\n")
    );
  }

  #[tokio::test]
  async fn test_limit_stops_relay() {
    let mut src = BufReader::new(&b"0123456789"[..]);
    let mut dst = Vec::new();
    let mut recorder = Recorder::new(DigestAlgorithm::Sha1, 1024);
    let result = BodyRelay::new(&mut recorder, None, Some(4))
      .relay(&mut src, &mut dst, BodyFraming::Length(10))
      .await;
    assert!(matches!(result, Err(RelayError::Limit)));
    assert_eq!(dst, b"0123".to_vec());
    assert_eq!(recorder.payload_len(), 4);
  }

  #[tokio::test]
  async fn test_short_body_is_source_error() {
    let mut src = BufReader::new(&b"abc"[..]);
    let mut dst = Vec::new();
    let mut recorder = Recorder::new(DigestAlgorithm::Sha1, 1024);
    let result = BodyRelay::new(&mut recorder, None, None)
      .relay(&mut src, &mut dst, BodyFraming::Length(10))
      .await;
    assert!(matches!(result, Err(RelayError::Source(_))));
  }
}
