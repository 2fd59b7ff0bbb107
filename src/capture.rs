//! One client connection: proxy protocol, TLS interception and capture
//!
//! Plain requests arrive in absolute-form. `CONNECT host:port` is answered
//! with `200 Connection Established`, the tunnel is terminated with a leaf
//! certificate for `host`, and the requests inside it are handled like plain
//! ones. Every request/response pair is relayed without buffering and mirrored
//! into recorders; the finished capture is handed to the writer queue.

use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::digest::DigestAlgorithm;
use crate::errors::{Error, Result};
use crate::http1::{
  error_response, parse_request_head, parse_response_head, read_head, BodyFraming, BodyRelay,
  RelayError, RequestHead,
};
use crate::queue::TimestampedQueue;
use crate::record::{mimetype_of, RecordedUrl, RequestMeta, Truncation};
use crate::recorder::Recorder;
use crate::redirect::{parse_authority_with_default, Target};
use crate::socket::MaybeTlsStream;
use chrono::Utc;
use http::header::{EXPECT, PROXY_AUTHORIZATION};
use http::{HeaderName, Method, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Capture behavior shared by every connection
#[derive(Clone, Debug)]
pub struct CaptureSettings {
  /// Digest algorithm for block and payload digests
  pub digest_algorithm: DigestAlgorithm,
  /// Recorders move to a temporary file past this size
  pub spool_threshold: usize,
  /// Idle limit on client and origin reads
  pub read_timeout: Duration,
  /// Response payload cap
  pub max_resource_size: Option<u64>,
  /// Archive captures cut short by a disconnect or timeout
  pub capture_partial: bool,
  /// Request header carrying [`RequestMeta`]
  pub meta_header: HeaderName,
  /// Methods to archive, all when empty
  pub methods: Vec<Method>,
}

impl CaptureSettings {
  /// Settings from a validated config
  pub fn from_config(config: &ProxyConfig) -> Result<Self> {
    let meta_header = HeaderName::from_bytes(config.meta_header.as_bytes())
      .map_err(|_| Error::config_error(format!("invalid meta header {:?}", config.meta_header)))?;
    Ok(Self {
      digest_algorithm: config.digest_algorithm()?,
      spool_threshold: config.spool_threshold,
      read_timeout: config.read_timeout(),
      max_resource_size: config.max_resource_size,
      capture_partial: config.capture_partial,
      meta_header,
      methods: config.methods()?,
    })
  }

  fn archives(&self, method: &Method) -> bool {
    self.methods.is_empty() || self.methods.contains(method)
  }

  fn recorder(&self) -> Recorder {
    Recorder::new(self.digest_algorithm, self.spool_threshold)
  }
}

/// Shared state handed to every connection
pub struct CaptureContext {
  /// Mints leaf certificates for intercepted hosts
  pub ca: Arc<CertificateAuthority>,
  /// Opens origin connections
  pub connector: Arc<Connector>,
  /// Finished captures go here
  pub queue: Arc<TimestampedQueue<RecordedUrl>>,
  /// Capture behavior
  pub settings: CaptureSettings,
  /// Fires on shutdown; connections stop between requests
  pub stop: CancellationToken,
}

struct Origin {
  target: Target,
  tls: bool,
  stream: BufReader<MaybeTlsStream>,
}

/// Where one request goes
#[derive(Debug, PartialEq, Eq)]
struct Destination {
  target: Target,
  tls: bool,
  path: String,
  host_header: String,
  url: String,
}

/// State of one accepted client connection
pub struct CaptureConnection {
  ctx: Arc<CaptureContext>,
  client_ip: IpAddr,
  origin: Option<Origin>,
}

impl CaptureConnection {
  /// New connection from `client_ip`
  pub fn new(ctx: Arc<CaptureContext>, client_ip: IpAddr) -> Self {
    Self {
      ctx,
      client_ip,
      origin: None,
    }
  }

  /// Serve the connection until either side closes it
  pub async fn serve<S>(mut self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut client = BufReader::new(stream);
    let Some(head) = self.next_request(&mut client).await? else {
      return Ok(());
    };
    if head.method == Method::CONNECT {
      return self.serve_tunnel(client, head).await;
    }
    self.serve_requests(&mut client, None, Some(head)).await
  }

  async fn serve_tunnel<S>(mut self, mut client: BufReader<S>, head: RequestHead) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let target = match parse_authority_with_default(&head.target, 443) {
      Ok(target) => target,
      Err(e) => {
        reply(&mut client, StatusCode::BAD_REQUEST, &e.to_string()).await;
        return Err(e);
      }
    };
    if !client.buffer().is_empty() {
      reply(&mut client, StatusCode::BAD_REQUEST, "unexpected data after CONNECT").await;
      return Err(Error::invalid_request(format!(
        "client sent data before the tunnel to {} was established",
        target
      )));
    }
    let entry = match self.ctx.ca.get_leaf_cert(&target.host).await {
      Ok(entry) => entry,
      Err(e) => {
        reply(&mut client, StatusCode::BAD_GATEWAY, "certificate generation failed").await;
        return Err(e);
      }
    };
    let mut stream = client.into_inner();
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    let tls = TlsAcceptor::from(entry.server_config())
      .accept(stream)
      .await
      .map_err(|e| Error::tls_error(format!("client handshake for {} failed: {}", target, e)))?;
    tracing::trace!("intercepting tunnel to {}", target);
    let mut client = BufReader::new(tls);
    self.serve_requests(&mut client, Some(&target), None).await
  }

  async fn serve_requests<C>(
    &mut self,
    client: &mut C,
    tunnel: Option<&Target>,
    mut pending: Option<RequestHead>,
  ) -> Result<()>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    loop {
      let head = match pending.take() {
        Some(head) => head,
        None => match self.next_request(client).await? {
          Some(head) => head,
          None => break,
        },
      };
      if !self.exchange(client, tunnel, head).await? || self.ctx.stop.is_cancelled() {
        break;
      }
    }
    let _ = client.shutdown().await;
    Ok(())
  }

  /// Next request head, `None` on close, idle timeout or shutdown
  async fn next_request<C>(&self, client: &mut C) -> Result<Option<RequestHead>>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    let read = tokio::select! {
      _ = self.ctx.stop.cancelled() => return Ok(None),
      read = tokio::time::timeout(self.ctx.settings.read_timeout, read_head(client)) => read,
    };
    let raw = match read {
      Err(_) => return Ok(None),
      Ok(Ok(Some(raw))) => raw,
      Ok(Ok(None)) => return Ok(None),
      Ok(Err(e)) => {
        reply(client, StatusCode::BAD_REQUEST, &e.to_string()).await;
        return Err(e);
      }
    };
    match parse_request_head(&raw) {
      Ok(head) => Ok(Some(head)),
      Err(e) => {
        reply(client, StatusCode::BAD_REQUEST, &e.to_string()).await;
        Err(e)
      }
    }
  }

  /// Origin connection for `dest`, and whether it was reused
  async fn ensure_origin(&mut self, dest: &Destination) -> Result<(&mut Origin, bool)> {
    let reusable = self
      .origin
      .as_ref()
      .is_some_and(|o| o.target == dest.target && o.tls == dest.tls);
    if !reusable {
      self.origin = None;
      let stream = self.ctx.connector.connect(&dest.target, dest.tls).await?;
      self.origin = Some(Origin {
        target: dest.target.clone(),
        tls: dest.tls,
        stream: BufReader::new(stream),
      });
    }
    match self.origin.as_mut() {
      Some(origin) => Ok((origin, reusable)),
      None => Err(Error::connection_error(format!("no connection to {}", dest.target))),
    }
  }

  /// Relay and capture one request/response pair
  ///
  /// Returns whether the client connection can carry another request.
  async fn exchange<C>(
    &mut self,
    client: &mut C,
    tunnel: Option<&Target>,
    mut head: RequestHead,
  ) -> Result<bool>
  where
    C: AsyncBufRead + AsyncWrite + Unpin + Send,
  {
    let ctx = self.ctx.clone();
    let settings = &ctx.settings;
    let started = Instant::now();
    let timestamp = Utc::now();

    let dest = match destination(&head, tunnel) {
      Ok(dest) => dest,
      Err(e) => {
        reply(client, StatusCode::BAD_REQUEST, &e.to_string()).await;
        return Ok(false);
      }
    };
    let meta = match head.headers.remove(&settings.meta_header) {
      Some(value) => match RequestMeta::parse(value.as_bytes()) {
        Ok(meta) => meta,
        Err(e) => {
          reply(client, StatusCode::BAD_REQUEST, &e.to_string()).await;
          return Ok(false);
        }
      },
      None => RequestMeta::default(),
    };
    head.headers.remove("proxy-connection");
    head.headers.remove(PROXY_AUTHORIZATION);
    let expect_continue = head
      .headers
      .get(EXPECT)
      .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
    if expect_continue {
      head.headers.remove(EXPECT);
    }
    let request_framing = match head.framing() {
      Ok(framing) => framing,
      Err(e) => {
        reply(client, StatusCode::BAD_REQUEST, &e.to_string()).await;
        return Ok(false);
      }
    };
    let request_bytes = head.to_origin_form(&dest.path, &dest.host_header);

    // a reused origin connection may have been closed by the origin while
    // idle; bodiless requests are retried once on a fresh connection
    let mut attempt = 0;
    let (request_recorder, mut response_raw, remote_ip) = loop {
      attempt += 1;
      let (origin, reused) = match self.ensure_origin(&dest).await {
        Ok(found) => found,
        Err(e) => {
          reply(client, StatusCode::BAD_GATEWAY, &e.to_string()).await;
          return Ok(false);
        }
      };
      let remote_ip = origin.stream.get_ref().remote_ip();
      let mut recorder = settings.recorder();
      recorder.record_head(&request_bytes)?;
      if let Err(e) = origin.stream.write_all(&request_bytes).await {
        self.origin = None;
        if reused && attempt == 1 {
          continue;
        }
        reply(client, StatusCode::BAD_GATEWAY, &e.to_string()).await;
        return Ok(false);
      }
      if expect_continue && attempt == 1 && request_framing != BodyFraming::Empty {
        if client.write_all(CONTINUE).await.is_err() || client.flush().await.is_err() {
          self.origin = None;
          return Ok(false);
        }
      }
      let relay = BodyRelay::new(&mut recorder, Some(settings.read_timeout), None)
        .relay(client, &mut origin.stream, request_framing)
        .await;
      match relay {
        Ok(()) => {}
        Err(RelayError::Recorder(e)) => return Err(e.into()),
        Err(RelayError::Sink(e)) => {
          self.origin = None;
          reply(client, StatusCode::BAD_GATEWAY, &e.to_string()).await;
          return Ok(false);
        }
        Err(_) => {
          tracing::debug!(url = %dest.url, "client stopped sending the request body");
          self.origin = None;
          return Ok(false);
        }
      }
      let read = tokio::time::timeout(settings.read_timeout, read_head(&mut origin.stream)).await;
      match read {
        Ok(Ok(Some(raw))) => break (recorder, raw, remote_ip),
        _ if reused && attempt == 1 && request_framing == BodyFraming::Empty => {
          tracing::debug!(url = %dest.url, "stale origin connection, retrying");
          self.origin = None;
        }
        Err(_) => {
          self.origin = None;
          reply(client, StatusCode::GATEWAY_TIMEOUT, "origin did not answer").await;
          return Ok(false);
        }
        Ok(result) => {
          self.origin = None;
          let message = match result {
            Err(e) => e.to_string(),
            Ok(_) => "origin closed the connection".to_string(),
          };
          reply(client, StatusCode::BAD_GATEWAY, &message).await;
          return Ok(false);
        }
      }
    };

    let Some(origin) = self.origin.as_mut() else {
      return Err(Error::connection_error(format!("lost connection to {}", dest.target)));
    };
    // interim responses are forwarded but not archived
    let response_head = loop {
      let parsed = match parse_response_head(&response_raw) {
        Ok(parsed) => parsed,
        Err(e) => {
          self.origin = None;
          reply(client, StatusCode::BAD_GATEWAY, &e.to_string()).await;
          return Ok(false);
        }
      };
      if !parsed.status.is_informational() || parsed.status == StatusCode::SWITCHING_PROTOCOLS {
        break parsed;
      }
      if client.write_all(&response_raw).await.is_err() {
        self.origin = None;
        return Ok(false);
      }
      match tokio::time::timeout(settings.read_timeout, read_head(&mut origin.stream)).await {
        Ok(Ok(Some(raw))) => response_raw = raw,
        _ => {
          self.origin = None;
          reply(client, StatusCode::BAD_GATEWAY, "origin closed the connection").await;
          return Ok(false);
        }
      }
    };
    let response_framing = match response_head.framing(&head.method) {
      Ok(framing) => framing,
      Err(e) => {
        self.origin = None;
        reply(client, StatusCode::BAD_GATEWAY, &e.to_string()).await;
        return Ok(false);
      }
    };

    let mut response_recorder = settings.recorder();
    response_recorder.record_head(&response_raw)?;
    let truncated = if client.write_all(&response_raw).await.is_err() {
      Some(Truncation::Disconnect)
    } else {
      let relay = BodyRelay::new(
        &mut response_recorder,
        Some(settings.read_timeout),
        settings.max_resource_size,
      )
      .relay(&mut origin.stream, client, response_framing)
      .await;
      match relay {
        Ok(()) => None,
        Err(RelayError::Limit) => Some(Truncation::Length),
        Err(RelayError::Timeout) => Some(Truncation::Time),
        Err(RelayError::Source(_)) | Err(RelayError::Sink(_)) => Some(Truncation::Disconnect),
        Err(RelayError::Recorder(e)) => return Err(e.into()),
      }
    };

    let origin_reusable = truncated.is_none()
      && response_head.keep_alive()
      && response_framing != BodyFraming::UntilClose
      && response_head.status != StatusCode::SWITCHING_PROTOCOLS;
    if !origin_reusable {
      self.origin = None;
    }
    let keep_going = origin_reusable && head.keep_alive();

    let recorded = RecordedUrl {
      url: dest.url,
      method: head.method,
      host: dest.target.host,
      port: dest.target.port,
      client_ip: self.client_ip,
      remote_ip,
      timestamp,
      elapsed: started.elapsed(),
      request: request_recorder.finish()?,
      response: response_recorder.finish()?,
      status: response_head.status,
      mimetype: mimetype_of(&response_head.headers),
      truncated,
      meta,
      dedup_info: None,
      warc_records: Vec::new(),
    };
    tracing::debug!(
      url = %recorded.url,
      status = recorded.status.as_u16(),
      truncated = ?recorded.truncated,
      "captured"
    );
    if !settings.archives(&recorded.method) {
      tracing::trace!(url = %recorded.url, "method filtered, not archived");
    } else if matches!(truncated, None | Some(Truncation::Length)) || settings.capture_partial {
      if let Err(e) = ctx.queue.enqueue(recorded).await {
        tracing::warn!("capture dropped: {}", e);
        return Ok(false);
      }
    } else {
      tracing::debug!(url = %recorded.url, "partial capture not archived");
    }
    Ok(keep_going)
  }
}

/// Resolve the origin, path and archived URL of a request
fn destination(head: &RequestHead, tunnel: Option<&Target>) -> Result<Destination> {
  if let Some(target) = tunnel {
    let path = if head.target.starts_with('/') {
      head.target.clone()
    } else {
      let uri: http::Uri = head
        .target
        .parse()
        .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))?;
      match uri.path_and_query() {
        Some(p) if p.as_str().starts_with('/') => p.as_str().to_string(),
        _ => "/".to_string(),
      }
    };
    let authority = authority(target, 443);
    return Ok(Destination {
      target: target.clone(),
      tls: true,
      url: format!("https://{}{}", authority, path),
      host_header: authority,
      path,
    });
  }
  if head.target.starts_with('/') {
    return Err(Error::invalid_request(
      "origin-form request sent to a proxy",
    ));
  }
  let uri: http::Uri = head
    .target
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))?;
  let (scheme, tls, default_port) = match uri.scheme_str() {
    Some(s) if s.eq_ignore_ascii_case("http") => ("http", false, 80),
    Some(s) if s.eq_ignore_ascii_case("https") => ("https", true, 443),
    _ => {
      return Err(Error::invalid_request(format!(
        "unsupported request target {:?}",
        head.target
      )))
    }
  };
  let host = uri
    .host()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::invalid_request(format!("no host in {:?}", head.target)))?
    .trim_matches(['[', ']'])
    .to_ascii_lowercase();
  let target = Target::new(host, uri.port_u16().unwrap_or(default_port));
  let path = match uri.path_and_query() {
    Some(p) if p.as_str().starts_with('/') => p.as_str().to_string(),
    _ => "/".to_string(),
  };
  let authority = authority(&target, default_port);
  Ok(Destination {
    url: format!("{}://{}{}", scheme, authority, path),
    host_header: authority,
    target,
    tls,
    path,
  })
}

/// `host[:port]`, omitting the default port
fn authority(target: &Target, default_port: u16) -> String {
  let host = if target.host.contains(':') {
    format!("[{}]", target.host)
  } else {
    target.host.clone()
  };
  if target.port == default_port {
    host
  } else {
    format!("{}:{}", host, target.port)
  }
}

async fn reply<C>(client: &mut C, status: StatusCode, message: &str)
where
  C: AsyncWrite + Unpin,
{
  let _ = client.write_all(&error_response(status, message)).await;
  let _ = client.flush().await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ProxyConfig;
  use crate::connector::ConnectorBuilder;
  use crate::queue::Dequeued;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  fn head(raw: &str) -> RequestHead {
    parse_request_head(raw.as_bytes()).unwrap()
  }

  #[test]
  fn test_destination_absolute_form() {
    let dest = destination(&head("GET http://Example.test:8080/a?b HTTP/1.1\r\n\r\n"), None).unwrap();
    assert_eq!(dest.target, Target::new("example.test", 8080));
    assert!(!dest.tls);
    assert_eq!(dest.path, "/a?b");
    assert_eq!(dest.url, "http://example.test:8080/a?b");
    let dest = destination(&head("GET http://example.test HTTP/1.1\r\n\r\n"), None).unwrap();
    assert_eq!(dest.url, "http://example.test/");
    assert_eq!(dest.host_header, "example.test");
  }

  #[test]
  fn test_destination_in_tunnel() {
    let tunnel = Target::new("example.test", 443);
    let dest = destination(&head("GET /a HTTP/1.1\r\n\r\n"), Some(&tunnel)).unwrap();
    assert_eq!(dest.url, "https://example.test/a");
    assert!(dest.tls);
    let tunnel = Target::new("example.test", 8443);
    let dest = destination(&head("GET /a HTTP/1.1\r\n\r\n"), Some(&tunnel)).unwrap();
    assert_eq!(dest.url, "https://example.test:8443/a");
  }

  #[test]
  fn test_connect_host_is_lowercased() {
    let connect = head("CONNECT Example.TEST:443 HTTP/1.1\r\n\r\n");
    let tunnel = parse_authority_with_default(&connect.target, 443).unwrap();
    assert_eq!(tunnel.host, "example.test");
    let dest = destination(&head("GET /a HTTP/1.1\r\n\r\n"), Some(&tunnel)).unwrap();
    assert_eq!(dest.url, "https://example.test/a");
    assert_eq!(dest.host_header, "example.test");
  }

  #[test]
  fn test_origin_form_outside_tunnel_is_rejected() {
    assert!(destination(&head("GET /a HTTP/1.1\r\n\r\n"), None).is_err());
    assert!(destination(&head("GET ftp://example.test/ HTTP/1.1\r\n\r\n"), None).is_err());
  }

  async fn context(dir: &std::path::Path, config: &ProxyConfig) -> Arc<CaptureContext> {
    let ca = CertificateAuthority::new(dir.join("ca.pem"), dir.join("certs"))
      .await
      .unwrap();
    Arc::new(CaptureContext {
      ca: Arc::new(ca),
      connector: Arc::new(ConnectorBuilder::default().build().unwrap()),
      queue: Arc::new(TimestampedQueue::new(8)),
      settings: CaptureSettings::from_config(config).unwrap(),
      stop: CancellationToken::new(),
    })
  }

  /// Origin answering every request on one connection with `body`
  async fn origin(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut stream = BufReader::new(stream);
      while let Ok(Some(_)) = read_head(&mut stream).await {
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
          body.len(),
          body
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
          break;
        }
      }
    });
    port
  }

  #[tokio::test]
  async fn test_plain_request_is_captured() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig::default();
    let ctx = context(dir.path(), &config).await;
    let port = origin("hello").await;
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = CaptureConnection::new(ctx.clone(), "127.0.0.1".parse().unwrap());
    let task = tokio::spawn(conn.serve(server));

    let mut client = client;
    let request = format!(
      "GET http://127.0.0.1:{}/a HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nWarc-Meta: {{\"warc-prefix\":\"job\"}}\r\nConnection: close\r\n\r\n",
      port, port
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello"));
    task.await.unwrap().unwrap();

    let Dequeued::Item(queued) = ctx.queue.dequeue_timeout(Duration::from_secs(1)).await else {
      panic!("nothing captured");
    };
    let mut recorded = queued.item;
    assert_eq!(recorded.url, format!("http://127.0.0.1:{}/a", port));
    assert_eq!(recorded.status, StatusCode::OK);
    assert_eq!(recorded.mimetype.as_deref(), Some("text/plain"));
    assert_eq!(recorded.meta.warc_prefix.as_deref(), Some("job"));
    assert_eq!(recorded.truncated, None);
    assert_eq!(
      recorded.payload_digest(),
      DigestAlgorithm::Sha1.digest(b"hello")
    );
    let sent = String::from_utf8(recorded.request.to_vec().unwrap()).unwrap();
    assert!(sent.starts_with("GET /a HTTP/1.1\r\n"));
    assert!(!sent.to_ascii_lowercase().contains("warc-meta"));
  }

  #[tokio::test]
  async fn test_bad_meta_header_gets_400() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), &ProxyConfig::default()).await;
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let conn = CaptureConnection::new(ctx.clone(), "127.0.0.1".parse().unwrap());
    let task = tokio::spawn(conn.serve(server));
    client
      .write_all(b"GET http://127.0.0.1:9/ HTTP/1.1\r\nWarc-Meta: {nope\r\n\r\n")
      .await
      .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    task.await.unwrap().unwrap();
    assert!(ctx.queue.is_empty());
  }

  #[tokio::test]
  async fn test_unreachable_origin_gets_502() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), &ProxyConfig::default()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let conn = CaptureConnection::new(ctx.clone(), "127.0.0.1".parse().unwrap());
    let task = tokio::spawn(conn.serve(server));
    client
      .write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port).as_bytes())
      .await
      .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
    task.await.unwrap().unwrap();
    assert!(ctx.queue.is_empty());
  }

  #[tokio::test]
  async fn test_method_filter_relays_without_archiving() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
      method_filter: vec!["POST".to_string()],
      ..Default::default()
    };
    let ctx = context(dir.path(), &config).await;
    let port = origin("hi").await;
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let conn = CaptureConnection::new(ctx.clone(), "127.0.0.1".parse().unwrap());
    let task = tokio::spawn(conn.serve(server));
    client
      .write_all(
        format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nConnection: close\r\n\r\n", port).as_bytes(),
      )
      .await
      .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.ends_with("hi"));
    task.await.unwrap().unwrap();
    assert!(ctx.queue.is_empty());
  }
}
