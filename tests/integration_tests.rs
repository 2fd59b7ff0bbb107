//! Integration tests for slinger-warc

use slinger_warc::ca::CertificateAuthority;
use slinger_warc::config::{DedupBackend, StatsBackend};
use slinger_warc::digest::DigestAlgorithm;
use slinger_warc::http1::read_head;
use slinger_warc::stats::ALL_BUCKET;
use slinger_warc::{Controller, ProxyConfig, RunningProxy};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{self, pki_types::CertificateDer, pki_types::PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS origin for `example.test` answering every request with `hello`
async fn tls_origin() -> u16 {
  let key = rcgen::KeyPair::generate().unwrap();
  let cert = rcgen::CertificateParams::new(vec!["example.test".to_string()])
    .unwrap()
    .self_signed(&key)
    .unwrap();
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
      vec![cert.der().clone()],
      PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
    )
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(stream) = acceptor.accept(stream).await else {
          return;
        };
        let mut stream = BufReader::new(stream);
        while let Ok(Some(_)) = read_head(&mut stream).await {
          let response =
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
          if stream.write_all(response.as_bytes()).await.is_err() || stream.flush().await.is_err() {
            break;
          }
        }
        let _ = stream.shutdown().await;
      });
    }
  });
  port
}

fn config(dir: &Path, origin_port: u16) -> ProxyConfig {
  let mut config = ProxyConfig {
    port: 0,
    cacert: dir.join("ca.pem"),
    certs_dir: dir.join("certs"),
    writer_threads: Some(1),
    read_timeout: 10,
    shutdown_grace: 5,
    ..Default::default()
  };
  config.warc.directory = dir.join("warcs");
  config.warc.prefix = "test".to_string();
  config.dedup.backend = DedupBackend::Local {
    path: dir.join("dedup.sqlite"),
  };
  config.stats.backend = StatsBackend::Memory;
  config.playback_index = Some(dir.join("playback.sqlite"));
  config.crawl_log_dir = Some(dir.join("logs"));
  config.host_redirects.insert(
    "example.test:443".to_string(),
    format!("127.0.0.1:{}", origin_port),
  );
  config
}

/// GET `https://example.test{path}` through the proxy; returns the body and
/// the leaf certificate the proxy presented
async fn fetch(proxy: &RunningProxy, path: &str) -> (String, CertificateDer<'static>) {
  let mut stream = BufReader::new(TcpStream::connect(proxy.local_addr()).await.unwrap());
  stream
    .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await.unwrap().unwrap();
  assert!(head.starts_with(b"HTTP/1.1 200"));

  let mut roots = rustls::RootCertStore::empty();
  roots.add(proxy.ca().ca_cert_der().clone()).unwrap();
  let config = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let mut tls = connector
    .connect("example.test".try_into().unwrap(), stream.into_inner())
    .await
    .unwrap();
  let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone().into_owned();
  let request = format!(
    "GET {} HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
    path
  );
  tls.write_all(request.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  let _ = tls.read_to_end(&mut response).await;
  (String::from_utf8(response).unwrap(), leaf)
}

async fn wait_for_captures(proxy: &RunningProxy, count: u64) {
  let stats = proxy.stats().unwrap().clone();
  tokio::time::timeout(Duration::from_secs(10), async move {
    loop {
      if stats.value(ALL_BUCKET).map(|s| s.total.urls) == Some(count) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await
  .expect("captures were not written in time");
}

fn warc_files(dir: &Path) -> Vec<PathBuf> {
  let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
    .unwrap()
    .map(|e| e.unwrap().path())
    .collect();
  files.sort();
  files
}

struct Record {
  headers: HashMap<String, String>,
  block: Vec<u8>,
}

impl Record {
  fn header(&self, name: &str) -> &str {
    self.headers.get(name).map(String::as_str).unwrap_or_default()
  }
}

fn read_records(path: &Path) -> Vec<Record> {
  let data = std::fs::read(path).unwrap();
  let mut records = Vec::new();
  let mut pos = 0;
  while pos < data.len() {
    let end = pos
      + data[pos..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap();
    let head = std::str::from_utf8(&data[pos..end]).unwrap();
    let mut lines = head.split("\r\n");
    assert_eq!(lines.next(), Some("WARC/1.0"));
    let headers: HashMap<String, String> = lines
      .map(|line| {
        let (name, value) = line.split_once(": ").unwrap();
        (name.to_string(), value.to_string())
      })
      .collect();
    let len: usize = headers["Content-Length"].parse().unwrap();
    let block = data[end + 4..end + 4 + len].to_vec();
    assert_eq!(&data[end + 4 + len..end + 8 + len], b"\r\n\r\n");
    pos = end + 8 + len;
    records.push(Record { headers, block });
  }
  records
}

#[tokio::test]
async fn test_https_capture_and_revisit() {
  let dir = tempfile::tempdir().unwrap();
  let origin_port = tls_origin().await;
  let proxy = Controller::new(config(dir.path(), origin_port))
    .await
    .unwrap()
    .start()
    .await
    .unwrap();

  let (first, first_leaf) = fetch(&proxy, "/a").await;
  assert!(first.starts_with("HTTP/1.1 200 OK"));
  assert!(first.ends_with("hello"));
  wait_for_captures(&proxy, 1).await;
  let (second, second_leaf) = fetch(&proxy, "/a").await;
  assert!(second.ends_with("hello"));
  wait_for_captures(&proxy, 2).await;
  assert_eq!(first_leaf, second_leaf);

  // the file stays under its open name while the proxy runs
  let open = warc_files(&dir.path().join("warcs"));
  assert_eq!(open.len(), 1);
  assert!(open[0].to_string_lossy().ends_with(".warc.open"));

  let stats = proxy.stats().unwrap().value(ALL_BUCKET).unwrap();
  assert_eq!(stats.new.urls, 1);
  assert_eq!(stats.revisit.urls, 1);
  proxy.shutdown().await.unwrap();

  let files = warc_files(&dir.path().join("warcs"));
  assert_eq!(files.len(), 1);
  assert!(files[0].to_string_lossy().ends_with(".warc"));
  let records = read_records(&files[0]);
  let types: Vec<&str> = records.iter().map(|r| r.header("WARC-Type")).collect();
  assert_eq!(types, vec!["warcinfo", "response", "request", "revisit", "request"]);

  let response = &records[1];
  assert_eq!(response.header("WARC-Target-URI"), "https://example.test/a");
  assert_eq!(
    response.header("Content-Length"),
    response.block.len().to_string()
  );
  assert!(response.block.starts_with(b"HTTP/1.1 200 OK\r\n"));
  assert!(response.block.ends_with(b"\r\n\r\nhello"));
  assert_eq!(
    response.header("WARC-Payload-Digest"),
    DigestAlgorithm::Sha1.digest(b"hello")
  );
  assert_eq!(response.header("WARC-IP-Address"), "127.0.0.1");
  assert_eq!(
    records[2].header("WARC-Concurrent-To"),
    response.header("WARC-Record-ID")
  );

  let revisit = &records[3];
  assert_eq!(revisit.header("WARC-Target-URI"), "https://example.test/a");
  assert_eq!(revisit.header("WARC-Refers-To"), response.header("WARC-Record-ID"));
  assert_eq!(revisit.header("WARC-Refers-To-Target-URI"), "https://example.test/a");
  assert_eq!(
    revisit.header("WARC-Profile"),
    "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest"
  );
  assert_eq!(revisit.header("WARC-Truncated"), "length");
  assert!(revisit.block.ends_with(b"\r\n\r\n"));

  let index = slinger_warc::playback::PlaybackIndex::open(&dir.path().join("playback.sqlite")).unwrap();
  let latest = index.lookup_latest("https://example.test/a").unwrap().unwrap();
  assert_eq!(latest.record_id, revisit.header("WARC-Record-ID"));

  let log = std::fs::read_to_string(dir.path().join("logs").join("test.log")).unwrap();
  assert_eq!(log.lines().count(), 2);
  assert!(log.lines().nth(1).unwrap().contains("duplicate:digest"));
}

#[tokio::test]
async fn test_dedup_backend_down_writes_originals() {
  let dir = tempfile::tempdir().unwrap();
  let origin_port = tls_origin().await;
  let unreachable = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let cdx_port = unreachable.local_addr().unwrap().port();
  drop(unreachable);
  let mut config = config(dir.path(), origin_port);
  config.dedup.backend = DedupBackend::Cdx {
    url: format!("http://127.0.0.1:{}/cdx", cdx_port),
  };
  let proxy = Controller::new(config).await.unwrap().start().await.unwrap();
  fetch(&proxy, "/a").await;
  fetch(&proxy, "/a").await;
  wait_for_captures(&proxy, 2).await;
  let stats = proxy.stats().unwrap().value(ALL_BUCKET).unwrap();
  assert_eq!(stats.new.urls, 2);
  assert_eq!(stats.revisit.urls, 0);
  proxy.shutdown().await.unwrap();

  let files = warc_files(&dir.path().join("warcs"));
  let responses = read_records(&files[0])
    .iter()
    .filter(|r| r.header("WARC-Type") == "response")
    .count();
  assert_eq!(responses, 2);
}

#[tokio::test]
async fn test_idle_rollover_finalizes_file() {
  let dir = tempfile::tempdir().unwrap();
  let origin_port = tls_origin().await;
  let mut config = config(dir.path(), origin_port);
  config.warc.rollover_idle_time = Some(1);
  config.warc.gzip = true;
  let proxy = Controller::new(config).await.unwrap().start().await.unwrap();
  fetch(&proxy, "/a").await;
  wait_for_captures(&proxy, 1).await;

  let warcs = dir.path().join("warcs");
  tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      let files = warc_files(&warcs);
      if files.len() == 1 && files[0].to_string_lossy().ends_with(".warc.gz") {
        break;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
  })
  .await
  .expect("idle file was not finalized");
  proxy.shutdown().await.unwrap();
  assert_eq!(warc_files(&warcs).len(), 1);
}

#[tokio::test]
async fn test_plain_http_with_meta_prefix() {
  let dir = tempfile::tempdir().unwrap();
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_port = origin.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = origin.accept().await {
      tokio::spawn(async move {
        let mut stream = BufReader::new(stream);
        while let Ok(Some(_)) = read_head(&mut stream).await {
          let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope";
          if stream.write_all(response.as_bytes()).await.is_err() {
            break;
          }
        }
      });
    }
  });
  let proxy = Controller::new(config(dir.path(), 1))
    .await
    .unwrap()
    .start()
    .await
    .unwrap();
  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/missing HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nWarc-Meta: {{\"warc-prefix\":\"job\",\"stats\":{{\"buckets\":[\"job\"]}}}}\r\nConnection: close\r\n\r\n",
    origin_port, origin_port
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut response = String::new();
  client.read_to_string(&mut response).await.unwrap();
  assert!(response.starts_with("HTTP/1.1 404 Not Found"));
  wait_for_captures(&proxy, 1).await;
  assert_eq!(
    proxy.stats().unwrap().value("job").unwrap().total.urls,
    1
  );
  proxy.shutdown().await.unwrap();

  let files = warc_files(&dir.path().join("warcs"));
  assert_eq!(files.len(), 1);
  let name = files[0].file_name().unwrap().to_string_lossy().to_string();
  assert!(name.starts_with("job-"), "{}", name);
  let records = read_records(&files[0]);
  assert_eq!(
    records[1].header("WARC-Target-URI"),
    format!("http://127.0.0.1:{}/missing", origin_port)
  );
  let request = String::from_utf8_lossy(&records[2].block).to_string();
  assert!(request.starts_with("GET /missing HTTP/1.1\r\n"));
  assert!(!request.contains("Warc-Meta"));
}

#[tokio::test]
async fn test_leaf_certificate_is_reused() {
  let dir = tempfile::tempdir().unwrap();
  let ca = CertificateAuthority::new(dir.path().join("ca.pem"), dir.path().join("certs"))
    .await
    .unwrap();
  let (first, second) = tokio::join!(
    ca.get_leaf_cert("example.test"),
    ca.get_leaf_cert("Example.Test")
  );
  let (first, second) = (first.unwrap(), second.unwrap());
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(first.cert_chain.len(), 2);

  // a fresh authority over the same directory loads the stored leaf
  let reloaded = CertificateAuthority::new(dir.path().join("ca.pem"), dir.path().join("certs"))
    .await
    .unwrap();
  let third = reloaded.get_leaf_cert("example.test").await.unwrap();
  assert_eq!(first.cert_chain[0], third.cert_chain[0]);
}
