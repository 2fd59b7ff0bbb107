//! Proxy configuration
//!
//! Everything the controller needs to wire the capture pipeline. A config is
//! usually built from [`ProxyConfig::default`] and a handful of overrides, or
//! loaded from a TOML file with [`ProxyConfig::from_toml_file`]. Call
//! [`ProxyConfig::validate`] before use; the controller does it for you.

use crate::digest::DigestAlgorithm;
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the per-request metadata header.
pub const DEFAULT_META_HEADER: &str = "Warc-Meta";

/// Configuration for the recording proxy
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address to listen on
  pub address: String,
  /// Port to listen on, `0` picks a free port
  pub port: u16,
  /// Maximum concurrent client connections
  pub max_connections: usize,
  /// Origin connect timeout in seconds
  pub connection_timeout: u64,
  /// Origin read timeout in seconds
  pub read_timeout: u64,
  /// How long in-flight connections may run after a stop signal, in seconds
  pub shutdown_grace: u64,
  /// Root CA file holding both certificate and private key as PEM
  pub cacert: PathBuf,
  /// Directory for generated leaf certificates
  pub certs_dir: PathBuf,
  /// WARC output settings
  pub warc: WarcConfig,
  /// Capacity of the capture queue
  pub queue_size: usize,
  /// Number of WARC writer workers, derived from `max_connections` when unset
  pub writer_threads: Option<usize>,
  /// Deduplication settings
  pub dedup: DedupConfig,
  /// Statistics settings
  pub stats: StatsConfig,
  /// Plugin names resolved through the plugin registry
  pub plugins: Vec<String>,
  /// Only archive these HTTP methods (all methods when empty)
  pub method_filter: Vec<String>,
  /// SOCKS5 proxy used for `.onion` hosts, e.g. `socks5h://127.0.0.1:9050`
  pub onion_proxy: Option<String>,
  /// Directory for Heritrix-style crawl logs
  pub crawl_log_dir: Option<PathBuf>,
  /// SQLite file for the playback index
  pub playback_index: Option<PathBuf>,
  /// Origin remapping, `"host:port" = "host:port"`
  pub host_redirects: HashMap<String, String>,
  /// Stop relaying a response payload beyond this many bytes
  pub max_resource_size: Option<u64>,
  /// Archive captures cut short by a client disconnect or origin timeout
  pub capture_partial: bool,
  /// Name of the JSON request header carrying per-request metadata
  pub meta_header: String,
  /// Captures larger than this are spooled to a temporary file
  pub spool_threshold: usize,
  /// Write attempts per capture before a worker gives up
  pub max_write_retries: u32,
  /// Verify origin certificates
  pub verify_origin_certs: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      address: "127.0.0.1".to_string(),
      port: 8000,
      max_connections: 1000,
      connection_timeout: 30,
      read_timeout: 60,
      shutdown_grace: 30,
      cacert: PathBuf::from("./slinger-warc-ca.pem"),
      certs_dir: PathBuf::from("./slinger-warc-ca"),
      warc: WarcConfig::default(),
      queue_size: 500,
      writer_threads: None,
      dedup: DedupConfig::default(),
      stats: StatsConfig::default(),
      plugins: Vec::new(),
      method_filter: Vec::new(),
      onion_proxy: None,
      crawl_log_dir: None,
      playback_index: None,
      host_redirects: HashMap::new(),
      max_resource_size: None,
      capture_partial: false,
      meta_header: DEFAULT_META_HEADER.to_string(),
      spool_threshold: 512 * 1024,
      max_write_retries: 3,
      verify_origin_certs: false,
    }
  }
}

/// WARC output settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WarcConfig {
  /// Output directory
  pub directory: PathBuf,
  /// Default filename prefix
  pub prefix: String,
  /// Write one gzip member per record
  pub gzip: bool,
  /// Roll over once a file reaches this many bytes
  pub rollover_size: u64,
  /// Roll over a file idle for this many seconds
  pub rollover_idle_time: Option<u64>,
  /// Suffix carried by files still being written, `None` to disable
  pub open_suffix: Option<String>,
  /// Filename template, see [`crate::warc::WarcFileName`]
  pub filename_template: String,
  /// Payload digest algorithm name (`sha1`, `sha256`)
  pub digest_algorithm: String,
  /// Start each file with a warcinfo record
  pub warcinfo: bool,
  /// Write a request record next to each response record
  pub record_requests: bool,
  /// Hostname used in filenames and warcinfo records
  pub hostname: Option<String>,
}

impl Default for WarcConfig {
  fn default() -> Self {
    Self {
      directory: PathBuf::from("./warcs"),
      prefix: "slinger".to_string(),
      gzip: false,
      rollover_size: 1_000_000_000,
      rollover_idle_time: None,
      open_suffix: Some(".open".to_string()),
      filename_template: "{prefix}-{timestamp17}-{serialno}-{hostname}".to_string(),
      digest_algorithm: "sha1".to_string(),
      warcinfo: true,
      record_requests: true,
      hostname: None,
    }
  }
}

impl WarcConfig {
  /// Hostname for filenames, falls back to `$HOSTNAME` then `localhost`
  pub fn hostname(&self) -> String {
    self
      .hostname
      .clone()
      .or_else(|| std::env::var("HOSTNAME").ok())
      .filter(|h| !h.is_empty())
      .unwrap_or_else(|| "localhost".to_string())
  }
  /// Idle rollover threshold
  pub fn rollover_idle(&self) -> Option<Duration> {
    self.rollover_idle_time.map(Duration::from_secs)
  }
}

/// Which dedup backend to use
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DedupBackend {
  /// Every capture is written as an original record
  Disabled,
  /// Embedded SQLite table
  Local {
    /// Database file
    path: PathBuf,
  },
  /// Key-value layout on a shared object store
  Shared {
    /// Store location
    store: SharedStore,
    /// Key prefix inside the store
    #[serde(default = "default_shared_root")]
    root: String,
  },
  /// Read-only lookups against a CDX server
  Cdx {
    /// CDX endpoint, e.g. `http://localhost:8080/web/cdx`
    url: String,
  },
}

fn default_shared_root() -> String {
  "dedup".to_string()
}

/// Object store behind the shared dedup backend
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "service", rename_all = "kebab-case")]
pub enum SharedStore {
  /// Shared filesystem, e.g. an NFS mount
  Fs {
    /// Root directory
    root: PathBuf,
  },
  /// In-process store, for tests
  Memory,
  /// S3-compatible bucket
  S3 {
    /// Bucket name
    bucket: String,
    /// Region
    region: String,
    /// Custom endpoint
    endpoint: Option<String>,
  },
}

/// Dedup key scope
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
  /// One entry per digest for the whole proxy
  #[default]
  Global,
  /// One entry per digest per dedup bucket
  Bucket,
}

/// Deduplication settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
  /// Backend
  pub backend: DedupBackend,
  /// Key scope
  pub scope: DedupScope,
  /// Payloads smaller than this are never deduplicated
  pub min_size: u64,
}

impl Default for DedupConfig {
  fn default() -> Self {
    Self {
      backend: DedupBackend::Local {
        path: PathBuf::from("./slinger-warc.sqlite"),
      },
      scope: DedupScope::Global,
      min_size: 0,
    }
  }
}

/// Which stats backend to use
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StatsBackend {
  /// No statistics
  Disabled,
  /// In-memory counters only
  Memory,
  /// In-memory counters persisted to SQLite
  Local {
    /// Database file
    path: PathBuf,
  },
}

/// Statistics settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
  /// Backend
  pub backend: StatsBackend,
  /// Seconds between persistence flushes
  pub flush_interval: u64,
}

impl Default for StatsConfig {
  fn default() -> Self {
    Self {
      backend: StatsBackend::Memory,
      flush_interval: 10,
    }
  }
}

impl ProxyConfig {
  /// Parse a TOML document
  pub fn from_toml_str(s: &str) -> Result<Self> {
    toml::from_str(s).map_err(|e| Error::config_error(format!("invalid config: {}", e)))
  }

  /// Load a TOML config file
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::config_error(format!("cannot read {}: {}", path.display(), e)))?;
    Self::from_toml_str(&text)
  }

  /// Check everything that can be checked before traffic is accepted
  pub fn validate(&self) -> Result<()> {
    self.digest_algorithm()?;
    self.methods()?;
    if self.queue_size == 0 {
      return Err(Error::config_error("queue_size must be at least 1"));
    }
    if self.max_connections == 0 {
      return Err(Error::config_error("max_connections must be at least 1"));
    }
    if self.writer_threads == Some(0) {
      return Err(Error::config_error("writer_threads must be at least 1"));
    }
    if self.warc.prefix.is_empty() {
      return Err(Error::config_error("warc prefix must not be empty"));
    }
    if !self.warc.filename_template.contains("{serialno}") {
      return Err(Error::config_error(
        "filename_template must contain {serialno}",
      ));
    }
    if self.meta_header.is_empty()
      || http::HeaderName::from_bytes(self.meta_header.as_bytes()).is_err()
    {
      return Err(Error::config_error(format!(
        "invalid meta header name: {:?}",
        self.meta_header
      )));
    }
    for (from, to) in &self.host_redirects {
      crate::redirect::parse_authority(from)?;
      crate::redirect::parse_authority(to)?;
    }
    if let Some(onion) = &self.onion_proxy {
      crate::socks5::Socks5Proxy::parse(onion)?;
    }
    Ok(())
  }

  /// Parsed digest algorithm
  pub fn digest_algorithm(&self) -> Result<DigestAlgorithm> {
    self.warc.digest_algorithm.parse()
  }

  /// Parsed method filter
  pub fn methods(&self) -> Result<Vec<http::Method>> {
    self
      .method_filter
      .iter()
      .map(|m| {
        http::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
          .map_err(|_| Error::config_error(format!("invalid method in filter: {}", m)))
      })
      .collect()
  }

  /// Worker count, derived as half the square root of the connection limit
  pub fn writer_threads(&self) -> usize {
    self
      .writer_threads
      .unwrap_or_else(|| (((self.max_connections as f64).sqrt() / 2.0).floor() as usize).max(1))
  }

  /// Origin connect timeout
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connection_timeout)
  }

  /// Origin read timeout
  pub fn read_timeout(&self) -> Duration {
    Duration::from_secs(self.read_timeout)
  }

  /// Grace period for in-flight connections at shutdown
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = ProxyConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.writer_threads(), 15);
  }

  #[test]
  fn test_from_toml() {
    let config = ProxyConfig::from_toml_str(
      r#"
port = 0
queue_size = 10
method_filter = ["get", "POST"]

[warc]
prefix = "crawl"
gzip = true
rollover_idle_time = 60

[dedup]
scope = "bucket"
backend = { kind = "cdx", url = "http://localhost:8080/cdx" }

[stats]
backend = { kind = "disabled" }

[host_redirects]
"example.test:443" = "127.0.0.1:8443"
"#,
    )
    .unwrap();
    assert_eq!(config.port, 0);
    assert_eq!(config.queue_size, 10);
    assert!(config.warc.gzip);
    assert_eq!(config.warc.prefix, "crawl");
    assert_eq!(config.warc.rollover_idle(), Some(Duration::from_secs(60)));
    assert_eq!(config.dedup.scope, DedupScope::Bucket);
    assert_eq!(
      config.dedup.backend,
      DedupBackend::Cdx {
        url: "http://localhost:8080/cdx".to_string()
      }
    );
    assert_eq!(config.stats.backend, StatsBackend::Disabled);
    assert_eq!(
      config.methods().unwrap(),
      vec![http::Method::GET, http::Method::POST]
    );
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_bad_digest_algorithm_is_rejected() {
    let mut config = ProxyConfig::default();
    config.warc.digest_algorithm = "md4".to_string();
    assert!(matches!(config.validate(), Err(Error::Config(_))));
  }

  #[test]
  fn test_zero_queue_is_rejected() {
    let config = ProxyConfig {
      queue_size: 0,
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }
}
