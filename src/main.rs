use anyhow::Context;
use clap::{ArgGroup, Parser};
use slinger_warc::config::{DedupBackend, SharedStore, StatsBackend};
use slinger_warc::{Controller, ProxyConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// MITM recording proxy archiving HTTP and HTTPS traffic as WARC files
#[derive(Parser, Debug)]
#[command(name = "slinger-warc", version, about)]
#[command(group(ArgGroup::new("dedup").multiple(false)))]
struct Args {
  /// TOML configuration file; flags override its values
  #[arg(short, long)]
  config: Option<PathBuf>,
  /// Address to listen on
  #[arg(short = 'b', long)]
  address: Option<String>,
  /// Port to listen on
  #[arg(short, long)]
  port: Option<u16>,
  /// Directory for WARC files
  #[arg(short = 'd', long = "dir")]
  directory: Option<PathBuf>,
  /// WARC filename prefix
  #[arg(short = 'n', long)]
  prefix: Option<String>,
  /// Write gzip compressed WARC files
  #[arg(short = 'z', long)]
  gzip: bool,
  /// Roll over to a new file past this many bytes
  #[arg(short = 's', long)]
  size: Option<u64>,
  /// Roll over files idle for this many seconds
  #[arg(long)]
  rollover_idle_time: Option<u64>,
  /// Digest algorithm, sha1 or sha256
  #[arg(short = 'g', long)]
  digest_algorithm: Option<String>,
  /// Local SQLite dedup database
  #[arg(long, group = "dedup")]
  dedup_db_file: Option<PathBuf>,
  /// Dedup table on a shared directory
  #[arg(long, group = "dedup")]
  shared_dedup_dir: Option<PathBuf>,
  /// CDX server to look up previous captures, read-only
  #[arg(long, group = "dedup")]
  cdx_dedup_server_url: Option<String>,
  /// Write every capture as an original record
  #[arg(long, group = "dedup")]
  no_dedup: bool,
  /// Stats SQLite database
  #[arg(long)]
  stats_db_file: Option<PathBuf>,
  /// Do not keep statistics
  #[arg(long, conflicts_with = "stats_db_file")]
  no_stats: bool,
  /// Captures waiting to be written before clients are slowed down
  #[arg(short, long)]
  queue_size: Option<usize>,
  /// Writer workers
  #[arg(long)]
  writer_threads: Option<usize>,
  /// Maximum concurrent client connections
  #[arg(long)]
  max_connections: Option<usize>,
  /// Listener plugin to load, repeatable
  #[arg(long = "plugin")]
  plugins: Vec<String>,
  /// Only archive these methods, repeatable
  #[arg(long = "method-filter")]
  method_filter: Vec<String>,
  /// SOCKS5 proxy for .onion hosts, e.g. socks5h://127.0.0.1:9050
  #[arg(long)]
  onion_tor_socks_proxy: Option<String>,
  /// Directory for crawl logs
  #[arg(long)]
  crawl_log_dir: Option<PathBuf>,
  /// CA certificate and key file, created when missing
  #[arg(long)]
  cacert: Option<PathBuf>,
  /// Directory for generated leaf certificates
  #[arg(long)]
  certs_dir: Option<PathBuf>,
  /// Playback index SQLite database
  #[arg(long)]
  playback_index_db_file: Option<PathBuf>,
  /// Connect to TO instead of FROM, as FROM=TO with host:port on both sides
  #[arg(long = "host-redirect", value_name = "FROM=TO")]
  host_redirects: Vec<String>,
}

impl Args {
  fn into_config(self) -> anyhow::Result<ProxyConfig> {
    let mut config = match &self.config {
      Some(path) => ProxyConfig::from_toml_file(path)
        .with_context(|| format!("cannot load {}", path.display()))?,
      None => ProxyConfig::default(),
    };
    if let Some(address) = self.address {
      config.address = address;
    }
    if let Some(port) = self.port {
      config.port = port;
    }
    if let Some(directory) = self.directory {
      config.warc.directory = directory;
    }
    if let Some(prefix) = self.prefix {
      config.warc.prefix = prefix;
    }
    if self.gzip {
      config.warc.gzip = true;
    }
    if let Some(size) = self.size {
      config.warc.rollover_size = size;
    }
    if self.rollover_idle_time.is_some() {
      config.warc.rollover_idle_time = self.rollover_idle_time;
    }
    if let Some(algorithm) = self.digest_algorithm {
      config.warc.digest_algorithm = algorithm;
    }
    if let Some(path) = self.dedup_db_file {
      config.dedup.backend = DedupBackend::Local { path };
    } else if let Some(root) = self.shared_dedup_dir {
      config.dedup.backend = DedupBackend::Shared {
        store: SharedStore::Fs { root },
        root: "dedup".to_string(),
      };
    } else if let Some(url) = self.cdx_dedup_server_url {
      config.dedup.backend = DedupBackend::Cdx { url };
    } else if self.no_dedup {
      config.dedup.backend = DedupBackend::Disabled;
    }
    if let Some(path) = self.stats_db_file {
      config.stats.backend = StatsBackend::Local { path };
    } else if self.no_stats {
      config.stats.backend = StatsBackend::Disabled;
    }
    if let Some(queue_size) = self.queue_size {
      config.queue_size = queue_size;
    }
    if self.writer_threads.is_some() {
      config.writer_threads = self.writer_threads;
    }
    if let Some(max_connections) = self.max_connections {
      config.max_connections = max_connections;
    }
    config.plugins.extend(self.plugins);
    config.method_filter.extend(self.method_filter);
    if self.onion_tor_socks_proxy.is_some() {
      config.onion_proxy = self.onion_tor_socks_proxy;
    }
    if self.crawl_log_dir.is_some() {
      config.crawl_log_dir = self.crawl_log_dir;
    }
    if let Some(cacert) = self.cacert {
      config.cacert = cacert;
    }
    if let Some(certs_dir) = self.certs_dir {
      config.certs_dir = certs_dir;
    }
    if self.playback_index_db_file.is_some() {
      config.playback_index = self.playback_index_db_file;
    }
    for rule in self.host_redirects {
      let (from, to) = rule
        .split_once('=')
        .with_context(|| format!("host redirect {:?} is not FROM=TO", rule))?;
      config
        .host_redirects
        .insert(from.trim().to_string(), to.trim().to_string());
    }
    config.validate()?;
    Ok(config)
  }
}

async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut terminate) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = terminate.recv() => {}
        }
        return;
      }
      Err(e) => tracing::warn!("cannot listen for SIGTERM: {}", e),
    }
  }
  let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Args::parse().into_config().context("invalid configuration")?;
  let cacert = config.cacert.clone();
  let proxy = Controller::new(config)
    .await
    .context("startup failed")?
    .start()
    .await
    .context("startup failed")?;
  tracing::info!("clients must trust the CA certificate in {}", cacert.display());
  let stop = proxy.stop_token();
  tokio::spawn(async move {
    shutdown_signal().await;
    tracing::info!("signal received, shutting down");
    stop.cancel();
  });
  proxy.wait().await?;
  Ok(())
}
