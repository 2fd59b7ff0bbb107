//! Wires the components together and owns the shutdown sequence
//!
//! Startup builds everything from one validated [`ProxyConfig`] before the
//! listener is bound, so configuration errors surface before any traffic is
//! accepted. Shutdown runs in a fixed order: stop accepting, let in-flight
//! transactions finish within the grace period, close the queue, let the
//! writers drain it, stop the idle rollover task, finalize every WARC file,
//! then close dedup, stats and the listeners.

use crate::ca::CertificateAuthority;
use crate::capture::{CaptureContext, CaptureSettings};
use crate::config::ProxyConfig;
use crate::connector::{Connector, ConnectorBuilder};
use crate::crawl_log::CrawlLogger;
use crate::dedup::{build_dedup_index, DedupIndex, DedupLocks};
use crate::errors::{Error, Result};
use crate::listener::ListenerChain;
use crate::playback::PlaybackIndex;
use crate::plugins::PluginRegistry;
use crate::queue::TimestampedQueue;
use crate::record::RecordedUrl;
use crate::redirect::StaticRedirects;
use crate::server::ProxyServer;
use crate::socks5::Socks5Proxy;
use crate::stats::StatsDb;
use crate::warc::{PoolSettings, WarcWriterPool};
use crate::worker::{WarcWriterWorker, WorkerSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Every long-lived component, built but not yet running
pub struct Controller {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  connector: Arc<Connector>,
  queue: Arc<TimestampedQueue<RecordedUrl>>,
  pool: Arc<WarcWriterPool>,
  dedup: Arc<dyn DedupIndex>,
  stats: Option<Arc<StatsDb>>,
  listeners: Arc<ListenerChain>,
}

impl Controller {
  /// Build everything with the built-in plugins
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    Self::with_plugins(config, &PluginRegistry::new()).await
  }

  /// Build everything, resolving plugin names against `registry`
  pub async fn with_plugins(config: ProxyConfig, registry: &PluginRegistry) -> Result<Self> {
    config.validate()?;
    let ca = Arc::new(CertificateAuthority::new(&config.cacert, &config.certs_dir).await?);

    let onion_proxy = config
      .onion_proxy
      .as_deref()
      .map(Socks5Proxy::parse)
      .transpose()?;
    let redirects = StaticRedirects::from_rules(&config.host_redirects)?;
    if !redirects.is_empty() {
      tracing::info!("{} host redirect rules", redirects.len());
    }
    let connector = ConnectorBuilder::default()
      .connect_timeout(Some(config.connect_timeout()))
      .certs_verification(config.verify_origin_certs)
      .onion_proxy(onion_proxy)
      .resolver(Arc::new(redirects))
      .build()?;

    let queue = Arc::new(TimestampedQueue::new(config.queue_size));
    let pool = Arc::new(WarcWriterPool::new(PoolSettings::from(&config.warc)));
    let dedup = build_dedup_index(&config.dedup)?;
    let stats = StatsDb::from_config(&config.stats)?;

    let mut listeners = ListenerChain::new();
    if let Some(stats) = &stats {
      listeners.add(stats.clone());
    }
    if let Some(dir) = &config.crawl_log_dir {
      listeners.add(Arc::new(CrawlLogger::new(dir, config.warc.prefix.clone())?));
    }
    if let Some(path) = &config.playback_index {
      listeners.add(Arc::new(PlaybackIndex::open(path)?));
    }
    for plugin in registry.build_all(&config.plugins)? {
      listeners.add(plugin);
    }

    Ok(Self {
      config,
      ca,
      connector: Arc::new(connector),
      queue,
      pool,
      dedup,
      stats,
      listeners: Arc::new(listeners),
    })
  }

  /// The certificate authority clients must trust
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Bind the listener and start the writers
  pub async fn start(self) -> Result<RunningProxy> {
    let stop = CancellationToken::new();
    let ctx = Arc::new(CaptureContext {
      ca: self.ca.clone(),
      connector: self.connector.clone(),
      queue: self.queue.clone(),
      settings: CaptureSettings::from_config(&self.config)?,
      stop: stop.clone(),
    });
    let addr = if self.config.address.contains(':') {
      format!("[{}]:{}", self.config.address, self.config.port)
    } else {
      format!("{}:{}", self.config.address, self.config.port)
    };
    let server = ProxyServer::bind(&addr, ctx, self.config.max_connections).await?;
    let local_addr = server.local_addr()?;
    let tracker = server.tracker();

    let worker_settings = WorkerSettings::from_config(&self.config)?;
    let locks = Arc::new(DedupLocks::new());
    let workers = (0..self.config.writer_threads())
      .map(|id| {
        let worker = WarcWriterWorker::new(
          id,
          self.queue.clone(),
          self.pool.clone(),
          self.dedup.clone(),
          locks.clone(),
          self.listeners.clone(),
          worker_settings.clone(),
        );
        tokio::spawn(worker.run())
      })
      .collect::<Vec<_>>();

    let rollover_stop = CancellationToken::new();
    let idle_rollover = self.pool.spawn_idle_rollover(rollover_stop.clone());

    let flusher_stop = CancellationToken::new();
    let stats_flusher = self.stats.as_ref().and_then(|stats| {
      stats.spawn_flusher(
        Duration::from_secs(self.config.stats.flush_interval),
        flusher_stop.clone(),
      )
    });

    let accept = tokio::spawn(server.run());
    tracing::info!(
      writers = workers.len(),
      queue = self.queue.capacity(),
      dedup = self.dedup.name(),
      listeners = self.listeners.len(),
      "recording proxy started on {}",
      local_addr
    );

    Ok(RunningProxy {
      local_addr,
      stop,
      tracker,
      accept,
      workers,
      rollover_stop,
      idle_rollover,
      flusher_stop,
      stats_flusher,
      shutdown_grace: self.config.shutdown_grace(),
      ca: self.ca,
      queue: self.queue,
      pool: self.pool,
      dedup: self.dedup,
      stats: self.stats,
      listeners: self.listeners,
    })
  }
}

/// A started proxy
pub struct RunningProxy {
  local_addr: SocketAddr,
  stop: CancellationToken,
  tracker: TaskTracker,
  accept: JoinHandle<Result<()>>,
  workers: Vec<JoinHandle<Result<()>>>,
  rollover_stop: CancellationToken,
  idle_rollover: Option<JoinHandle<()>>,
  flusher_stop: CancellationToken,
  stats_flusher: Option<JoinHandle<()>>,
  shutdown_grace: Duration,
  ca: Arc<CertificateAuthority>,
  queue: Arc<TimestampedQueue<RecordedUrl>>,
  pool: Arc<WarcWriterPool>,
  dedup: Arc<dyn DedupIndex>,
  stats: Option<Arc<StatsDb>>,
  listeners: Arc<ListenerChain>,
}

impl RunningProxy {
  /// Address clients connect to
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// The certificate authority clients must trust
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Stats, when enabled
  pub fn stats(&self) -> Option<&Arc<StatsDb>> {
    self.stats.as_ref()
  }

  /// The WARC writer pool
  pub fn pool(&self) -> &Arc<WarcWriterPool> {
    &self.pool
  }

  /// Captures waiting to be written
  pub fn queued(&self) -> usize {
    self.queue.len()
  }

  /// Token that triggers [`RunningProxy::wait`]
  pub fn stop_token(&self) -> CancellationToken {
    self.stop.clone()
  }

  /// Wait for the stop token, then shut down
  pub async fn wait(self) -> Result<()> {
    self.stop.cancelled().await;
    self.shutdown().await
  }

  /// Stop accepting, drain and close everything
  ///
  /// Every step runs even when an earlier one fails; the first failure is
  /// returned.
  pub async fn shutdown(self) -> Result<()> {
    let mut first_error: Option<Error> = None;
    tracing::info!("shutting down");
    self.stop.cancel();
    match self.accept.await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        first_error.get_or_insert(e);
      }
      Err(e) => tracing::error!("accept loop panicked: {}", e),
    }

    self.tracker.close();
    if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
      .await
      .is_err()
    {
      tracing::warn!(
        "{} connections still open after {:?}, their captures are dropped",
        self.tracker.len(),
        self.shutdown_grace
      );
    }

    self.queue.close();
    for (id, worker) in self.workers.into_iter().enumerate() {
      match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          tracing::error!(worker = id, "writer failed: {}", e);
          first_error.get_or_insert(e);
        }
        Err(e) => tracing::error!(worker = id, "writer panicked: {}", e),
      }
    }
    if !self.queue.is_empty() {
      tracing::error!("{} captures left unwritten", self.queue.len());
    }

    self.rollover_stop.cancel();
    if let Some(idle_rollover) = self.idle_rollover {
      let _ = idle_rollover.await;
    }
    let pool = self.pool.clone();
    match tokio::task::spawn_blocking(move || pool.close_all()).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        first_error.get_or_insert(e);
      }
      Err(e) => tracing::error!("finalizing WARC files panicked: {}", e),
    }

    if let Err(e) = self.dedup.close().await {
      tracing::warn!("closing dedup backend: {}", e);
    }
    self.flusher_stop.cancel();
    if let Some(flusher) = self.stats_flusher {
      let _ = flusher.await;
    }
    self.listeners.close().await;
    tracing::info!("shutdown complete");
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{DedupBackend, StatsBackend};

  fn config(dir: &std::path::Path) -> ProxyConfig {
    let mut config = ProxyConfig {
      port: 0,
      cacert: dir.join("ca.pem"),
      certs_dir: dir.join("certs"),
      writer_threads: Some(2),
      plugins: vec!["log".to_string()],
      ..Default::default()
    };
    config.warc.directory = dir.join("warcs");
    config.dedup.backend = DedupBackend::Disabled;
    config.stats.backend = StatsBackend::Memory;
    config
  }

  #[tokio::test]
  async fn test_start_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::new(config(dir.path())).await.unwrap();
    let running = controller.start().await.unwrap();
    assert_ne!(running.local_addr().port(), 0);
    assert!(running.stats().is_some());
    running.shutdown().await.unwrap();
    assert!(dir.path().join("ca.pem").exists());
  }

  #[tokio::test]
  async fn test_unknown_plugin_fails_before_binding() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.plugins.push("missing".to_string());
    assert!(matches!(
      Controller::new(config).await,
      Err(Error::Config(_))
    ));
  }

  #[tokio::test]
  async fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.queue_size = 0;
    assert!(Controller::new(config).await.is_err());
  }
}
