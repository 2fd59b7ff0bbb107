//! Recording proxy server

use crate::capture::{CaptureConnection, CaptureContext};
use crate::errors::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Accepts client connections and spawns one capture task per connection
pub struct ProxyServer {
  listener: TcpListener,
  ctx: Arc<CaptureContext>,
  permits: Arc<Semaphore>,
  tracker: TaskTracker,
}

impl ProxyServer {
  /// Bind to `addr`; at most `max_connections` connections are served at once
  pub async fn bind(addr: &str, ctx: Arc<CaptureContext>, max_connections: usize) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::config_error(format!("Failed to bind to {}: {}", addr, e)))?;
    Ok(Self {
      listener,
      ctx,
      permits: Arc::new(Semaphore::new(max_connections.max(1))),
      tracker: TaskTracker::new(),
    })
  }

  /// Address the listener is bound to
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Tracks the spawned connection tasks
  pub fn tracker(&self) -> TaskTracker {
    self.tracker.clone()
  }

  /// Run the accept loop until the stop token fires
  ///
  /// Connections still in flight keep running on the tracker.
  pub async fn run(self) -> Result<()> {
    let stop = self.ctx.stop.clone();
    tracing::info!("proxy listening on {}", self.local_addr()?);
    loop {
      // a permit is held before accepting so excess clients wait in the backlog
      let permit = tokio::select! {
        _ = stop.cancelled() => break,
        permit = self.permits.clone().acquire_owned() => permit
          .map_err(|_| Error::Other("connection limiter closed".to_string()))?,
      };
      let accepted = tokio::select! {
        _ = stop.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          let _ = stream.set_nodelay(true);
          let ctx = self.ctx.clone();
          self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = CaptureConnection::new(ctx, peer_addr.ip()).serve(stream).await {
              tracing::debug!(peer = %peer_addr, "connection closed with error: {}", e);
            }
          });
        }
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      }
    }
    self.tracker.close();
    tracing::info!("stopped accepting connections");
    Ok(())
  }
}
