use crate::errors::{Error, Result};
use crate::redirect::{Direct, Target, TargetResolver};
use crate::socket::MaybeTlsStream;
use crate::socks5::Socks5Proxy;
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certs_verification: bool,
  onion_proxy: Option<Socks5Proxy>,
  resolver: Arc<dyn TargetResolver>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      certs_verification: false,
      onion_proxy: None,
      resolver: Arc::new(Direct),
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation towards origins.
  ///
  /// Defaults to `false`: the proxy archives whatever the origin serves.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// SOCKS5 proxy for `.onion` hosts
  pub fn onion_proxy(mut self, proxy: Option<Socks5Proxy>) -> ConnectorBuilder {
    self.onion_proxy = proxy;
    self
  }
  /// Where origin connections actually go
  pub fn resolver(mut self, resolver: Arc<dyn TargetResolver>) -> ConnectorBuilder {
    self.resolver = resolver;
    self
  }
  /// Build the `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = TlsConnector::from(tls::client_config(self.certs_verification)?);
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      onion_proxy: self.onion_proxy.clone(),
      resolver: self.resolver.clone(),
      tls,
    })
  }
}

/// Opens origin connections
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  onion_proxy: Option<Socks5Proxy>,
  resolver: Arc<dyn TargetResolver>,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<TcpStream> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    if self.nodelay {
      stream.set_nodelay(self.nodelay)?;
    }
    Ok(stream)
  }

  /// Connect to `target`, through the onion proxy or the redirect rules, and
  /// optionally run a TLS handshake using the requested hostname for SNI
  pub async fn connect(&self, target: &Target, use_tls: bool) -> Result<MaybeTlsStream> {
    let tcp = match (&self.onion_proxy, target.is_onion()) {
      (Some(proxy), true) => self.connect_via_socks5(proxy, target).await?,
      _ => {
        let endpoint = self.resolver.resolve(target);
        self.connect_tcp(&endpoint).await?
      }
    };
    if !use_tls {
      return Ok(MaybeTlsStream::Tcp(tcp));
    }
    self.upgrade_to_tls(tcp, &target.host).await
  }

  async fn connect_tcp(&self, endpoint: &Target) -> Result<TcpStream> {
    let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
      .await
      .map_err(|e| Error::connection_error(format!("cannot resolve {}: {}", endpoint, e)))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_error = Some(e),
      }
    }
    Err(Error::connection_error(match last_error {
      Some(e) => format!("Failed to connect to {}: {}", endpoint, e),
      None => format!("no address for {}", endpoint),
    }))
  }

  async fn connect_via_socks5(&self, proxy: &Socks5Proxy, target: &Target) -> Result<TcpStream> {
    let (host, port) = proxy.address();
    let mut stream = self.connect_tcp(&Target::new(host, port)).await?;
    proxy
      .handshake(&mut stream, &target.host, target.port)
      .await
      .map_err(|e| Error::connection_error(format!("SOCKS5 connect to {} failed: {}", target, e)))?;
    Ok(stream)
  }

  /// TLS handshake on an established TCP stream
  pub async fn upgrade_to_tls(&self, stream: TcpStream, domain: &str) -> Result<MaybeTlsStream> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", domain, e)))?;
    let tls = self
      .tls
      .connect(domain, stream)
      .await
      .map_err(|e| Error::tls_error(format!("origin TLS handshake failed: {}", e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_connect_follows_redirect_rules() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut rules = std::collections::HashMap::new();
    rules.insert("example.test:80".to_string(), format!("127.0.0.1:{}", port));
    let redirects = crate::redirect::StaticRedirects::from_rules(&rules).unwrap();
    let connector = ConnectorBuilder::default()
      .resolver(Arc::new(redirects))
      .build()
      .unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
    let stream = connector
      .connect(&Target::new("example.test", 80), false)
      .await
      .unwrap();
    assert!(!stream.is_tls());
    accept.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_refused_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = ConnectorBuilder::default().build().unwrap();
    let err = connector
      .connect(&Target::new("127.0.0.1", port), false)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
  }
}
