//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_warc::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while capturing and archiving traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// Root CA or leaf certificate could not be loaded or generated
  #[error("Certificate error: {0}")]
  Certificate(String),
  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed request from a client
  #[error("Invalid request: {0}")]
  InvalidRequest(String),
  /// Origin could not be reached
  #[error("Connection error: {0}")]
  Connection(String),
  /// Bad configuration, fatal at startup
  #[error("Configuration error: {0}")]
  Config(String),
  /// Dedup backend failure
  #[error("Dedup error: {0}")]
  Dedup(String),
  /// Stats backend failure
  #[error("Stats error: {0}")]
  Stats(String),
  /// WARC writing failure
  #[error("WARC error: {0}")]
  Warc(String),
  /// Embedded database error
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),
  /// Shared object store error
  #[cfg(feature = "shared-dedup")]
  #[error(transparent)]
  Storage(#[from] opendal::Error),
  /// CDX server request error
  #[cfg(feature = "cdx")]
  #[error(transparent)]
  HttpClient(#[from] reqwest::Error),
  /// JSON encoding error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// The capture queue no longer accepts items
  #[error("queue closed")]
  QueueClosed,
  /// SOCKS5 ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// SOCKS5 reply codes returned by the onion proxy
#[derive(ThisError, Debug)]
pub enum ReplyError {
  /// Request granted
  #[error("Succeeded")]
  Succeeded,
  /// General SOCKS server failure
  #[error("General failure")]
  GeneralFailure,
  /// Connection not allowed by ruleset
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// Network unreachable
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// Host unreachable
  #[error("Host unreachable")]
  HostUnreachable,
  /// Connection refused
  #[error("Connection refused")]
  ConnectionRefused,
  /// TTL expired
  #[error("TTL expired")]
  TtlExpired,
  /// Command not supported
  #[error("Command not supported")]
  CommandNotSupported,
  /// Address type not supported
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// Reply code outside the protocol
  #[error("Unknown reply code {0:#04x}")]
  Unknown(u8),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a WARC error and log it
  pub fn warc_error(msg: impl Into<String>) -> Self {
    let error = Error::Warc(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a dedup error and log it
  pub fn dedup_error(msg: impl Into<String>) -> Self {
    let error = Error::Dedup(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a stats error and log it
  pub fn stats_error(msg: impl Into<String>) -> Self {
    let error = Error::Stats(msg.into());
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::task::JoinError> for Error {
  fn from(value: tokio::task::JoinError) -> Self {
    Error::Other(format!("task failed: {}", value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
