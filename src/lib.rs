#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-warc
//!
//! A man-in-the-middle HTTP/HTTPS proxy that archives the traffic passing
//! through it as WARC files.
//!
//! - Plain HTTP requests and `CONNECT` tunnels, intercepted with leaf
//!   certificates minted by a local [certificate authority](ca)
//! - Streaming capture: bodies are relayed as they arrive and spooled to a
//!   temporary file past a threshold
//! - A bounded queue feeding a pool of [writer workers](worker) with size and
//!   idle rollover of `.warc` or `.warc.gz` files
//! - Payload [deduplication](dedup) into revisit records against a local
//!   SQLite table, a shared object store or a CDX server
//! - Post-write [listeners](listener): statistics, a crawl log, a playback
//!   index and named plugins
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> slinger_warc::Result<()> {
//! let config = slinger_warc::ProxyConfig::from_toml_str(
//!   r#"
//!   port = 8000
//!   [warc]
//!   directory = "./warcs"
//!   prefix = "crawl"
//!   gzip = true
//!   "#,
//! )?;
//! let proxy = slinger_warc::Controller::new(config).await?.start().await?;
//! println!("trust {}", proxy.ca().ca_cert_pem());
//! let stop = proxy.stop_token();
//! tokio::spawn(async move {
//!   let _ = tokio::signal::ctrl_c().await;
//!   stop.cancel();
//! });
//! proxy.wait().await
//! # }
//! ```
//!
//! ## Per-request metadata
//!
//! Clients can steer a capture with a JSON request header, `Warc-Meta` by
//! default. It is removed before the request is forwarded.
//!
//! ```text
//! Warc-Meta: {"warc-prefix": "job1", "stats": {"buckets": ["job1"]}, "dedup-bucket": "job1"}
//! ```
//!
//! ## Optional Features
//!
//! - **cdx**: Deduplication against a CDX server.
//! - **shared-dedup**: Deduplication table on a shared filesystem or object store.
//! - **s3**: S3 buckets for the shared dedup table.
//!
/// Certificate authority and leaf certificates
pub mod ca;
mod capture;
/// Proxy configuration
pub mod config;
mod connector;
/// Recording logs
pub mod crawl_log;
/// Payload deduplication
pub mod dedup;
/// Payload and block digests
pub mod digest;
mod errors;
/// HTTP/1.x message heads and body relaying
pub mod http1;
/// Post-write notification
pub mod listener;
/// Playback index
pub mod playback;
/// Listener plugins
pub mod plugins;
/// Capture queue
pub mod queue;
/// Captured transactions
pub mod record;
/// Capture buffers
pub mod recorder;
/// Origin redirect rules
pub mod redirect;
mod server;
mod socket;
mod socks5;
/// Statistics
pub mod stats;
mod tls;
/// WARC records and files
pub mod warc;
mod worker;
mod controller;

pub use capture::{CaptureConnection, CaptureContext, CaptureSettings};
pub use config::ProxyConfig;
pub use connector::{Connector, ConnectorBuilder};
pub use controller::{Controller, RunningProxy};
pub use errors::{Error, ReplyError, Result};
pub use server::ProxyServer;
pub use socket::MaybeTlsStream;
pub use socks5::Socks5Proxy;
pub use worker::{WarcWriterWorker, WorkerSettings};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
