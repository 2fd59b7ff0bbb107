//! Certificate authority for TLS interception
//!
//! The root CA lives in a single PEM file holding the certificate followed by
//! its private key. Leaf certificates are minted per hostname on first use,
//! written to the certificate directory and cached for the life of the process.

use crate::errors::{Error, Result};
use crate::tls;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Upper bound on cached leaves
const MAX_CACHED_HOSTS: u64 = 10_000;

/// A minted leaf certificate
pub struct CertificateEntry {
  /// Hostname the certificate was issued for
  pub hostname: String,
  /// `[leaf, root]`
  pub cert_chain: Vec<CertificateDer<'static>>,
  /// Leaf private key
  pub key: PrivateKeyDer<'static>,
  /// When the leaf was generated or loaded
  pub issued_at: DateTime<Utc>,
  server_config: Arc<ServerConfig>,
}

impl CertificateEntry {
  /// TLS server config presenting this leaf
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

impl std::fmt::Debug for CertificateEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateEntry")
      .field("hostname", &self.hostname)
      .field("issued_at", &self.issued_at)
      .finish()
  }
}

/// Root CA plus the per-host leaf cache
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  certs_dir: PathBuf,
  cache: Cache<String, Arc<CertificateEntry>>,
}

impl CertificateAuthority {
  /// Load the root CA from `ca_file`, creating it when the file does not exist
  pub async fn new(ca_file: impl AsRef<Path>, certs_dir: impl AsRef<Path>) -> Result<Self> {
    let ca_file = ca_file.as_ref();
    let certs_dir = certs_dir.as_ref().to_path_buf();
    fs::create_dir_all(&certs_dir).await?;
    let (issuer, ca_cert_der, ca_cert_pem) = if fs::try_exists(ca_file).await? {
      Self::load_ca(ca_file).await?
    } else {
      Self::generate_ca(ca_file).await?
    };
    let cache = Cache::builder().max_capacity(MAX_CACHED_HOSTS).build();
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      certs_dir,
      cache,
    })
  }

  async fn load_ca(
    ca_file: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let pem = fs::read_to_string(ca_file).await?;
    let (cert_der, key_der) = parse_cert_and_key(&pem)?;
    let key_pair = KeyPair::try_from(&key_der)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    tracing::debug!("loaded CA certificate from {}", ca_file.display());
    Ok((issuer, cert_der.clone(), pem_encode(&cert_der)))
  }

  async fn generate_ca(
    ca_file: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "slinger-warc CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
    if let Some(parent) = ca_file.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent).await?;
    }
    fs::write(ca_file, pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    tracing::info!(
      path = %ca_file.display(),
      sha256 = %hex::encode_upper(Sha256::digest(cert_der.as_ref())),
      "generated new CA certificate, install it in clients to trust intercepted TLS"
    );
    let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;
    Ok((issuer, cert_der, cert.pem()))
  }

  /// Leaf certificate for `hostname`, minted on first request
  ///
  /// Concurrent callers asking for the same uncached host share one
  /// generation.
  pub async fn get_leaf_cert(&self, hostname: &str) -> Result<Arc<CertificateEntry>> {
    let hostname = hostname.to_ascii_lowercase();
    self
      .cache
      .try_get_with(hostname.clone(), self.load_or_generate(hostname))
      .await
      .map_err(|e| Error::Certificate(e.to_string()))
  }

  async fn load_or_generate(&self, hostname: String) -> Result<Arc<CertificateEntry>> {
    let path = self.leaf_path(&hostname);
    if fs::try_exists(&path).await? {
      let pem = fs::read_to_string(&path).await?;
      match parse_cert_and_key(&pem) {
        Ok((cert, key)) => {
          tracing::debug!("loaded leaf certificate for {}", hostname);
          return self.entry(hostname, cert, key);
        }
        Err(e) => tracing::warn!("regenerating unreadable leaf {}: {}", path.display(), e),
      }
    }
    let (cert, key, pem) = self.generate_leaf(&hostname)?;
    fs::write(&path, pem.as_bytes()).await?;
    tracing::debug!("generated leaf certificate for {}", hostname);
    self.entry(hostname, cert, key)
  }

  fn entry(
    &self,
    hostname: String,
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
  ) -> Result<Arc<CertificateEntry>> {
    let cert_chain = vec![cert, self.ca_cert_der.clone()];
    let server_config = tls::server_config(cert_chain.clone(), key.clone_key())?;
    Ok(Arc::new(CertificateEntry {
      hostname,
      cert_chain,
      key,
      issued_at: Utc::now(),
      server_config,
    }))
  }

  fn generate_leaf(
    &self,
    hostname: &str,
  ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>, String)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(hostname)?;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf for {}: {}", hostname, e)))?;
    let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;
    Ok((cert_der, key_der, pem))
  }

  fn leaf_path(&self, hostname: &str) -> PathBuf {
    let name: String = hostname
      .chars()
      .map(|c| match c {
        ':' | '/' | '\\' => '_',
        c => c,
      })
      .collect();
    self.certs_dir.join(format!("{}.pem", name))
  }

  /// Root certificate as PEM, for installing in clients
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate as DER
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

fn pem_encode(der: &CertificateDer<'_>) -> String {
  let encoded = data_encoding::BASE64.encode(der.as_ref());
  let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
  for line in encoded.as_bytes().chunks(64) {
    pem.push_str(&String::from_utf8_lossy(line));
    pem.push('\n');
  }
  pem.push_str("-----END CERTIFICATE-----\n");
  pem
}

fn subject_alt_names(hostname: &str) -> Result<Vec<SanType>> {
  let host = hostname.trim_start_matches('[').trim_end_matches(']');
  if let Ok(ip) = host.parse::<IpAddr>() {
    return Ok(vec![SanType::IpAddress(ip)]);
  }
  let invalid = |_| Error::certificate_error(format!("Invalid domain name: {}", hostname));
  Ok(vec![
    SanType::DnsName(host.try_into().map_err(invalid)?),
    SanType::DnsName(format!("*.{}", host).try_into().map_err(invalid)?),
  ])
}

fn parse_cert_and_key(pem: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
  let cert = rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .ok_or_else(|| Error::Certificate("no certificate in PEM".to_string()))?
    .map_err(|e| Error::Certificate(format!("Failed to parse PEM: {}", e)))?;
  let key = rustls_pemfile::private_key(&mut pem.as_bytes())
    .map_err(|e| Error::Certificate(format!("Failed to parse PEM key: {}", e)))?
    .ok_or_else(|| Error::Certificate("no private key in PEM".to_string()))?;
  Ok((cert, key))
}
