//! Payload and block digests
//!
//! Digests are rendered the way WARC tools expect them: the algorithm name,
//! a colon and the base32 encoded hash, e.g. `sha1:VL2MMHO4YXUKFWV63YHTWSBM3GXKSQ2N`.

use crate::errors::{Error, Result};
use data_encoding::BASE32;
use sha1::Digest;
use std::fmt;
use std::str::FromStr;

/// Supported hash algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
  /// SHA-1, the WARC default
  #[default]
  Sha1,
  /// SHA-256
  Sha256,
}

impl DigestAlgorithm {
  /// Label used as digest prefix
  pub fn label(&self) -> &'static str {
    match self {
      DigestAlgorithm::Sha1 => "sha1",
      DigestAlgorithm::Sha256 => "sha256",
    }
  }
  /// Start an incremental digest
  pub fn digester(&self) -> Digester {
    match self {
      DigestAlgorithm::Sha1 => Digester::Sha1(sha1::Sha1::new()),
      DigestAlgorithm::Sha256 => Digester::Sha256(sha2::Sha256::new()),
    }
  }
  /// Digest a complete buffer
  pub fn digest(&self, data: &[u8]) -> String {
    let mut d = self.digester();
    d.update(data);
    d.finish()
  }
}

impl FromStr for DigestAlgorithm {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().replace('-', "").as_str() {
      "sha1" => Ok(DigestAlgorithm::Sha1),
      "sha256" => Ok(DigestAlgorithm::Sha256),
      _ => Err(Error::config_error(format!(
        "unsupported digest algorithm: {}",
        s
      ))),
    }
  }
}

impl fmt::Display for DigestAlgorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// Incremental hash state
#[derive(Clone)]
pub enum Digester {
  /// SHA-1 state
  Sha1(sha1::Sha1),
  /// SHA-256 state
  Sha256(sha2::Sha256),
}

impl Digester {
  /// Feed bytes
  pub fn update(&mut self, data: &[u8]) {
    match self {
      Digester::Sha1(h) => h.update(data),
      Digester::Sha256(h) => h.update(data),
    }
  }
  /// Algorithm of this state
  pub fn algorithm(&self) -> DigestAlgorithm {
    match self {
      Digester::Sha1(_) => DigestAlgorithm::Sha1,
      Digester::Sha256(_) => DigestAlgorithm::Sha256,
    }
  }
  /// Finish and render as `label:BASE32`
  pub fn finish(self) -> String {
    let label = self.algorithm().label();
    let raw = match self {
      Digester::Sha1(h) => h.finalize().to_vec(),
      Digester::Sha256(h) => h.finalize().to_vec(),
    };
    format!("{}:{}", label, BASE32.encode(&raw))
  }
}

impl fmt::Debug for Digester {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Digester").field(&self.algorithm()).finish()
  }
}

/// Strip the `label:` prefix from a rendered digest
pub fn strip_label(digest: &str) -> &str {
  digest.split_once(':').map(|(_, v)| v).unwrap_or(digest)
}
