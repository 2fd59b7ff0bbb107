use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Host and port of an origin
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
  /// Hostname or IP literal, without brackets
  pub host: String,
  /// Port
  pub port: u16,
}

impl Target {
  /// New target
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
  /// Whether the host lives on the Tor network
  pub fn is_onion(&self) -> bool {
    self.host.to_ascii_lowercase().ends_with(".onion")
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Decides where an origin connection actually goes
///
/// The requested host is still used for TLS SNI, the `Host` header and the
/// recorded URL; only the socket endpoint changes.
pub trait TargetResolver: Send + Sync {
  /// Endpoint to connect to for `target`
  fn resolve(&self, target: &Target) -> Target;
}

/// Connects to exactly what was requested
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

impl TargetResolver for Direct {
  fn resolve(&self, target: &Target) -> Target {
    target.clone()
  }
}

/// Fixed `host:port` to `host:port` remapping
#[derive(Clone, Debug, Default)]
pub struct StaticRedirects {
  rules: HashMap<Target, Target>,
}

impl StaticRedirects {
  /// Build from `"host:port" = "host:port"` pairs
  pub fn from_rules<'a>(rules: impl IntoIterator<Item = (&'a String, &'a String)>) -> Result<Self> {
    let mut map = HashMap::new();
    for (from, to) in rules {
      map.insert(parse_authority(from)?, parse_authority(to)?);
    }
    Ok(Self { rules: map })
  }
  /// Number of rules
  pub fn len(&self) -> usize {
    self.rules.len()
  }
  /// No rules
  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

impl TargetResolver for StaticRedirects {
  fn resolve(&self, target: &Target) -> Target {
    let key = Target::new(target.host.to_ascii_lowercase(), target.port);
    match self.rules.get(&key) {
      Some(to) => {
        tracing::trace!("redirecting {} to {}", target, to);
        to.clone()
      }
      None => target.clone(),
    }
  }
}

/// Parse `host:port`, `[v6]:port` or a bare `host` (port 80)
pub fn parse_authority(s: &str) -> Result<Target> {
  parse_authority_with_default(s, 80)
}

/// Parse an authority, using `default_port` when none is given
///
/// The host is lowercased, so recorded URLs, redirect keys and leaf
/// certificates all see the same name.
pub fn parse_authority_with_default(s: &str, default_port: u16) -> Result<Target> {
  let authority: http::uri::Authority = s
    .parse()
    .map_err(|_| Error::invalid_request(format!("Invalid authority: {}", s)))?;
  let host = authority
    .host()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_ascii_lowercase();
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Invalid authority: {}", s)));
  }
  let port = authority.port_u16().unwrap_or(default_port);
  Ok(Target::new(host, port))
}
