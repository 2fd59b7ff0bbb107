//! Compiled-in listener plugins, looked up by name

use crate::errors::{Error, Result};
use crate::listener::Listener;
use crate::record::{RecordedUrl, WrittenRecord};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a listener instance
pub type PluginFactory = fn() -> Result<Arc<dyn Listener>>;

/// Named listener factories
pub struct PluginRegistry {
  factories: BTreeMap<&'static str, PluginFactory>,
}

impl Default for PluginRegistry {
  fn default() -> Self {
    let mut registry = Self {
      factories: BTreeMap::new(),
    };
    registry.register("log", || Ok(Arc::new(LogPlugin)));
    registry
  }
}

impl PluginRegistry {
  /// Registry with the built-in plugins
  pub fn new() -> Self {
    Self::default()
  }

  /// Add or replace a factory
  pub fn register(&mut self, name: &'static str, factory: PluginFactory) {
    self.factories.insert(name, factory);
  }

  /// Registered names
  pub fn names(&self) -> Vec<&'static str> {
    self.factories.keys().copied().collect()
  }

  /// Instantiate the plugin called `name`
  pub fn build(&self, name: &str) -> Result<Arc<dyn Listener>> {
    let factory = self.factories.get(name).ok_or_else(|| {
      Error::config_error(format!(
        "unknown plugin {:?}, available: {}",
        name,
        self.names().join(", ")
      ))
    })?;
    factory()
  }

  /// Instantiate every plugin in `names`, in order
  pub fn build_all(&self, names: &[String]) -> Result<Vec<Arc<dyn Listener>>> {
    names.iter().map(|name| self.build(name)).collect()
  }
}

/// Logs every archived capture at info
#[derive(Debug, Default)]
pub struct LogPlugin;

#[async_trait::async_trait]
impl Listener for LogPlugin {
  fn name(&self) -> &str {
    "log"
  }

  async fn notify(&self, recorded: &RecordedUrl, records: &[WrittenRecord]) -> Result<()> {
    let location = records
      .first()
      .map(|r| format!("{}@{}", r.warc_filename, r.offset))
      .unwrap_or_default();
    tracing::info!(
      status = recorded.status.as_u16(),
      size = recorded.response_size(),
      revisit = recorded.is_revisit(),
      "{} {} {}",
      recorded.method,
      recorded.url,
      location
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtin_and_unknown() {
    let registry = PluginRegistry::new();
    assert_eq!(registry.names(), vec!["log"]);
    assert_eq!(registry.build("log").unwrap().name(), "log");
    assert!(matches!(registry.build("nope"), Err(Error::Config(_))));
    assert!(registry.build_all(&["log".to_string(), "nope".to_string()]).is_err());
  }

  #[test]
  fn test_register_custom() {
    let mut registry = PluginRegistry::new();
    registry.register("quiet", || Ok(Arc::new(LogPlugin)));
    assert_eq!(registry.build_all(&["quiet".to_string()]).unwrap().len(), 1);
  }
}
