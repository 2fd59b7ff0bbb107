//! WARC/1.0 records, files and the per-prefix writer pool
mod pool;
mod record;
mod writer;

pub use pool::{PoolSettings, WarcWriterPool};
pub use record::{
  new_record_id, records_for, warc_date, warcinfo_record, Block, RecordType, WarcRecord,
  REVISIT_PROFILE, WARC_VERSION,
};
pub use writer::WarcWriter;

use chrono::{DateTime, Utc};

/// Renders WARC filenames from a template
///
/// Placeholders: `{prefix}`, `{timestamp17}` (`YYYYmmddHHMMSSfff`),
/// `{timestamp14}`, `{serialno}` (zero padded to five digits), `{hostname}` and
/// `{pid}`. The extension (`.warc` or `.warc.gz`) is appended.
#[derive(Clone, Debug)]
pub struct WarcFileName {
  template: String,
  hostname: String,
  gzip: bool,
}

impl WarcFileName {
  /// New renderer
  pub fn new(template: impl Into<String>, hostname: impl Into<String>, gzip: bool) -> Self {
    Self {
      template: template.into(),
      hostname: hostname.into(),
      gzip,
    }
  }

  /// Filename for `prefix` and `serial`, stamped with `now`
  pub fn render(&self, prefix: &str, serial: u32, now: DateTime<Utc>) -> String {
    let name = self
      .template
      .replace("{prefix}", prefix)
      .replace("{timestamp17}", &now.format("%Y%m%d%H%M%S%3f").to_string())
      .replace("{timestamp14}", &now.format("%Y%m%d%H%M%S").to_string())
      .replace("{serialno}", &format!("{:05}", serial))
      .replace("{hostname}", &self.hostname)
      .replace("{pid}", &std::process::id().to_string());
    let name = name.replace(['/', '\\'], "_");
    if self.gzip {
      format!("{}.warc.gz", name)
    } else {
      format!("{}.warc", name)
    }
  }
}
