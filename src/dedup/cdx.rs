use super::{digest_of_key, DedupEntry, DedupIndex};
use crate::digest::strip_label;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::time::Duration;

/// Read-only dedup against a CDX server
///
/// Asks the server for earlier non-revisit captures of the same URL and
/// compares their digests. `store` does nothing; the server learns about new
/// captures when the WARC files are indexed.
#[derive(Clone, Debug)]
pub struct CdxServerDedup {
  client: reqwest::Client,
  url: String,
}

impl CdxServerDedup {
  /// Client for the CDX endpoint at `url`
  pub fn new(url: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()?;
    Ok(Self {
      client,
      url: url.to_string(),
    })
  }

  fn query_url(&self, url: &str) -> String {
    format!(
      "{}?url={}&fl=timestamp,digest&filter=!mimetype:warc/revisit&limit=-1",
      self.url,
      utf8_percent_encode(url, NON_ALPHANUMERIC)
    )
  }
}

/// Last capture in a `timestamp digest` listing whose digest matches
pub fn parse_cdx_response(body: &str, key: &str, url: &str) -> Option<DedupEntry> {
  let wanted = strip_label(digest_of_key(key));
  body
    .lines()
    .filter_map(|line| {
      let mut fields = line.split_whitespace();
      let timestamp = fields.next()?;
      let digest = fields.next()?;
      (strip_label(digest) == wanted).then_some(timestamp)
    })
    .filter_map(|timestamp| {
      NaiveDateTime::parse_from_str(timestamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|date| date.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    })
    .last()
    .map(|date| DedupEntry {
      digest_key: key.to_string(),
      url: url.to_string(),
      date,
      record_id: None,
    })
}

#[async_trait]
impl DedupIndex for CdxServerDedup {
  fn name(&self) -> &'static str {
    "cdx"
  }

  async fn lookup(&self, key: &str, url: &str) -> Result<Option<DedupEntry>> {
    let response = self.client.get(self.query_url(url)).send().await?;
    if !response.status().is_success() {
      return Err(Error::dedup_error(format!(
        "CDX server answered {}",
        response.status()
      )));
    }
    let body = response.text().await?;
    Ok(parse_cdx_response(&body, key, url))
  }

  async fn store(&self, _key: &str, _entry: &DedupEntry) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_last_matching_line_wins() {
    let body = "20200101000000 AAAA\n20210101000000 BBBB\n20220203040506 AAAA\n";
    let hit = parse_cdx_response(body, "sha1:AAAA", "http://a/").unwrap();
    assert_eq!(hit.date, "2022-02-03T04:05:06Z");
    assert_eq!(hit.url, "http://a/");
    assert_eq!(hit.record_id, None);
  }

  #[test]
  fn test_no_match_and_bucketed_key() {
    assert!(parse_cdx_response("20200101000000 BBBB\n", "sha1:AAAA", "u").is_none());
    assert!(parse_cdx_response("", "sha1:AAAA", "u").is_none());
    assert!(parse_cdx_response("20200101000000 sha1:AAAA\n", "sha1:AAAA|job", "u").is_some());
  }

  #[test]
  fn test_query_url() {
    let cdx = CdxServerDedup::new("http://localhost:8080/cdx").unwrap();
    assert_eq!(
      cdx.query_url("http://a/?b=c"),
      "http://localhost:8080/cdx?url=http%3A%2F%2Fa%2F%3Fb%3Dc&fl=timestamp,digest&filter=!mimetype:warc/revisit&limit=-1"
    );
  }
}
