//! Mirrors relayed bytes into a spool while hashing them.
//!
//! The spool stays in memory up to a threshold and then moves to an anonymous
//! temporary file, so large bodies are never held fully in memory.

use crate::digest::{DigestAlgorithm, Digester};
use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;

/// Records one side (request or response) of a transaction
#[derive(Debug)]
pub struct Recorder {
  spool: SpooledTempFile,
  head: Vec<u8>,
  len: u64,
  payload_len: u64,
  block: Digester,
  payload: Digester,
}

impl Recorder {
  /// New recorder spooling to disk past `threshold` bytes
  pub fn new(algorithm: DigestAlgorithm, threshold: usize) -> Self {
    Self {
      spool: tempfile::spooled_tempfile(threshold),
      head: Vec::new(),
      len: 0,
      payload_len: 0,
      block: algorithm.digester(),
      payload: algorithm.digester(),
    }
  }

  /// Record the message head (start line and headers, including the blank line)
  pub fn record_head(&mut self, head: &[u8]) -> io::Result<()> {
    self.head.extend_from_slice(head);
    self.record(head)
  }

  /// Record raw bytes as they appear on the wire
  pub fn record(&mut self, data: &[u8]) -> io::Result<()> {
    self.spool.write_all(data)?;
    self.block.update(data);
    self.len += data.len() as u64;
    Ok(())
  }

  /// Account decoded payload bytes (body without transfer framing)
  pub fn payload(&mut self, data: &[u8]) {
    self.payload.update(data);
    self.payload_len += data.len() as u64;
  }

  /// Payload bytes seen so far
  pub fn payload_len(&self) -> u64 {
    self.payload_len
  }

  /// Finish hashing
  pub fn finish(mut self) -> io::Result<CapturedMessage> {
    self.spool.flush()?;
    Ok(CapturedMessage {
      head: Bytes::from(self.head),
      spool: self.spool,
      len: self.len,
      payload_len: self.payload_len,
      block_digest: self.block.finish(),
      payload_digest: self.payload.finish(),
    })
  }
}

/// The recorded bytes of one side of a transaction, with digests
#[derive(Debug)]
pub struct CapturedMessage {
  head: Bytes,
  spool: SpooledTempFile,
  len: u64,
  payload_len: u64,
  block_digest: String,
  payload_digest: String,
}

impl CapturedMessage {
  /// Start line and headers as received
  pub fn head(&self) -> &Bytes {
    &self.head
  }
  /// Total recorded bytes, head included
  pub fn len(&self) -> u64 {
    self.len
  }
  /// Nothing was recorded
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
  /// Decoded payload length
  pub fn payload_len(&self) -> u64 {
    self.payload_len
  }
  /// Digest over all recorded bytes
  pub fn block_digest(&self) -> &str {
    &self.block_digest
  }
  /// Digest over the decoded payload
  pub fn payload_digest(&self) -> &str {
    &self.payload_digest
  }
  /// Read the recorded bytes from the start
  pub fn reader(&mut self) -> io::Result<impl Read + '_> {
    self.spool.seek(SeekFrom::Start(0))?;
    Ok((&mut self.spool).take(self.len))
  }
  /// Copy the whole recording into memory
  pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(self.len as usize);
    self.reader()?.read_to_end(&mut buf)?;
    Ok(buf)
  }
}
