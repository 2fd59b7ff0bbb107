use super::record::WarcRecord;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Counts bytes passed through to the inner writer
#[derive(Debug)]
struct CountingWriter<W> {
  inner: W,
  count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.inner.write(buf)?;
    self.count += n as u64;
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

/// One WARC file open for appending
///
/// The file keeps the open suffix until [`WarcWriter::finalize`] has flushed,
/// synced and closed it; only then is it renamed to its final name.
#[derive(Debug)]
pub struct WarcWriter {
  final_path: PathBuf,
  open_path: PathBuf,
  out: CountingWriter<BufWriter<File>>,
  gzip: bool,
  serial: u32,
  opened_at: Instant,
  last_write_at: Instant,
}

impl WarcWriter {
  /// Create `dir/filename` (plus `open_suffix`), failing if it already exists
  pub fn create(
    dir: &Path,
    filename: &str,
    open_suffix: Option<&str>,
    gzip: bool,
    serial: u32,
  ) -> io::Result<Self> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(filename);
    let open_path = match open_suffix {
      Some(suffix) if !suffix.is_empty() => dir.join(format!("{}{}", filename, suffix)),
      _ => final_path.clone(),
    };
    if final_path.exists() {
      return Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists", final_path.display()),
      ));
    }
    let file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&open_path)?;
    tracing::info!("opened {}", open_path.display());
    let now = Instant::now();
    Ok(Self {
      final_path,
      open_path,
      out: CountingWriter {
        inner: BufWriter::new(file),
        count: 0,
      },
      gzip,
      serial,
      opened_at: now,
      last_write_at: now,
    })
  }

  /// Append a record, returning its `(offset, length)` in the file
  ///
  /// In gzip mode each record is its own gzip member.
  pub fn write_record(&mut self, record: WarcRecord<'_>) -> io::Result<(u64, u64)> {
    let offset = self.out.count;
    if self.gzip {
      let mut encoder = GzEncoder::new(&mut self.out, Compression::default());
      record.write_to(&mut encoder)?;
      encoder.finish()?;
    } else {
      record.write_to(&mut self.out)?;
    }
    self.last_write_at = Instant::now();
    Ok((offset, self.out.count - offset))
  }

  /// Push buffered bytes to the OS
  pub fn flush(&mut self) -> io::Result<()> {
    self.out.flush()
  }

  /// Cut the file back to `offset`, dropping buffered bytes past it
  ///
  /// Used after a failed write so that no torn record survives.
  pub fn discard_from(self, offset: u64) -> io::Result<Self> {
    let (mut file, _buffered) = self.out.inner.into_parts();
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(Self {
      out: CountingWriter {
        inner: BufWriter::new(file),
        count: offset,
      },
      ..self
    })
  }

  /// Flush, fsync, close and rename to the final name
  pub fn finalize(mut self) -> io::Result<PathBuf> {
    self.out.flush()?;
    let file = self
      .out
      .inner
      .into_inner()
      .map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);
    if self.open_path != self.final_path {
      std::fs::rename(&self.open_path, &self.final_path)?;
    }
    sync_parent_dir(&self.final_path)?;
    tracing::info!("closed {}", self.final_path.display());
    Ok(self.final_path)
  }

  /// Bytes written so far
  pub fn bytes_written(&self) -> u64 {
    self.out.count
  }

  /// Final filename, without directory or open suffix
  pub fn filename(&self) -> String {
    self
      .final_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default()
  }

  /// Path while the file is being written
  pub fn open_path(&self) -> &Path {
    &self.open_path
  }

  /// Path once finalized
  pub fn final_path(&self) -> &Path {
    &self.final_path
  }

  /// Serial number within the prefix
  pub fn serial(&self) -> u32 {
    self.serial
  }

  /// When the file was opened
  pub fn opened_at(&self) -> Instant {
    self.opened_at
  }

  /// When the last record was written
  pub fn last_write_at(&self) -> Instant {
    self.last_write_at
  }

  /// Whether records are gzip members
  pub fn is_gzip(&self) -> bool {
    self.gzip
  }
}

/// fsync the directory holding `path` so a rename survives a crash
fn sync_parent_dir(path: &Path) -> io::Result<()> {
  let Some(parent) = path.parent() else {
    return Ok(());
  };
  #[cfg(unix)]
  {
    File::open(parent)?.sync_all()?;
  }
  #[cfg(not(unix))]
  let _ = parent;
  Ok(())
}
