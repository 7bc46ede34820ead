//! In-memory-then-disk buffering for streamed response bodies.
//!
//! A [`GrowableSink`] accumulates bytes in memory until the configured
//! threshold would be exceeded, then moves everything written so far into a
//! temp file and keeps appending there. Once spooled it never returns to
//! memory. [`GrowableSink::finish`] yields a [`ResponseBody`].
//!
//! Spool files are named `crawler-fetch-*.out` so leftovers from a crash are easy
//! to spot. A spooled body deletes its file on [`SpooledFile::dispose`] or on drop
//! unless [`SpooledFile::keep`] was called.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Prefix of spool file names.
pub const SPOOL_PREFIX: &str = "crawler-fetch-";

/// Suffix of spool file names.
pub const SPOOL_SUFFIX: &str = ".out";

/// Where a sink currently keeps its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Bytes are held in memory.
    Memory,
    /// Bytes have been spilled to a temp file.
    Spooled,
}

enum SinkState {
    Memory(Vec<u8>),
    Spooled {
        // Owns the path; deleted on drop until `finish` persists it.
        file: NamedTempFile,
        writer: BufWriter<File>,
    },
}

/// Buffer that starts in memory and spills to disk past a threshold.
pub struct GrowableSink {
    threshold: usize,
    dir: PathBuf,
    written: u64,
    state: SinkState,
}

impl fmt::Debug for GrowableSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowableSink")
            .field("threshold", &self.threshold)
            .field("mode", &self.mode())
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl GrowableSink {
    /// Creates a sink keeping up to `threshold` bytes in memory and spooling to
    /// files in `dir` beyond that.
    #[must_use]
    pub fn new(threshold: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            threshold,
            dir: dir.into(),
            written: 0,
            state: SinkState::Memory(Vec::new()),
        }
    }

    /// Current storage mode.
    #[must_use]
    pub fn mode(&self) -> SinkMode {
        match self.state {
            SinkState::Memory(_) => SinkMode::Memory,
            SinkState::Spooled { .. } => SinkMode::Spooled,
        }
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.written
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Appends `chunk`, spilling to disk first if it would cross the threshold.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the spool file cannot be created or written.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let SinkState::Memory(buf) = &self.state
            && buf.len() + chunk.len() > self.threshold
        {
            self.spill().await?;
        }
        match &mut self.state {
            SinkState::Memory(buf) => buf.extend_from_slice(chunk),
            SinkState::Spooled { writer, .. } => writer.write_all(chunk).await?,
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn spill(&mut self) -> io::Result<()> {
        let file = tempfile::Builder::new()
            .prefix(SPOOL_PREFIX)
            .suffix(SPOOL_SUFFIX)
            .tempfile_in(&self.dir)?;
        let mut writer = BufWriter::new(File::from_std(file.reopen()?));
        if let SinkState::Memory(buf) = &self.state {
            writer.write_all(buf).await?;
        }
        debug!(
            path = %file.path().display(),
            buffered = self.written,
            threshold = self.threshold,
            "spooling response body to disk"
        );
        self.state = SinkState::Spooled { file, writer };
        Ok(())
    }

    /// Flushes and returns the buffered body.
    ///
    /// # Errors
    ///
    /// Returns an IO error if flushing or persisting the spool file fails. The
    /// spool file is removed in that case.
    pub async fn finish(self) -> io::Result<ResponseBody> {
        match self.state {
            SinkState::Memory(buf) => Ok(ResponseBody::Memory(Bytes::from(buf))),
            SinkState::Spooled { file, mut writer } => {
                writer.flush().await?;
                writer.into_inner().sync_all().await?;
                let path = file.into_temp_path().keep().map_err(|e| e.error)?;
                Ok(ResponseBody::Spooled(SpooledFile::new(path, self.written)))
            }
        }
    }
}

/// A body spooled to a temp file.
#[derive(Debug)]
pub struct SpooledFile {
    path: PathBuf,
    len: u64,
    delete_on_dispose: bool,
}

impl SpooledFile {
    /// Wraps an existing file flagged for deletion on dispose.
    #[must_use]
    pub fn new(path: PathBuf, len: u64) -> Self {
        Self {
            path,
            len,
            delete_on_dispose: true,
        }
    }

    /// Path of the spool file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file content.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for an empty file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether disposing deletes the file.
    #[must_use]
    pub fn delete_on_dispose(&self) -> bool {
        self.delete_on_dispose
    }

    /// Takes ownership of the file; it will no longer be deleted.
    #[must_use]
    pub fn keep(mut self) -> PathBuf {
        self.delete_on_dispose = false;
        std::mem::take(&mut self.path)
    }

    /// Deletes the file if flagged for deletion.
    ///
    /// # Errors
    ///
    /// Returns the IO error from removing the file. A file that is already gone
    /// is not an error.
    pub fn dispose(mut self) -> io::Result<()> {
        let result = self.remove();
        self.delete_on_dispose = false;
        result
    }

    fn remove(&self) -> io::Result<()> {
        if !self.delete_on_dispose {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for SpooledFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "failed to delete spool file");
        }
    }
}

/// A materialized body: either bytes in memory or a spool file, never both.
#[derive(Debug)]
pub enum ResponseBody {
    /// Body held in memory.
    Memory(Bytes),
    /// Body spooled to disk.
    Spooled(SpooledFile),
}

impl ResponseBody {
    /// An empty in-memory body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Memory(Bytes::new())
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::Spooled(file) => file.len(),
        }
    }

    /// Returns true for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the body is held in memory.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// The spool file, if the body was spooled.
    #[must_use]
    pub fn spooled_file(&self) -> Option<&SpooledFile> {
        match self {
            Self::Spooled(file) => Some(file),
            Self::Memory(_) => None,
        }
    }

    /// Reads up to `limit` leading bytes.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the spool file cannot be read.
    pub async fn head(&self, limit: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::Memory(bytes) => Ok(bytes[..bytes.len().min(limit)].to_vec()),
            Self::Spooled(file) => {
                let handle = File::open(file.path()).await?;
                let mut head = Vec::with_capacity(limit);
                handle.take(limit as u64).read_to_end(&mut head).await?;
                Ok(head)
            }
        }
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the spool file cannot be read.
    pub async fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            Self::Memory(bytes) => Ok(bytes.clone()),
            Self::Spooled(file) => Ok(Bytes::from(tokio::fs::read(file.path()).await?)),
        }
    }

    /// Releases the body, deleting a spool file flagged for deletion.
    ///
    /// # Errors
    ///
    /// Returns the IO error from deleting the spool file.
    pub fn dispose(self) -> io::Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::Spooled(file) => file.dispose(),
        }
    }
}
