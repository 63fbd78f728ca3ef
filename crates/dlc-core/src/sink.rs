//! Byte sinks - where downloaded bytes end up
//!
//! A task writes its chunks, in order, into exactly one sink. The default
//! sink is a file; callers can hand in their own (for example a
//! [`MemorySink`]) through [`SharedSink`].

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consumer of downloaded bytes
pub trait Sink: Send {
    /// Save the next bytes of the stream. A return value smaller than
    /// `data.len()` is a short write.
    fn save(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Current size of the saved byte stream
    fn seek_pos(&mut self) -> io::Result<u64>;

    /// Drop everything saved so far
    fn truncate(&mut self) -> io::Result<()>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// A sink owned by the caller and borrowed by a task
pub type SharedSink = Arc<Mutex<dyn Sink>>;

/// Wrap a sink so it can be handed to the downloader and read back afterwards
pub fn shared<S: Sink + 'static>(sink: S) -> Arc<Mutex<S>> {
    Arc::new(Mutex::new(sink))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "sink is closed")
}

// ============================================================================
// File sink
// ============================================================================

/// File-backed sink, opened for append
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    /// Open (or create) `path` for appending, creating parent directories
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Position at end of file so `seek_pos` reports what is already there
    pub fn move_to_end(&mut self) -> io::Result<u64> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.seek(SeekFrom::End(0))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn save(&mut self, data: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.write_all(data)?;
        Ok(data.len())
    }

    fn seek_pos(&mut self) -> io::Result<u64> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.stream_position()
    }

    fn truncate(&mut self) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("Failed to sync {}: {}", self.path.display(), e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// In-memory sink, optionally bounded
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    limit: Option<usize>,
    closed: bool,
}

impl MemorySink {
    /// Growable buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-capacity buffer; saves past `capacity` are short writes
    pub fn bounded(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            limit: Some(capacity),
            closed: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes that still fit before the bound is hit
    pub fn space_left(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.data.len()),
            None => usize::MAX,
        }
    }
}

impl Sink for MemorySink {
    fn save(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }

        let space = self.space_left();
        if data.len() > space {
            debug!(
                "Memory sink can't save all data: size: {} space: {} limit: {:?}",
                data.len(),
                space,
                self.limit
            );
            self.data.extend_from_slice(&data[..space]);
            return Ok(space);
        }

        self.data.extend_from_slice(data);
        Ok(data.len())
    }

    fn seek_pos(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.data.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_memory_sink_short_write() {
        let mut sink = MemorySink::bounded(4);
        assert_eq!(sink.save(b"ab").unwrap(), 2);
        assert_eq!(sink.save(b"cdef").unwrap(), 2);
        assert_eq!(sink.bytes(), b"abcd");
        assert_eq!(sink.save(b"g").unwrap(), 0);
        assert_eq!(sink.seek_pos().unwrap(), 4);
    }

    #[test]
    fn test_memory_sink_truncate_and_close() {
        let mut sink = MemorySink::new();
        sink.save(b"hello").unwrap();
        sink.truncate().unwrap();
        assert!(sink.is_empty());

        sink.save(b"world").unwrap();
        sink.close();
        assert!(sink.is_closed());
        assert!(sink.save(b"!").is_err());
        assert_eq!(sink.bytes(), b"world");
    }

    #[test]
    fn test_file_sink_creates_parent_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/out.bin");

        let mut sink = FileSink::create(&path).unwrap();
        assert_eq!(sink.save(b"Hello").unwrap(), 5);
        assert_eq!(sink.save(b"World").unwrap(), 5);
        assert_eq!(sink.seek_pos().unwrap(), 10);
        sink.close();
        assert!(sink.is_closed());

        assert_eq!(fs::read(&path).unwrap(), b"HelloWorld");
    }

    #[test]
    fn test_file_sink_truncate_resets_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, b"stale content").unwrap();

        let mut sink = FileSink::create(&path).unwrap();
        sink.truncate().unwrap();
        assert_eq!(sink.seek_pos().unwrap(), 0);
        sink.save(b"fresh").unwrap();
        sink.close();

        assert_eq!(fs::read(&path).unwrap(), b"fresh");
    }

    #[test]
    fn test_file_sink_move_to_end_reports_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        fs::write(&path, b"12345").unwrap();

        let mut sink = FileSink::create(&path).unwrap();
        assert_eq!(sink.move_to_end().unwrap(), 5);
        assert_eq!(sink.seek_pos().unwrap(), 5);
        sink.save(b"678").unwrap();
        sink.close();

        assert_eq!(fs::read(&path).unwrap(), b"12345678");
    }

    #[test]
    fn test_closed_file_sink_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path().join("x.bin")).unwrap();
        sink.close();
        assert!(sink.save(b"x").is_err());
        assert!(sink.seek_pos().is_err());
        assert!(sink.truncate().is_err());
    }
}
