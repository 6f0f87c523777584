//! The spillable buffer: a bounded-memory byte sink that overflows to a
//! temporary file once a caller-configured limit is exceeded.
//!
//! Used for both the decoded response body and the verbatim raw wire bytes
//! (status line, headers, chunk framing, trailers). Exactly one of
//! "mem-only" or "spilled-to-file" is active at any moment; once spilled, no
//! bytes remain in memory. All operations are serialized under a single
//! async mutex so `Close`/`Reset` are safe against concurrent writers.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Error;

const TEMP_PREFIX: &str = "rawhttp-buffer-";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
struct Inner {
    mem: Vec<u8>,
    file: Option<(File, PathBuf)>,
    total_size: u64,
    limit: u64,
    closed: bool,
}

impl Inner {
    fn new(limit: u64) -> Self {
        Self {
            mem: Vec::new(),
            file: None,
            total_size: 0,
            limit,
            closed: false,
        }
    }
}

/// A single-producer, bounded-memory, disk-overflowing byte sink.
#[derive(Debug, Clone)]
pub struct SpillableBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl SpillableBuffer {
    /// Creates a new buffer that spills to disk past `limit` bytes.
    /// `limit = 0` means "spill immediately" (i.e. always file-backed);
    /// this matches callers who want zero in-memory retention.
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(limit))),
        }
    }

    /// Appends `data`, spilling to a temp file the first time the limit
    /// would be exceeded.
    pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut g = self.inner.lock().await;
        if g.closed {
            return Err(Error::io("write", "write to closed spillable buffer"));
        }
        if g.file.is_some() {
            let (file, _) = g.file.as_mut().expect("file checked Some above");
            file.write_all(data)
                .await
                .map_err(|e| Error::io("write", "spilled buffer write failed").with_cause(e))?;
            g.total_size += data.len() as u64;
            return Ok(());
        }

        let would_be = g.total_size + data.len() as u64;
        if would_be <= g.limit {
            g.mem.extend_from_slice(data);
            g.total_size = would_be;
            return Ok(());
        }

        // Spill: create the temp file and record its path *before* copying
        // existing memory bytes, so cleanup is always possible even if the
        // copy itself fails partway through.
        let path = temp_path();
        let mut file = File::create(&path)
            .await
            .map_err(|e| Error::io("write", "create temp spill file").with_cause(e))?;

        let existing = std::mem::take(&mut g.mem);
        let write_result = file.write_all(&existing).await;
        if let Err(e) = write_result {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(Error::io("write", "flush memory bytes to spill file").with_cause(e));
        }
        if let Err(e) = file.write_all(data).await {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(Error::io("write", "write new bytes to spill file").with_cause(e));
        }

        g.total_size = would_be;
        g.file = Some((file, path));
        Ok(())
    }

    /// Total bytes written so far (memory + spilled).
    pub async fn len(&self) -> u64 {
        self.inner.lock().await.total_size
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns a fresh, independent reader positioned at the start of the
    /// buffered data.
    pub async fn reader(&self) -> Result<BufferReader, Error> {
        let mut g = self.inner.lock().await;
        if g.closed {
            return Err(Error::io("read", "read from closed spillable buffer"));
        }
        if let Some((file, path)) = g.file.as_mut() {
            file.sync_all()
                .await
                .map_err(|e| Error::io("read", "fsync spill file").with_cause(e))?;
            let mut reopened = File::open(path)
                .await
                .map_err(|e| Error::io("read", "reopen spill file").with_cause(e))?;
            reopened
                .seek(SeekFrom::Start(0))
                .await
                .map_err(|e| Error::io("read", "seek spill file").with_cause(e))?;
            Ok(BufferReader::File(reopened))
        } else {
            Ok(BufferReader::Mem(std::io::Cursor::new(g.mem.clone())))
        }
    }

    /// Reads the whole buffer into a single `Vec<u8>`. Convenience wrapper
    /// around [`Self::reader`] for callers that do not need streaming.
    pub async fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let mut reader = self.reader().await?;
        let mut out = Vec::with_capacity(self.len().await as usize);
        reader
            .read_to_end(&mut out)
            .await
            .map_err(|e| Error::io("read", "drain spillable buffer").with_cause(e))?;
        Ok(out)
    }

    /// Idempotent: closes and unlinks any temp file, marks the buffer
    /// closed. Further writes fail.
    pub async fn close(&self) {
        let mut g = self.inner.lock().await;
        g.closed = true;
        if let Some((_file, path)) = g.file.take() {
            let _ = std::fs::remove_file(&path);
        }
        g.mem.clear();
    }

    /// Closes and re-arms the buffer for reuse with the same limit.
    pub async fn reset(&self) {
        let mut g = self.inner.lock().await;
        if let Some((_file, path)) = g.file.take() {
            let _ = std::fs::remove_file(&path);
        }
        g.mem.clear();
        g.total_size = 0;
        g.closed = false;
    }

    /// True once the buffer has spilled to disk.
    pub async fn is_spilled(&self) -> bool {
        self.inner.lock().await.file.is_some()
    }
}

fn temp_path() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("{TEMP_PREFIX}{suffix:016x}{TEMP_SUFFIX}"))
}

/// A single-use reader over a [`SpillableBuffer`] snapshot.
pub enum BufferReader {
    Mem(std::io::Cursor<Vec<u8>>),
    File(File),
}

impl tokio::io::AsyncRead for BufferReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        match self.get_mut() {
            BufferReader::Mem(c) => {
                let remaining = c.get_ref().len() as u64 - c.position();
                let to_copy = remaining.min(buf.remaining() as u64) as usize;
                let pos = c.position() as usize;
                buf.put_slice(&c.get_ref()[pos..pos + to_copy]);
                c.set_position((pos + to_copy) as u64);
                std::task::Poll::Ready(Ok(()))
            }
            BufferReader::File(f) => Pin::new(f).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_in_memory_below_limit() {
        let buf = SpillableBuffer::new(1024);
        buf.write(b"hello").await.unwrap();
        assert!(!buf.is_spilled().await);
        assert_eq!(buf.to_vec().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn spills_past_limit_and_preserves_bytes() {
        let buf = SpillableBuffer::new(4);
        buf.write(b"hell").await.unwrap();
        assert!(!buf.is_spilled().await);
        buf.write(b"o world").await.unwrap();
        assert!(buf.is_spilled().await);
        assert_eq!(buf.to_vec().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn close_removes_temp_file() {
        let buf = SpillableBuffer::new(1);
        buf.write(b"spill-me").await.unwrap();
        assert!(buf.is_spilled().await);

        let path = {
            let g = buf.inner.lock().await;
            g.file.as_ref().map(|(_, p)| p.clone())
        }
        .unwrap();
        assert!(path.exists());

        buf.close().await;
        assert!(!path.exists());

        // further writes fail
        assert!(buf.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn reset_reopens_buffer_for_reuse() {
        let buf = SpillableBuffer::new(1);
        buf.write(b"spill").await.unwrap();
        assert!(buf.is_spilled().await);
        buf.reset().await;
        assert_eq!(buf.len().await, 0);
        buf.write(b"y").await.unwrap();
        assert!(buf.is_spilled().await);
    }
}
