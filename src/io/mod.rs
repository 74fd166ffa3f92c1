//! Byte-level backends beneath the buffer pool.
//!
//! A [`Backend`] is a random-access byte store with positioned reads and
//! writes. Two implementations are provided: [`FileBackend`] over a regular
//! file and [`MemoryBackend`] over a growable in-memory vector.

use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{DbError, Result};

/// Positioned byte store consumed by the buffer pool and the meta page codec.
///
/// Reads are exact: a read that cannot fill the whole buffer fails with an
/// [`io::ErrorKind::UnexpectedEof`] error, which callers use to detect pages
/// that have never been materialized. Writes are all-or-error and may grow
/// the store past its current length.
pub trait Backend: Send + Sync {
    /// Fills `buf` with bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes all of `buf` at `offset`, growing the store if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    /// Durably commits every prior write.
    fn sync(&self) -> Result<()>;
    /// Bytes reached by the highest successful write.
    fn len(&self) -> Result<u64>;
    /// Returns true when nothing has been written yet.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the store to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Closes the store. Subsequent operations fail with
    /// [`DbError::BackendClosed`]. Closing twice is a no-op.
    fn close(&self) -> Result<()>;
}

fn end_offset(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or(DbError::InvalidOffset("byte range end overflows u64"))
}

/// In-memory backend over a growable byte vector.
///
/// `sync` is a no-op; the store lives and dies with the process.
pub struct MemoryBackend {
    bytes: RwLock<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            bytes: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::BackendClosed);
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let end = end_offset(offset, buf.len())?;
        let bytes = self.bytes.read();
        if end > bytes.len() as u64 {
            return Err(DbError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of memory backend",
            )));
        }
        buf.copy_from_slice(&bytes[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let end = end_offset(offset, buf.len())?;
        let end = usize::try_from(end)
            .map_err(|_| DbError::InvalidOffset("byte range exceeds addressable memory"))?;
        let mut bytes = self.bytes.write();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.ensure_open()
    }

    fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.ensure_open()?;
        let len = usize::try_from(len)
            .map_err(|_| DbError::InvalidSize("truncation length exceeds addressable memory"))?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// File-backed store using positioned I/O.
///
/// The file is opened read/write and created if absent. Positioned reads and
/// writes need no seek, so concurrent readers proceed without coordination;
/// the kernel serializes overlapping writes.
pub struct FileBackend {
    file: std::fs::File,
    closed: AtomicBool,
}

impl FileBackend {
    /// Opens or creates the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::BackendClosed);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_exact_at(&self, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = self.file.read_at(dst, offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            dst = &mut dst[read..];
            offset += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = self.file.seek_read(dst, offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            dst = &mut dst[read..];
            offset += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_all_at(&self, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !src.is_empty() {
            let written = self.file.write_at(src, offset)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            offset += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = self.file.seek_write(src, offset)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            offset += written as u64;
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        end_offset(offset, buf.len())?;
        self.read_exact_at(offset, buf).map_err(DbError::from)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        end_offset(offset, buf.len())?;
        self.write_all_at(offset, buf).map_err(DbError::from)
    }

    fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.file.sync_data().map_err(DbError::from)
    }

    fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.ensure_open()?;
        self.file.set_len(len).map_err(DbError::from)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_write_read_roundtrip() {
        let backend = MemoryBackend::new();
        backend.write_at(0, b"hello mundo").unwrap();
        let mut buf = vec![0u8; 11];
        backend.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello mundo");
        assert_eq!(backend.len().unwrap(), 11);
    }

    #[test]
    fn memory_write_past_end_grows() {
        let backend = MemoryBackend::new();
        backend.write_at(100, b"xy").unwrap();
        assert_eq!(backend.len().unwrap(), 102);
        let mut buf = [0u8; 2];
        backend.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"xy");
        // the gap reads back zeroed
        let mut gap = [1u8; 4];
        backend.read_at(0, &mut gap).unwrap();
        assert_eq!(gap, [0u8; 4]);
    }

    #[test]
    fn memory_read_past_eof_returns_error() {
        let backend = MemoryBackend::new();
        let mut buf = [0u8; 8];
        let err = backend.read_at(0, &mut buf).unwrap_err();
        match err {
            DbError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn memory_operations_after_close_fail() {
        let backend = MemoryBackend::new();
        backend.write_at(0, b"data").unwrap();
        backend.close().unwrap();
        backend.close().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            backend.read_at(0, &mut buf),
            Err(DbError::BackendClosed)
        ));
        assert!(matches!(
            backend.write_at(0, b"data"),
            Err(DbError::BackendClosed)
        ));
        assert!(matches!(backend.sync(), Err(DbError::BackendClosed)));
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let backend = MemoryBackend::new();
        let mut buf = [0u8; 8];
        let err = backend.read_at(u64::MAX - 2, &mut buf).unwrap_err();
        assert!(matches!(err, DbError::InvalidOffset(_)));
    }

    #[test]
    fn memory_truncate_shrinks_and_extends() {
        let backend = MemoryBackend::new();
        backend.write_at(0, b"abcdef").unwrap();
        backend.truncate(3).unwrap();
        assert_eq!(backend.len().unwrap(), 3);
        backend.truncate(5).unwrap();
        let mut buf = [9u8; 5];
        backend.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc\0\0");
    }

    #[test]
    fn file_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backend.bin");
        let backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"persisted").unwrap();
        backend.sync().unwrap();

        let mut buf = vec![0u8; 9];
        backend.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
        assert!(backend.len().unwrap() >= 9);
    }

    #[test]
    fn file_read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backend.bin");
        let backend = FileBackend::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let err = backend.read_at(0, &mut buf).unwrap_err();
        match err {
            DbError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backend.bin");
        {
            let backend = FileBackend::open(&path).unwrap();
            backend.write_at(4096, &[42u8; 64]).unwrap();
            backend.sync().unwrap();
            backend.close().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        let mut buf = [0u8; 64];
        backend.read_at(4096, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 42));
    }
}
