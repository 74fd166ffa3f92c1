use std::io;
use thiserror::Error;

/// Convenience alias used by every fallible API in the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by the storage core.
#[derive(Debug, Error)]
pub enum DbError {
    /// An underlying backend or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A byte offset could not be represented or computed.
    #[error("invalid offset: {0}")]
    InvalidOffset(&'static str),
    /// A truncation length could not be represented.
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),
    /// The backend was used after `close`.
    #[error("backend is closed")]
    BackendClosed,
    /// The buffer pool was asked for a page id it never hands out.
    #[error("invalid page id: {0}")]
    InvalidPageId(u32),
    /// Every resident page is pinned; nothing can be evicted.
    #[error("buffer pool full: all pages pinned")]
    BufferFull,
    /// On-disk bytes failed a magic, checksum, or structural check.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// The meta page was written by an incompatible format version.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),
    /// The meta page was written with a different page size.
    #[error("unsupported page size: {0}")]
    UnsupportedPageSize(u32),
    /// A write-ahead log record failed its CRC or structural check.
    #[error("write-ahead log corrupted: {0}")]
    WalCorrupted(&'static str),
    /// The write-ahead log was used after `close`.
    #[error("write-ahead log is closed")]
    WalClosed,
    /// A caller-supplied argument violated an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
