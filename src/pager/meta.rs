//! Page 0: file magic, format version, and root pointers.

use std::io::ErrorKind;
use std::ops::Range;

use crate::error::{DbError, Result};
use crate::io::Backend;
use crate::page::PAGE_SIZE;

/// File magic stamped at the start of page 0.
pub const META_MAGIC: [u8; 4] = *b"CBDB";
/// Current on-disk format version.
pub const META_VERSION: u32 = 1;
/// Length of the serialized meta page contents (checksum included).
pub const META_LEN: usize = 36;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_VERSION_RANGE: Range<usize> = 4..8;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_PAGE_COUNT: Range<usize> = 12..16;
const META_FREE_LIST_HEAD: Range<usize> = 16..20;
const META_CATALOG_ROOT: Range<usize> = 20..24;
const META_TXN_COUNTER: Range<usize> = 24..32;
const META_CHECKSUM: Range<usize> = 32..36;

/// Database metadata persisted in page 0.
///
/// The magic, version, and page size are format constants and are not kept
/// here; they are stamped on write and validated on read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Meta {
    /// Total allocated pages, including page 0. Always at least 1.
    pub page_count: u32,
    /// Head of the free-page chain, or 0 when empty.
    pub free_list_head: u32,
    /// Root page of the system catalog, or 0 before it exists.
    pub catalog_root: u32,
    /// Monotonic transaction id source.
    pub txn_counter: u64,
}

impl Meta {
    /// Metadata for a freshly initialized database.
    pub fn new() -> Self {
        Self {
            page_count: 1,
            free_list_head: 0,
            catalog_root: 0,
            txn_counter: 0,
        }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes `meta` into a page-0 image, little-endian, CRC-stamped.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    if buf.len() < META_LEN {
        return Err(DbError::InvalidArgument("meta buffer too small"));
    }
    buf.fill(0);
    buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
    buf[META_VERSION_RANGE].copy_from_slice(&META_VERSION.to_le_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
    buf[META_PAGE_COUNT].copy_from_slice(&meta.page_count.to_le_bytes());
    buf[META_FREE_LIST_HEAD].copy_from_slice(&meta.free_list_head.to_le_bytes());
    buf[META_CATALOG_ROOT].copy_from_slice(&meta.catalog_root.to_le_bytes());
    buf[META_TXN_COUNTER].copy_from_slice(&meta.txn_counter.to_le_bytes());
    let crc = crc32fast::hash(&buf[..META_CHECKSUM.start]);
    buf[META_CHECKSUM].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Decodes and validates a page-0 image.
///
/// Magic or checksum damage fails with [`DbError::Corruption`]; a version or
/// page size that differs from this build fails with the matching
/// unsupported-format error.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_LEN {
        return Err(DbError::Corruption("meta page truncated"));
    }
    if buf[META_MAGIC_RANGE] != META_MAGIC {
        return Err(DbError::Corruption("meta page magic mismatch"));
    }
    let stored_crc = u32::from_le_bytes(buf[META_CHECKSUM].try_into().unwrap());
    let crc = crc32fast::hash(&buf[..META_CHECKSUM.start]);
    if crc != stored_crc {
        return Err(DbError::Corruption("meta page checksum mismatch"));
    }
    let version = u32::from_le_bytes(buf[META_VERSION_RANGE].try_into().unwrap());
    if version != META_VERSION {
        return Err(DbError::UnsupportedVersion(version));
    }
    let page_size = u32::from_le_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    if page_size as usize != PAGE_SIZE {
        return Err(DbError::UnsupportedPageSize(page_size));
    }
    let page_count = u32::from_le_bytes(buf[META_PAGE_COUNT].try_into().unwrap());
    if page_count < 1 {
        return Err(DbError::Corruption("meta page_count is zero"));
    }
    Ok(Meta {
        page_count,
        free_list_head: u32::from_le_bytes(buf[META_FREE_LIST_HEAD].try_into().unwrap()),
        catalog_root: u32::from_le_bytes(buf[META_CATALOG_ROOT].try_into().unwrap()),
        txn_counter: u64::from_le_bytes(buf[META_TXN_COUNTER].try_into().unwrap()),
    })
}

/// Stamps a fresh meta page onto an empty backend and syncs it.
pub fn create_meta(backend: &dyn Backend) -> Result<Meta> {
    let meta = Meta::new();
    let mut buf = vec![0u8; PAGE_SIZE];
    write_meta_page(&mut buf, &meta)?;
    backend.write_at(0, &buf)?;
    backend.sync()?;
    Ok(meta)
}

/// Loads and validates the meta page from an existing backend.
pub fn load_meta(backend: &dyn Backend) -> Result<Meta> {
    let mut buf = vec![0u8; PAGE_SIZE];
    match backend.read_at(0, &mut buf) {
        Ok(()) => {}
        Err(DbError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(DbError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    read_meta_page(&buf)
}

/// Rewrites page 0 with the given metadata. Durability is the caller's
/// concern; commit and checkpoint paths sync the backend.
pub fn store_meta(backend: &dyn Backend, meta: &Meta) -> Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE];
    write_meta_page(&mut buf, meta)?;
    backend.write_at(0, &buf)
}
