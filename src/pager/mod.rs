//! Buffer pool: a bounded cache of pages with pinning and LRU eviction.
//!
//! The pool owns every resident page. Callers receive a [`PageGuard`] that
//! keeps the page pinned; dropping the guard unpins it. Pinned pages are
//! never evicted. Unpinned dirty pages are flushed to the backend before
//! eviction.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::io::Backend;
use crate::page::{init_page, PageType, PAGE_SIZE};

pub mod meta;
pub mod wal;

use wal::Wal;

/// Page number within the data file. Page 0 is the meta page and is managed
/// through [`meta`], never through the pool.
pub type PageId = u32;

/// A resident page. Exactly one instance exists per cached page id; all
/// guards for that id share it and its pin counter.
pub struct CachedPage {
    id: PageId,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl CachedPage {
    fn from_bytes(id: PageId, bytes: Box<[u8]>, dirty: bool) -> Self {
        Self {
            id,
            data: RwLock::new(bytes),
            dirty: AtomicBool::new(dirty),
            pins: AtomicU32::new(0),
        }
    }

    /// Page number.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// True when the in-memory bytes differ from the backend.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Number of outstanding pins.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// Pin guard over a cached page.
///
/// The page stays resident for as long as the guard lives; dropping it
/// decrements the pin counter. Do not hold a data guard returned by
/// [`read`](Self::read) or [`write`](Self::write) across other pool calls —
/// flush and eviction take the same per-page lock.
pub struct PageGuard {
    page: Arc<CachedPage>,
}

impl PageGuard {
    /// Page number.
    pub fn id(&self) -> PageId {
        self.page.id
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.page.data.read()
    }

    /// Exclusive access to the page bytes; marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        // Mark under the data lock: write-back clears the flag while holding
        // the read side, so a mark racing a flush cannot be lost.
        let guard = self.page.data.write();
        self.page.mark_dirty();
        guard
    }

    /// The shared page this guard pins.
    pub fn page(&self) -> &Arc<CachedPage> {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let prev = self.page.pins.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "pin count underflow");
    }
}

struct PoolInner {
    cache: LruCache<PageId, Arc<CachedPage>>,
}

/// Bounded in-memory cache of pages over a [`Backend`].
pub struct BufferPool {
    backend: Arc<dyn Backend>,
    capacity: usize,
    inner: Mutex<PoolInner>,
    wal: Mutex<Option<Arc<Wal>>>,
}

impl BufferPool {
    /// Creates a pool holding at most `capacity` resident pages.
    pub fn new(backend: Arc<dyn Backend>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DbError::InvalidArgument(
                "pool capacity must be greater than zero",
            ));
        }
        Ok(Self {
            backend,
            capacity,
            inner: Mutex::new(PoolInner {
                cache: LruCache::unbounded(),
            }),
            wal: Mutex::new(None),
        })
    }

    /// The backend this pool reads and flushes through.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Attaches a write-ahead log for the commit and checkpoint paths above
    /// the pool to reach.
    pub fn set_wal(&self, wal: Arc<Wal>) {
        *self.wal.lock() = Some(wal);
    }

    /// The attached write-ahead log, if any.
    pub fn wal(&self) -> Option<Arc<Wal>> {
        self.wal.lock().clone()
    }

    /// Pins and returns the page with the given id, loading it from the
    /// backend on a miss. A page the backend has never materialized is
    /// synthesized fresh with type [`PageType::FreeList`].
    ///
    /// Concurrent calls for the same id converge on the same [`CachedPage`]
    /// instance.
    pub fn get_page(&self, id: PageId) -> Result<PageGuard> {
        if id == 0 {
            return Err(DbError::InvalidPageId(0));
        }
        {
            let mut inner = self.inner.lock();
            if let Some(page) = inner.cache.get(&id) {
                return Ok(pin(page));
            }
        }

        // Miss: read outside the pool lock, then re-check before inserting
        // in case a concurrent call loaded the same page first.
        let bytes = self.load_page_bytes(id)?;
        let mut inner = self.inner.lock();
        if let Some(page) = inner.cache.get(&id) {
            return Ok(pin(page));
        }
        self.make_room(&mut inner)?;
        let page = Arc::new(CachedPage::from_bytes(id, bytes, false));
        inner.cache.put(id, Arc::clone(&page));
        Ok(pin(&page))
    }

    /// Allocates the smallest page id >= 1 not currently resident, inserts a
    /// fresh page of the given type, and returns it dirty and pinned.
    ///
    /// The policy is deliberately weak: an id flushed and evicted may be
    /// re-selected. Callers needing stable allocation consult the free list
    /// rooted in the meta page.
    pub fn new_page(&self, page_type: PageType) -> Result<PageGuard> {
        let mut inner = self.inner.lock();
        self.make_room(&mut inner)?;
        let mut id: PageId = 1;
        while inner.cache.contains(&id) {
            id += 1;
        }
        let mut bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
        init_page(&mut bytes, id, page_type)?;
        let page = Arc::new(CachedPage::from_bytes(id, bytes, true));
        inner.cache.put(id, Arc::clone(&page));
        debug!(page_id = id, ?page_type, "pager.new_page");
        Ok(pin(&page))
    }

    /// Writes the page to the backend if dirty and clears the dirty flag.
    /// Does not sync.
    pub fn flush_page(&self, page: &PageGuard) -> Result<()> {
        self.write_back(page.page())
    }

    /// Flushes every resident dirty page, then syncs the backend.
    pub fn flush_all(&self) -> Result<()> {
        let inner = self.inner.lock();
        for (_, page) in inner.cache.iter() {
            self.write_back(page)?;
        }
        self.backend.sync()
    }

    /// Number of resident pages.
    pub fn page_count(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Flushes everything. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.flush_all()
    }

    fn write_back(&self, page: &Arc<CachedPage>) -> Result<()> {
        if !page.is_dirty() {
            return Ok(());
        }
        let offset = page_offset(page.id)?;
        let data = page.data.read();
        self.backend.write_at(offset, &data)?;
        // Cleared while the read guard is held; a writer marking the page
        // dirty again must first win the write lock, so its mark lands
        // strictly after this clear.
        page.clear_dirty();
        Ok(())
    }

    /// Evicts until an insert fits. The scan walks the LRU order from the
    /// least-recently-used end; the first unpinned page is the victim.
    fn make_room(&self, inner: &mut PoolInner) -> Result<()> {
        while inner.cache.len() >= self.capacity {
            let victim = inner
                .cache
                .iter()
                .rev()
                .find(|(_, page)| page.pin_count() == 0)
                .map(|(id, page)| (*id, Arc::clone(page)));
            let (id, page) = victim.ok_or(DbError::BufferFull)?;
            // A failed flush aborts the caller; the victim stays resident
            // and dirty.
            self.write_back(&page)?;
            inner.cache.pop(&id);
            debug!(page_id = id, "pager.evict");
        }
        Ok(())
    }

    fn load_page_bytes(&self, id: PageId) -> Result<Box<[u8]>> {
        let offset = page_offset(id)?;
        let mut bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
        match self.backend.read_at(offset, &mut bytes) {
            Ok(()) => Ok(bytes),
            Err(DbError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                // Lazily materialize pages the file has not reached yet.
                init_page(&mut bytes, id, PageType::FreeList)?;
                debug!(page_id = id, "pager.synthesize");
                Ok(bytes)
            }
            Err(err) => Err(err),
        }
    }
}

fn pin(page: &Arc<CachedPage>) -> PageGuard {
    page.pins.fetch_add(1, Ordering::SeqCst);
    PageGuard {
        page: Arc::clone(page),
    }
}

fn page_offset(id: PageId) -> Result<u64> {
    u64::from(id)
        .checked_mul(PAGE_SIZE as u64)
        .ok_or(DbError::InvalidOffset("page offset overflow"))
}
