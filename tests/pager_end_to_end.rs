use std::sync::Arc;

use cobaltdb::{Backend, BufferPool, FileBackend, MemoryBackend, PageType};
use tempfile::tempdir;

const HDR: usize = 16;

#[test]
fn allocate_write_flush_and_read_back() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    {
        let pool = BufferPool::new(Arc::clone(&backend), 4).expect("pool");
        let page = pool.new_page(PageType::Leaf).expect("allocate page");
        assert_eq!(page.id(), 1);
        assert!(page.page().is_dirty());
        assert_eq!(page.page().pin_count(), 1);

        {
            let mut data = page.write();
            data[HDR..HDR + 2].copy_from_slice(b"hi");
        }
        pool.flush_page(&page).expect("flush page");
        assert!(!page.page().is_dirty());
        drop(page);
        pool.close().expect("close pool");
    }

    // A second pool over the same backend must see the flushed bytes.
    let pool = BufferPool::new(backend, 4).expect("reopen pool");
    let page = pool.get_page(1).expect("read page");
    let data = page.read();
    assert_eq!(&data[HDR..HDR + 2], b"hi");
}

#[test]
fn lru_eviction_prefers_the_coldest_unpinned_page() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let pool = BufferPool::new(backend, 2).expect("pool");

    for expected in 1..=3u32 {
        let page = pool.new_page(PageType::Leaf).expect("allocate");
        assert_eq!(page.id(), expected);
        let mut data = page.write();
        data[HDR] = expected as u8;
    }
    // Capacity 2: allocating page 3 evicted (and flushed) page 1.
    assert_eq!(pool.page_count(), 2);

    // Faulting page 1 back in reads the flushed image and evicts page 2,
    // now the least recently used of the unpinned set.
    let page = pool.get_page(1).expect("refault page 1");
    assert_eq!(page.read()[HDR], 1);
    assert_eq!(pool.page_count(), 2);

    let page = pool.get_page(2).expect("refault page 2");
    assert_eq!(page.read()[HDR], 2);
}

#[test]
fn file_backed_pool_survives_reopen() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("pages.db");
    {
        let backend: Arc<dyn Backend> = Arc::new(FileBackend::open(&path).expect("backend"));
        let pool = BufferPool::new(backend, 8).expect("pool");
        let page = pool.new_page(PageType::Leaf).expect("allocate");
        {
            let mut data = page.write();
            data[HDR..HDR + 9].copy_from_slice(b"persisted");
        }
        drop(page);
        pool.close().expect("close");
    }

    let backend: Arc<dyn Backend> = Arc::new(FileBackend::open(&path).expect("reopen backend"));
    let pool = BufferPool::new(backend, 8).expect("reopen pool");
    let page = pool.get_page(1).expect("get page");
    assert_eq!(&page.read()[HDR..HDR + 9], b"persisted");
}
