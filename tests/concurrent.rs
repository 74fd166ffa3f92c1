use std::sync::{Arc, Barrier};
use std::thread;

use cobaltdb::{Backend, BufferPool, DbError, MemoryBackend, PageType, Wal, WalRecord};
use tempfile::tempdir;

const NUM_THREADS: usize = 8;

fn shared_pool(capacity: usize) -> Arc<BufferPool> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    Arc::new(BufferPool::new(backend, capacity).expect("pool"))
}

#[test]
fn concurrent_get_page_returns_one_instance() {
    let pool = shared_pool(8);
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for _ in 0..NUM_THREADS {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let guard = pool.get_page(1).expect("get page");
            Arc::as_ptr(guard.page()) as usize
        }));
    }

    let pointers: Vec<usize> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();
    assert!(pointers.windows(2).all(|pair| pair[0] == pair[1]));

    // Every guard is gone; the pin count drains back to zero.
    let guard = pool.get_page(1).expect("get page");
    assert_eq!(guard.page().pin_count(), 1);
}

#[test]
fn parallel_writers_on_disjoint_ranges() {
    let pool = shared_pool(8);
    {
        let _page = pool.new_page(PageType::Leaf).expect("allocate page 1");
    }
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for round in 0..100u8 {
                let guard = pool.get_page(1).expect("get page");
                let mut data = guard.write();
                data[16 + thread_id] = round;
            }
        }));
    }
    for handle in handles {
        handle.join().expect("join");
    }

    let guard = pool.get_page(1).expect("get page");
    let data = guard.read();
    for thread_id in 0..NUM_THREADS {
        assert_eq!(data[16 + thread_id], 99);
    }
}

#[test]
fn pinned_page_survives_cache_pressure() {
    let pool = shared_pool(2);
    let pinned = pool.new_page(PageType::Leaf).expect("allocate");
    {
        let mut data = pinned.write();
        data[16..20].copy_from_slice(b"mine");
    }

    for id in 10..60u32 {
        let _transient = pool.get_page(id).expect("fault transient page");
    }

    assert!(pool.page_count() <= 2);
    assert_eq!(&pinned.read()[16..20], b"mine");
    assert_eq!(pinned.page().pin_count(), 1);
}

#[test]
fn fully_pinned_pool_reports_buffer_full() {
    let pool = shared_pool(2);
    let _first = pool.new_page(PageType::Leaf).expect("first");
    let _second = pool.new_page(PageType::Leaf).expect("second");
    assert!(matches!(pool.get_page(7), Err(DbError::BufferFull)));
    assert!(matches!(
        pool.new_page(PageType::Leaf),
        Err(DbError::BufferFull)
    ));
}

#[test]
fn wal_appends_serialize_across_threads() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("db.wal");
    let wal = Arc::new(Wal::open(&path).expect("open wal"));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS as u64 {
        let wal = Arc::clone(&wal);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..25u16 {
                wal.append(&WalRecord::insert(thread_id, 1, 16 + i, vec![i as u8]))
                    .expect("append");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("join");
    }

    assert_eq!(wal.lsn(), (NUM_THREADS * 25) as u64);
    wal.close().expect("close");

    let reopened = Wal::open(&path).expect("reopen");
    assert_eq!(reopened.lsn(), (NUM_THREADS * 25) as u64);
}
