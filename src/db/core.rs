use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{DbError, Result};
use crate::io::{Backend, FileBackend, MemoryBackend};
use crate::page::{PageType, PAGE_SIZE};
use crate::pager::meta::{create_meta, load_meta, store_meta, Meta};
use crate::pager::wal::{RecordType, TxnId, Wal, WalRecord};
use crate::pager::{BufferPool, PageId};

use super::config::Config;
use super::transaction::{TxState, TxnSlot};

/// Storage façade the SQL catalog and executor drive.
///
/// Owns the backend, the buffer pool, and (optionally) the write-ahead log,
/// and carries the connection's transaction slot. Row encoding is the
/// executor's business: mutations arrive here as raw byte-range overwrites
/// on pages.
pub struct Database {
    backend: Arc<dyn Backend>,
    pool: Arc<BufferPool>,
    meta: Mutex<Meta>,
    txn: Mutex<TxnSlot>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("meta", &self.meta)
            .field("txn", &self.txn)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Database {
    /// Opens or creates the database at `path`.
    ///
    /// An empty file is stamped with a fresh meta page; an existing one must
    /// carry valid magic, version, and page size. When the configuration
    /// asks for a WAL, the sibling `<path>.wal` file is opened and any
    /// committed work in it is replayed before the database is handed out.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let backend: Arc<dyn Backend> = Arc::new(FileBackend::open(path)?);
        let db = Self::bootstrap(backend, &config)?;
        if config.wal {
            db.set_wal(wal_path(path))?;
        }
        Ok(db)
    }

    /// Opens a database over a fresh in-memory backend. No WAL file is
    /// created; attach one later with [`set_wal`](Self::set_wal) if needed.
    pub fn in_memory(config: Config) -> Result<Self> {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        Self::bootstrap(backend, &config)
    }

    fn bootstrap(backend: Arc<dyn Backend>, config: &Config) -> Result<Self> {
        let meta = if backend.is_empty()? {
            create_meta(backend.as_ref())?
        } else {
            load_meta(backend.as_ref())?
        };
        let pool = Arc::new(BufferPool::new(Arc::clone(&backend), config.pool_capacity)?);
        debug!(
            page_count = meta.page_count,
            txn_counter = meta.txn_counter,
            "database opened"
        );
        Ok(Self {
            backend,
            pool,
            meta: Mutex::new(meta),
            txn: Mutex::new(TxnSlot::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens the log at `path`, replays committed transactions into the
    /// pool, and attaches it for subsequent commits.
    pub fn set_wal(&self, path: impl AsRef<Path>) -> Result<()> {
        let wal = Arc::new(Wal::open(path)?);
        wal.recover(&self.pool)?;
        self.pool.set_wal(Arc::clone(&wal));
        Ok(())
    }

    /// The buffer pool beneath this database.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The attached write-ahead log, if any.
    pub fn wal(&self) -> Option<Arc<Wal>> {
        self.pool.wal()
    }

    /// Current metadata snapshot.
    pub fn meta(&self) -> Meta {
        *self.meta.lock()
    }

    /// Root page of the system catalog, or 0 before it exists.
    pub fn catalog_root(&self) -> PageId {
        self.meta.lock().catalog_root
    }

    /// Persists a new catalog root into the meta page.
    pub fn set_catalog_root(&self, root: PageId) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.catalog_root = root;
        store_meta(self.backend.as_ref(), &meta)
    }

    /// Draws the next transaction id from the meta page's monotonic counter
    /// and persists the bump.
    pub fn next_txn_id(&self) -> Result<TxnId> {
        let mut meta = self.meta.lock();
        meta.txn_counter += 1;
        store_meta(self.backend.as_ref(), &meta)?;
        Ok(meta.txn_counter)
    }

    /// Marks `txn_id` active. No WAL record is written at begin.
    pub fn begin_transaction(&self, txn_id: TxnId) -> Result<()> {
        self.txn.lock().begin(txn_id)
    }

    /// Commits the active transaction.
    ///
    /// With a WAL attached this appends a Commit record, which fsyncs the
    /// transaction's records to stable storage before returning. On failure
    /// the transaction stays active so the caller can retry or roll back.
    pub fn commit_transaction(&self) -> Result<()> {
        let mut slot = self.txn.lock();
        let txn_id = slot.require_active()?;
        if let Some(wal) = self.pool.wal() {
            wal.append(&WalRecord::commit(txn_id))?;
        }
        slot.finish(TxState::Committed);
        debug!(txn_id, "transaction committed");
        Ok(())
    }

    /// Rolls back the active transaction.
    ///
    /// Appends a Rollback marker when a WAL is attached. Recovery is
    /// redo-only, so page edits already applied in memory are not undone
    /// within this process lifetime; they become invisible after a restart.
    pub fn rollback_transaction(&self) -> Result<()> {
        let mut slot = self.txn.lock();
        let txn_id = slot.require_active()?;
        if let Some(wal) = self.pool.wal() {
            wal.append(&WalRecord::rollback(txn_id))?;
        }
        slot.finish(TxState::RolledBack);
        debug!(txn_id, "transaction rolled back");
        Ok(())
    }

    /// True while a transaction is open on this connection.
    pub fn is_transaction_active(&self) -> bool {
        self.txn.lock().current().is_some()
    }

    /// Id of the open transaction, if any.
    pub fn current_txn_id(&self) -> Option<TxnId> {
        self.txn.lock().current()
    }

    /// State of the most recent transaction on this connection.
    pub fn transaction_state(&self) -> Option<TxState> {
        self.txn.lock().state()
    }

    /// Allocates a fresh page of the given type and returns its id,
    /// advancing the meta page's page count when the file grows.
    pub fn allocate_page(&self, page_type: PageType) -> Result<PageId> {
        let guard = self.pool.new_page(page_type)?;
        let id = guard.id();
        drop(guard);
        let mut meta = self.meta.lock();
        if u64::from(id) + 1 > u64::from(meta.page_count) {
            meta.page_count = id + 1;
            store_meta(self.backend.as_ref(), &meta)?;
        }
        Ok(id)
    }

    /// Row inserted: logs an Insert record, then overwrites the page range.
    pub fn insert_at(&self, page_id: PageId, offset: u16, data: &[u8]) -> Result<()> {
        self.apply_mutation(RecordType::Insert, page_id, offset, data)
    }

    /// Row updated: logs an Update record, then overwrites the page range.
    pub fn update_at(&self, page_id: PageId, offset: u16, data: &[u8]) -> Result<()> {
        self.apply_mutation(RecordType::Update, page_id, offset, data)
    }

    /// Row deleted: logs a Delete record, then overwrites the page range
    /// (the executor supplies the tombstone bytes).
    pub fn delete_at(&self, page_id: PageId, offset: u16, data: &[u8]) -> Result<()> {
        self.apply_mutation(RecordType::Delete, page_id, offset, data)
    }

    /// Reads `len` bytes at `offset` from the given page.
    pub fn read_range(&self, page_id: PageId, offset: u16, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= PAGE_SIZE)
            .ok_or(DbError::InvalidArgument("read range exceeds page bounds"))?;
        let guard = self.pool.get_page(page_id)?;
        let data = guard.read();
        Ok(data[start..end].to_vec())
    }

    /// The WAL record precedes the page edit so that a crash between the
    /// two can only lose the edit, never replay an unlogged one. Outside a
    /// transaction the edit is applied directly and durability comes from
    /// flush/checkpoint.
    fn apply_mutation(
        &self,
        kind: RecordType,
        page_id: PageId,
        offset: u16,
        data: &[u8],
    ) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= PAGE_SIZE)
            .ok_or(DbError::InvalidArgument("write range exceeds page bounds"))?;

        let txn_id = self.txn.lock().current();
        if let (Some(wal), Some(txn_id)) = (self.pool.wal(), txn_id) {
            let record = match kind {
                RecordType::Insert => WalRecord::insert(txn_id, page_id, offset, data.to_vec()),
                RecordType::Update => WalRecord::update(txn_id, page_id, offset, data.to_vec()),
                RecordType::Delete => WalRecord::delete(txn_id, page_id, offset, data.to_vec()),
                _ => return Err(DbError::InvalidArgument("not a data record type")),
            };
            wal.append(&record)?;
        }

        let guard = self.pool.get_page(page_id)?;
        let mut bytes = guard.write();
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Flushes all dirty pages and syncs the backend.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all()
    }

    /// Checkpoints the WAL (flush, marker, truncate), or just flushes when
    /// no WAL is attached.
    pub fn checkpoint(&self) -> Result<()> {
        match self.pool.wal() {
            Some(wal) => wal.checkpoint(&self.pool),
            None => self.pool.flush_all(),
        }
    }

    /// Flushes the pool and closes the WAL and backend. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.close()?;
        if let Some(wal) = self.pool.wal() {
            wal.close()?;
        }
        self.backend.close()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(error = %err, "database close failed during drop");
        }
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}
