//! Write-ahead log: append-only typed records with per-record CRCs.
//!
//! Every record is `{17-byte header, payload, 4-byte CRC32-IEEE trailer}`,
//! little-endian. Commit records are fsynced before `append` returns, which
//! is what makes a transaction durable. Recovery replays exactly the data
//! records whose transaction committed; everything else is discarded.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::page::PAGE_SIZE;
use crate::pager::{BufferPool, PageId};

/// Transaction identifier carried by WAL records. 0 marks checkpoint records.
pub type TxnId = u64;
/// Log sequence number, assigned at append time. Runtime-only; never stored
/// in the record.
pub type Lsn = u64;

/// Length of the fixed record header.
pub const RECORD_HDR_LEN: usize = 17;
const RECORD_CRC_LEN: usize = 4;

/// Kind of a WAL record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    /// Row inserted; payload overwrites a page range.
    Insert = 1,
    /// Row updated; payload overwrites a page range.
    Update = 2,
    /// Row deleted; payload overwrites a page range.
    Delete = 3,
    /// Transaction committed. Durable marker, fsynced.
    Commit = 4,
    /// Transaction rolled back; its pending records are discarded.
    Rollback = 5,
    /// Checkpoint marker (txn_id 0). Structural only.
    Checkpoint = 6,
}

impl RecordType {
    fn is_data(self) -> bool {
        matches!(
            self,
            RecordType::Insert | RecordType::Update | RecordType::Delete
        )
    }
}

impl TryFrom<u8> for RecordType {
    type Error = DbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Insert),
            2 => Ok(RecordType::Update),
            3 => Ok(RecordType::Delete),
            4 => Ok(RecordType::Commit),
            5 => Ok(RecordType::Rollback),
            6 => Ok(RecordType::Checkpoint),
            _ => Err(DbError::WalCorrupted("unknown record type")),
        }
    }
}

/// One log record. Data records describe a raw byte-range overwrite on a
/// page; the log never interprets the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    /// Owning transaction; 0 for checkpoint markers.
    pub txn_id: TxnId,
    /// Record kind.
    pub kind: RecordType,
    /// Target page, or 0 when not applicable.
    pub page_id: PageId,
    /// In-page byte offset the payload overwrites.
    pub offset: u16,
    /// Raw bytes written at `[offset, offset + data.len())`.
    pub data: Vec<u8>,
}

impl WalRecord {
    fn new(kind: RecordType, txn_id: TxnId, page_id: PageId, offset: u16, data: Vec<u8>) -> Self {
        Self {
            txn_id,
            kind,
            page_id,
            offset,
            data,
        }
    }

    /// Data record for an inserted row.
    pub fn insert(txn_id: TxnId, page_id: PageId, offset: u16, data: Vec<u8>) -> Self {
        Self::new(RecordType::Insert, txn_id, page_id, offset, data)
    }

    /// Data record for an updated row.
    pub fn update(txn_id: TxnId, page_id: PageId, offset: u16, data: Vec<u8>) -> Self {
        Self::new(RecordType::Update, txn_id, page_id, offset, data)
    }

    /// Data record for a deleted row.
    pub fn delete(txn_id: TxnId, page_id: PageId, offset: u16, data: Vec<u8>) -> Self {
        Self::new(RecordType::Delete, txn_id, page_id, offset, data)
    }

    /// Durable commit marker for `txn_id`.
    pub fn commit(txn_id: TxnId) -> Self {
        Self::new(RecordType::Commit, txn_id, 0, 0, Vec::new())
    }

    /// Rollback marker for `txn_id`.
    pub fn rollback(txn_id: TxnId) -> Self {
        Self::new(RecordType::Rollback, txn_id, 0, 0, Vec::new())
    }

    fn checkpoint_marker() -> Self {
        Self::new(RecordType::Checkpoint, 0, 0, 0, Vec::new())
    }

    /// Serialized length of this record, CRC trailer included.
    pub fn encoded_len(&self) -> usize {
        RECORD_HDR_LEN + self.data.len() + RECORD_CRC_LEN
    }

    /// Encodes the record: header, payload, then a CRC32-IEEE over both.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.page_id.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.data);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes one record from the front of `buf`, returning it and the
    /// number of bytes consumed. Fails with [`DbError::WalCorrupted`] on a
    /// truncated record, unknown type, or CRC mismatch.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < RECORD_HDR_LEN {
            return Err(DbError::WalCorrupted("record header truncated"));
        }
        let txn_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let kind = RecordType::try_from(buf[8])?;
        let page_id = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        let offset = u16::from_le_bytes(buf[13..15].try_into().unwrap());
        let data_len = u16::from_le_bytes(buf[15..17].try_into().unwrap()) as usize;
        let total = RECORD_HDR_LEN + data_len + RECORD_CRC_LEN;
        if buf.len() < total {
            return Err(DbError::WalCorrupted("record body truncated"));
        }
        let payload_end = RECORD_HDR_LEN + data_len;
        let stored_crc = u32::from_le_bytes(buf[payload_end..total].try_into().unwrap());
        if crc32fast::hash(&buf[..payload_end]) != stored_crc {
            return Err(DbError::WalCorrupted("record checksum mismatch"));
        }
        let record = Self::new(
            kind,
            txn_id,
            page_id,
            offset,
            buf[RECORD_HDR_LEN..payload_end].to_vec(),
        );
        Ok((record, total))
    }
}

struct WalInner {
    writer: BufWriter<std::fs::File>,
    append_pos: u64,
    lsn: Lsn,
    checkpoint_lsn: Lsn,
    closed: bool,
}

/// Append-only record log providing durability and crash recovery.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens or creates the log at `path` and scans its contents.
    ///
    /// The scan stops cleanly at the first truncated or checksum-damaged
    /// record; appends continue from the end of the valid prefix, so any
    /// trailing garbage is overwritten rather than replayed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut lsn = 0;
        let mut checkpoint_lsn = 0;
        let mut valid_end = 0u64;
        {
            let mut reader = BufReader::new(&mut file);
            while let Some(record) = next_record(&mut reader)? {
                lsn += 1;
                valid_end += record.encoded_len() as u64;
                if record.kind == RecordType::Checkpoint {
                    checkpoint_lsn = lsn;
                }
            }
        }
        if file_len > valid_end {
            warn!(
                ?path,
                valid_bytes = valid_end,
                trailing_bytes = file_len - valid_end,
                "wal scan stopped before end of file; trailing bytes will be overwritten"
            );
        }
        file.seek(SeekFrom::Start(valid_end))?;

        Ok(Self {
            path,
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                append_pos: valid_end,
                lsn,
                checkpoint_lsn,
                closed: false,
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record and returns its LSN.
    ///
    /// Commit records flush the user-space buffer and fsync before
    /// returning; anything else may stay buffered until the next commit,
    /// checkpoint, or close.
    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        if record.data.len() > u16::MAX as usize {
            return Err(DbError::InvalidArgument("wal payload longer than u16"));
        }
        if record.kind.is_data() && record.offset as usize + record.data.len() > PAGE_SIZE {
            return Err(DbError::InvalidArgument(
                "wal record range exceeds page bounds",
            ));
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        inner.lsn += 1;
        let lsn = inner.lsn;
        let encoded = record.encode();
        inner.writer.write_all(&encoded)?;
        inner.append_pos += encoded.len() as u64;
        if record.kind == RecordType::Commit {
            inner.writer.flush()?;
            inner.writer.get_ref().sync_data()?;
            debug!(lsn, txn_id = record.txn_id, "wal.commit");
        }
        Ok(lsn)
    }

    /// Flushes every dirty page, emits a durable checkpoint marker, then
    /// truncates the log to zero length.
    ///
    /// A failure before truncation leaves a replayable prefix; a failure
    /// during truncation leaves a log ending in a checkpoint marker. Both
    /// are safe to reopen.
    pub fn checkpoint(&self, pool: &BufferPool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        pool.flush_all()?;

        inner.lsn += 1;
        let lsn = inner.lsn;
        let encoded = WalRecord::checkpoint_marker().encode();
        inner.writer.write_all(&encoded)?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        inner.checkpoint_lsn = lsn;

        let file = inner.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_data()?;
        inner.append_pos = 0;
        debug!(lsn, "wal.checkpoint");
        Ok(())
    }

    /// Replays committed transactions into the pool, then flushes it.
    ///
    /// Single forward scan: data records buffer under their transaction
    /// until its Commit arrives (or apply immediately if it already has);
    /// Rollback discards the buffered records; data records whose
    /// transaction never commits are dropped at end of scan.
    pub fn recover(&self, pool: &BufferPool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        inner.writer.flush()?;
        let append_pos = inner.append_pos;
        let file = inner.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;

        let mut committed: HashSet<TxnId> = HashSet::new();
        let mut pending: HashMap<TxnId, Vec<WalRecord>> = HashMap::new();
        let mut applied = 0u64;
        {
            let mut reader = BufReader::new(&mut *file);
            while let Some(record) = next_record(&mut reader)? {
                match record.kind {
                    RecordType::Insert | RecordType::Update | RecordType::Delete => {
                        if committed.contains(&record.txn_id) {
                            apply_record(pool, &record)?;
                            applied += 1;
                        } else {
                            pending.entry(record.txn_id).or_default().push(record);
                        }
                    }
                    RecordType::Commit => {
                        if let Some(records) = pending.remove(&record.txn_id) {
                            for buffered in records {
                                apply_record(pool, &buffered)?;
                                applied += 1;
                            }
                        }
                        committed.insert(record.txn_id);
                    }
                    RecordType::Rollback => {
                        pending.remove(&record.txn_id);
                    }
                    RecordType::Checkpoint => {}
                }
            }
        }
        file.seek(SeekFrom::Start(append_pos))?;

        pool.flush_all()?;
        if applied > 0 {
            warn!(
                records_applied = applied,
                committed_txns = committed.len(),
                "wal recovery replayed committed records"
            );
        }
        Ok(())
    }

    /// LSN of the most recently appended record.
    pub fn lsn(&self) -> Lsn {
        self.inner.lock().lsn
    }

    /// LSN of the most recent checkpoint marker.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.inner.lock().checkpoint_lsn
    }

    /// Current size of the log file in bytes, buffered appends included.
    pub fn size(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        inner.writer.flush()?;
        Ok(inner.writer.get_ref().metadata()?.len())
    }

    /// Flushes the user-space buffer and closes the log. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.writer.flush()?;
        inner.closed = true;
        Ok(())
    }
}

fn apply_record(pool: &BufferPool, record: &WalRecord) -> Result<()> {
    let start = record.offset as usize;
    let end = start + record.data.len();
    if end > PAGE_SIZE {
        return Err(DbError::WalCorrupted("record range exceeds page bounds"));
    }
    let guard = pool.get_page(record.page_id)?;
    let mut data = guard.write();
    data[start..end].copy_from_slice(&record.data);
    Ok(())
}

/// Reads bytes until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

/// Decodes the next record, or `None` at the end of the valid prefix.
///
/// EOF, a truncated record, an unknown type byte, and a CRC mismatch all end
/// the scan; only real I/O errors propagate.
fn next_record<R: Read>(reader: &mut R) -> Result<Option<WalRecord>> {
    let mut header = [0u8; RECORD_HDR_LEN];
    let n = fill(reader, &mut header)?;
    if n == 0 {
        return Ok(None);
    }
    if n < RECORD_HDR_LEN {
        warn!("wal scan stopped at truncated record header");
        return Ok(None);
    }
    let data_len = u16::from_le_bytes(header[15..17].try_into().unwrap()) as usize;
    let mut record = vec![0u8; RECORD_HDR_LEN + data_len + RECORD_CRC_LEN];
    record[..RECORD_HDR_LEN].copy_from_slice(&header);
    let n = fill(reader, &mut record[RECORD_HDR_LEN..])?;
    if n < data_len + RECORD_CRC_LEN {
        warn!("wal scan stopped at truncated record body");
        return Ok(None);
    }
    match WalRecord::decode(&record) {
        Ok((record, _)) => Ok(Some(record)),
        Err(DbError::WalCorrupted(reason)) => {
            warn!(reason, "wal scan stopped at damaged record");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBackend;
    use crate::page::PageType;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn record_roundtrip() {
        let record = WalRecord::insert(7, 5, 20, b"AAA".to_vec());
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encoded_len());
        let (decoded, consumed) = WalRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn decode_detects_checksum_damage() {
        let mut encoded = WalRecord::update(3, 2, 0, b"XY".to_vec()).encode();
        encoded[RECORD_HDR_LEN] ^= 0xFF;
        assert!(matches!(
            WalRecord::decode(&encoded),
            Err(DbError::WalCorrupted("record checksum mismatch"))
        ));
    }

    #[test]
    fn append_assigns_increasing_lsns() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("db.wal")).unwrap();
        assert_eq!(wal.lsn(), 0);
        assert_eq!(wal.append(&WalRecord::insert(1, 1, 16, vec![1])).unwrap(), 1);
        assert_eq!(wal.append(&WalRecord::commit(1)).unwrap(), 2);
        assert_eq!(wal.lsn(), 2);
    }

    #[test]
    fn reopen_recomputes_lsn_from_valid_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.wal");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(&WalRecord::insert(1, 1, 16, b"aa".to_vec()))
                .unwrap();
            wal.append(&WalRecord::commit(1)).unwrap();
            wal.close().unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.lsn(), 2);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("db.wal")).unwrap();
        let record = WalRecord::insert(1, 1, (PAGE_SIZE - 2) as u16, vec![0; 8]);
        assert!(matches!(
            wal.append(&record),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("db.wal")).unwrap();
        wal.close().unwrap();
        wal.close().unwrap();
        assert!(matches!(
            wal.append(&WalRecord::commit(1)),
            Err(DbError::WalClosed)
        ));
        let backend = Arc::new(MemoryBackend::new());
        let pool = BufferPool::new(backend, 4).unwrap();
        assert!(matches!(wal.checkpoint(&pool), Err(DbError::WalClosed)));
    }

    #[test]
    fn checkpoint_flushes_and_truncates() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("db.wal")).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let pool = BufferPool::new(backend, 4).unwrap();

        let page = pool.new_page(PageType::Leaf).unwrap();
        {
            let mut data = page.write();
            data[16] = 0x7E;
        }
        wal.append(&WalRecord::insert(1, page.id(), 16, vec![0x7E]))
            .unwrap();
        wal.append(&WalRecord::commit(1)).unwrap();
        drop(page);

        wal.checkpoint(&pool).unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        assert_eq!(wal.checkpoint_lsn(), 3);
        // Checkpoint is idempotent: the log is empty again afterwards.
        wal.checkpoint(&pool).unwrap();
        assert_eq!(wal.size().unwrap(), 0);
    }
}
