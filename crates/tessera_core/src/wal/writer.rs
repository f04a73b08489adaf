//! WAL writer and random-access reader.

use crate::error::CoreResult;
use crate::wal::iterator::WalRecordIterator;
use crate::wal::record::{decode_frame, parse_header, WalRecord, CRC_SIZE, HEADER_SIZE};
use parking_lot::Mutex;
use tessera_storage::StorageBackend;

/// Manages WAL appends and reads.
///
/// Appends return the byte offset of the record, which doubles as its
/// address for later [`read_at`](Self::read_at) calls. The transaction log
/// keeps only these offsets for uncommitted chunks, never the bytes.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl WalManager {
    /// Creates a new WAL manager.
    ///
    /// With `sync_on_write`, [`flush`](Self::flush) also syncs the backend
    /// to durable storage.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record and returns the offset where it was written.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        let frame = record.encode_frame()?;
        let offset = self.backend.lock().append(&frame)?;
        Ok(offset)
    }

    /// Reads the complete record at `offset`.
    ///
    /// Returns `Ok(None)` if the bytes at `offset` are an incomplete tail.
    pub fn read_record_at(&self, offset: u64) -> CoreResult<Option<(WalRecord, u64)>> {
        let backend = self.backend.lock();
        let size = backend.size()?;

        if size.saturating_sub(offset) < HEADER_SIZE as u64 {
            return Ok(None);
        }
        let header = backend.read_at(offset, HEADER_SIZE)?;
        let (tag, payload_len) = parse_header(&header, offset)?;

        let frame_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if size - offset < frame_len as u64 {
            return Ok(None);
        }
        let frame = backend.read_at(offset, frame_len)?;
        let record = decode_frame(&frame, tag)?;
        Ok(Some((record, offset + frame_len as u64)))
    }

    /// Reads the record at `offset`, treating an incomplete tail as corruption.
    pub fn read_at(&self, offset: u64) -> CoreResult<WalRecord> {
        self.read_record_at(offset)?
            .map(|(record, _)| record)
            .ok_or_else(|| {
                crate::error::CoreError::wal_corruption(format!(
                    "no complete record at offset {offset}"
                ))
            })
    }

    /// Flushes pending writes; syncs as well when `sync_on_write` is set.
    pub fn flush(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(())
    }

    /// Returns the current WAL size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Discards everything after `offset`.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.truncate(offset)?;
        backend.flush()?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(())
    }

    /// Truncates the WAL to zero bytes.
    ///
    /// Only valid when no transaction is open; the transaction log checks
    /// that before calling.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }

    /// Returns a streaming iterator over all records from the start.
    pub fn iter(&self) -> WalRecordIterator<'_> {
        WalRecordIterator::new(self, 0)
    }

    /// Reads all records. Intended for small logs and tests.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter().collect()
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}
