//! The transaction log: WAL writes plus in-order application.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::transaction::applier::{StorageApplier, TransactionLogApplier};
use crate::types::{DataId, TransactionId};
use crate::wal::{EntryKey, WalManager, WalOp, WalRecord};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_storage::StorageBackend;
use tracing::{debug, info, warn};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Append-only transaction log with a single sequential applier.
///
/// Every entry is written to the WAL and then handed to the applier under
/// one lock, so the applier sees entries in exactly the order they were
/// logged even when several transactions interleave.
///
/// When the last open transaction finishes, the applied effects are
/// persisted and the WAL is truncated to zero. If a committed transaction
/// failed to apply, the WAL is kept from then on so the next open replays
/// it.
pub struct TransactionLog {
    wal: WalManager,
    storage: Arc<dyn StorageApplier>,
    applier: Mutex<TransactionLogApplier>,
    retain_wal: AtomicBool,
    next_txid: AtomicU64,
    chunk_size: usize,
    sync_on_write: bool,
    stale_timeout_ms: u64,
}

impl TransactionLog {
    /// Opens the log over `backend`, replaying every surviving entry.
    ///
    /// Committed transactions still in the log are applied again; open ones
    /// are re-registered with their original start time.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        storage: Arc<dyn StorageApplier>,
        config: &Config,
    ) -> CoreResult<Self> {
        let wal = WalManager::new(backend, config.sync_on_write);
        let mut applier = TransactionLogApplier::new(Arc::clone(&storage));

        let mut max_txid = 0;
        let mut replayed = 0usize;
        let mut iter = wal.iter();
        for item in iter.by_ref() {
            let (offset, record) = item?;
            max_txid = max_txid.max(record.key.txid.as_u64());
            applier.process(offset, &record, &wal)?;
            replayed += 1;
        }
        let valid_end = iter.valid_end();

        let size = wal.size()?;
        if valid_end < size {
            warn!(valid_end, size, "discarding incomplete transaction log tail");
            wal.truncate(valid_end)?;
        }
        if applier.is_idle() && size > 0 {
            storage.persist()?;
            wal.clear()?;
        }

        info!(
            replayed,
            open = applier.open_count(),
            next_txid = max_txid + 1,
            "transaction log opened"
        );

        Ok(Self {
            wal,
            storage,
            applier: Mutex::new(applier),
            retain_wal: AtomicBool::new(false),
            next_txid: AtomicU64::new(max_txid + 1),
            chunk_size: config.chunk_size.max(1),
            sync_on_write: config.sync_on_write,
            stale_timeout_ms: u64::try_from(config.stale_transaction_timeout.as_millis())
                .unwrap_or(u64::MAX),
        })
    }

    /// Starts a transaction and returns its id.
    pub fn start_transaction(&self) -> CoreResult<TransactionId> {
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let record = WalRecord::new(
            EntryKey::new(txid, 0),
            WalOp::Start {
                timestamp_ms: now_ms(),
            },
        );

        let mut applier = self.applier.lock();
        let offset = self.wal.append(&record)?;
        applier.process(offset, &record, &self.wal)?;
        debug!(txid = %txid, "transaction started");
        Ok(txid)
    }

    /// Streams a primary-storage value into the log in chunks.
    ///
    /// The reader is never buffered whole: each chunk becomes its own
    /// record, and an empty chunk ends the value.
    pub fn store(
        &self,
        txid: TransactionId,
        entity: &str,
        id: DataId,
        data: &mut dyn Read,
    ) -> CoreResult<()> {
        self.write_chunks(txid, data, |bytes| WalOp::StoreChunk {
            entity: entity.to_string(),
            id,
            bytes,
        })
    }

    /// Streams a derived index payload into the log in chunks.
    pub fn store_index(
        &self,
        txid: TransactionId,
        entity: &str,
        index: &str,
        id: DataId,
        data: &mut dyn Read,
    ) -> CoreResult<()> {
        self.write_chunks(txid, data, |bytes| WalOp::IndexChunk {
            entity: entity.to_string(),
            index: index.to_string(),
            id,
            bytes,
        })
    }

    /// Logs a deletion.
    pub fn delete(&self, txid: TransactionId, entity: &str, id: DataId) -> CoreResult<()> {
        self.append(
            txid,
            WalOp::Delete {
                entity: entity.to_string(),
                id,
            },
        )
    }

    /// Commits: the transaction's effects are applied before this returns.
    pub fn commit(&self, txid: TransactionId) -> CoreResult<()> {
        self.append(txid, WalOp::Commit)
    }

    /// Rolls back: the transaction's entries are discarded.
    pub fn rollback(&self, txid: TransactionId) -> CoreResult<()> {
        self.append(txid, WalOp::Rollback)
    }

    /// Rolls back every transaction started more than the configured
    /// timeout ago. Returns how many were reclaimed.
    pub fn sweep_stale(&self) -> CoreResult<usize> {
        self.sweep_stale_at(now_ms())
    }

    /// [`sweep_stale`](Self::sweep_stale) with an explicit clock.
    pub fn sweep_stale_at(&self, now_ms: u64) -> CoreResult<usize> {
        let expired = self.applier.lock().expired(now_ms, self.stale_timeout_ms);
        let mut reclaimed = 0;
        for txid in expired {
            match self.rollback(txid) {
                Ok(()) => {
                    warn!(txid = %txid, "rolled back abandoned transaction");
                    reclaimed += 1;
                }
                // finished between the scan and the rollback
                Err(CoreError::UnknownTransaction { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Number of open transactions.
    pub fn open_transactions(&self) -> usize {
        self.applier.lock().open_count()
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.wal.size()
    }

    /// Flushes the WAL.
    pub fn flush(&self) -> CoreResult<()> {
        self.wal.flush()
    }

    fn write_chunks<F>(&self, txid: TransactionId, data: &mut dyn Read, make: F) -> CoreResult<()>
    where
        F: Fn(Vec<u8>) -> WalOp,
    {
        loop {
            let chunk = read_chunk(data, self.chunk_size)?;
            let done = chunk.is_empty();
            self.append(txid, make(chunk))?;
            if done {
                return Ok(());
            }
        }
    }

    fn append(&self, txid: TransactionId, op: WalOp) -> CoreResult<()> {
        let terminal = matches!(op, WalOp::Commit | WalOp::Rollback);

        let mut applier = self.applier.lock();
        let seq = applier.next_seq(txid)?;
        let record = WalRecord::new(EntryKey::new(txid, seq), op);
        let offset = self.wal.append(&record)?;
        if terminal && self.sync_on_write {
            self.wal.flush()?;
        }

        let result = applier.process(offset, &record, &self.wal);
        if terminal {
            if let Err(e) = &result {
                warn!(txid = %txid, error = %e, "keeping the transaction log for replay on next open");
                self.retain_wal.store(true, Ordering::SeqCst);
            }
            if applier.is_idle() && !self.retain_wal.load(Ordering::SeqCst) {
                // applied effects must be durable before the log forgets them
                self.storage.persist()?;
                self.wal.clear()?;
            }
        }
        result
    }
}

/// Reads up to `limit` bytes, short only at end of input.
fn read_chunk(data: &mut dyn Read, limit: usize) -> CoreResult<Vec<u8>> {
    let mut chunk = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        match data.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    chunk.truncate(filled);
    Ok(chunk)
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("next_txid", &self.next_txid.load(Ordering::SeqCst))
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;
    use tessera_storage::InMemoryBackend;

    #[derive(Default)]
    struct Stores(PlMutex<Vec<(TransactionId, DataId, Vec<u8>)>>, PlMutex<Option<TransactionId>>);

    impl StorageApplier for Stores {
        fn transaction_start(&self, txid: TransactionId) -> CoreResult<()> {
            *self.1.lock() = Some(txid);
            Ok(())
        }

        fn store(&self, _entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
            let mut bytes = Vec::new();
            data.read_to_end(&mut bytes)?;
            let txid = self.1.lock().unwrap_or(TransactionId::new(0));
            self.0.lock().push((txid, id, bytes));
            Ok(())
        }

        fn delete(&self, _entity: &str, _id: DataId) -> CoreResult<()> {
            Ok(())
        }

        fn index(&self, _: &str, _: &str, _: DataId, _: &mut dyn Read) -> CoreResult<()> {
            Ok(())
        }

        fn transaction_complete(&self, _txid: TransactionId, _error: Option<&CoreError>) {}
    }

    fn open(backend: &InMemoryBackend, stores: &Arc<Stores>, config: &Config) -> TransactionLog {
        TransactionLog::open(
            Box::new(backend.share()),
            Arc::clone(stores) as Arc<dyn StorageApplier>,
            config,
        )
        .unwrap()
    }

    #[test]
    fn large_values_are_chunked_and_reassembled() {
        let backend = InMemoryBackend::new();
        let stores = Arc::new(Stores::default());
        let log = open(&backend, &stores, &Config::new().chunk_size(4));

        let value: Vec<u8> = (0..=10).collect();
        let tx = log.start_transaction().unwrap();
        log.store(tx, "e", DataId::new(1), &mut value.as_slice()).unwrap();

        // 4 + 4 + 3 bytes plus the terminator, after the start entry
        let records = WalManager::new(Box::new(backend.share()), false)
            .read_all()
            .unwrap();
        assert_eq!(records.len(), 5);

        log.commit(tx).unwrap();
        assert_eq!(stores.0.lock().clone(), vec![(tx, DataId::new(1), value)]);
    }

    #[test]
    fn idle_log_is_checkpointed() {
        let backend = InMemoryBackend::new();
        let stores = Arc::new(Stores::default());
        let log = open(&backend, &stores, &Config::default());

        let a = log.start_transaction().unwrap();
        let b = log.start_transaction().unwrap();
        log.store(a, "e", DataId::new(1), &mut &b"x"[..]).unwrap();
        log.commit(a).unwrap();
        assert!(log.wal_size().unwrap() > 0);

        log.rollback(b).unwrap();
        assert_eq!(log.wal_size().unwrap(), 0);
    }

    #[test]
    fn reopen_recovers_open_transactions_and_ids() {
        let backend = InMemoryBackend::new();
        let stores = Arc::new(Stores::default());
        let tx = {
            let log = open(&backend, &stores, &Config::default());
            let tx = log.start_transaction().unwrap();
            log.store(tx, "e", DataId::new(3), &mut &b"later"[..]).unwrap();
            tx
        };

        let log = open(&backend, &stores, &Config::default());
        assert_eq!(log.open_transactions(), 1);
        assert!(stores.0.lock().is_empty());

        let next = log.start_transaction().unwrap();
        assert!(next > tx);

        log.commit(tx).unwrap();
        assert_eq!(stores.0.lock().len(), 1);
    }

    #[test]
    fn committed_but_unpurged_transaction_is_reapplied() {
        let backend = InMemoryBackend::new();
        let stores = Arc::new(Stores::default());
        {
            let log = open(&backend, &stores, &Config::default());
            let open_tx = log.start_transaction().unwrap();
            let tx = log.start_transaction().unwrap();
            log.store(tx, "e", DataId::new(8), &mut &b"v"[..]).unwrap();
            log.commit(tx).unwrap();
            // the still-open transaction keeps the log from being cleared
            assert_eq!(log.open_transactions(), 1);
            let _ = open_tx;
        }
        assert_eq!(stores.0.lock().len(), 1);

        let log = open(&backend, &stores, &Config::default());
        assert_eq!(stores.0.lock().len(), 2);
        assert_eq!(log.open_transactions(), 1);
    }

    #[test]
    fn writes_to_unknown_transactions_fail() {
        let stores = Arc::new(Stores::default());
        let log = open(&InMemoryBackend::new(), &stores, &Config::default());

        let err = log.commit(TransactionId::new(42)).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTransaction { .. }));

        let tx = log.start_transaction().unwrap();
        log.commit(tx).unwrap();
        assert!(log.delete(tx, "e", DataId::new(1)).is_err());
    }

    #[test]
    fn stale_transactions_are_swept() {
        let stores = Arc::new(Stores::default());
        let config = Config::new().stale_transaction_timeout(Duration::from_secs(60));
        let log = open(&InMemoryBackend::new(), &stores, &config);

        let tx = log.start_transaction().unwrap();
        log.store(tx, "e", DataId::new(1), &mut &b"abandoned"[..]).unwrap();

        assert_eq!(log.sweep_stale().unwrap(), 0);
        assert_eq!(log.sweep_stale_at(now_ms() + 61_000).unwrap(), 1);
        assert_eq!(log.open_transactions(), 0);
        assert!(stores.0.lock().is_empty());
        assert_eq!(log.wal_size().unwrap(), 0);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let mut backend = InMemoryBackend::new();
        let stores = Arc::new(Stores::default());
        {
            let log = open(&backend, &stores, &Config::default());
            log.start_transaction().unwrap();
        }
        backend.append(b"TWAL\x01").unwrap();
        let intact = backend.data().len() - 5;

        let log = open(&backend, &stores, &Config::default());
        assert_eq!(log.open_transactions(), 1);
        assert_eq!(log.wal_size().unwrap(), intact as u64);
    }
}
