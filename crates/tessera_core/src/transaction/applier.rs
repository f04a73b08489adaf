//! Sequential consumer of transaction log entries.
//!
//! Entries before a transaction's Commit are inert: chunks are remembered
//! only as WAL offsets and stores, deletes and index payloads are queued as
//! effects. At Commit the effects run against the [`StorageApplier`] in the
//! order they were logged; at Rollback they are dropped.

use crate::error::{CoreError, CoreResult};
use crate::types::{DataId, TransactionId};
use crate::wal::{WalManager, WalOp, WalRecord};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives committed effects.
///
/// Implemented by whatever owns primary storage and index fan-out.
/// `store` and `delete` must be idempotent: a committed transaction may be
/// replayed again after a crash.
pub trait StorageApplier: Send + Sync {
    /// A committed transaction is about to be applied.
    fn transaction_start(&self, txid: TransactionId) -> CoreResult<()>;

    /// Stores a primary-storage value.
    fn store(&self, entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()>;

    /// Deletes a primary-storage value.
    fn delete(&self, entity: &str, id: DataId) -> CoreResult<()>;

    /// Hands a derived payload to the named index.
    fn index(&self, entity: &str, index: &str, id: DataId, data: &mut dyn Read)
        -> CoreResult<()>;

    /// The transaction finished applying, with the first error if any.
    fn transaction_complete(&self, txid: TransactionId, error: Option<&CoreError>);

    /// Makes every effect applied so far durable.
    ///
    /// Called before the transaction log discards entries it could
    /// otherwise replay. Appliers without storage of their own can keep
    /// the default.
    fn persist(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ChunkTarget {
    Store { entity: String, id: DataId },
    Index { entity: String, index: String, id: DataId },
}

#[derive(Debug)]
enum Effect {
    Store {
        entity: String,
        id: DataId,
        chunks: Vec<u64>,
    },
    Index {
        entity: String,
        index: String,
        id: DataId,
        chunks: Vec<u64>,
    },
    Delete {
        entity: String,
        id: DataId,
    },
}

#[derive(Debug)]
struct OpenTransaction {
    started_at_ms: u64,
    last_seq: u64,
    pending: HashMap<ChunkTarget, Vec<u64>>,
    effects: Vec<Effect>,
}

/// Turns logged entries into [`StorageApplier`] calls.
pub struct TransactionLogApplier {
    storage: Arc<dyn StorageApplier>,
    open: BTreeMap<TransactionId, OpenTransaction>,
}

impl TransactionLogApplier {
    /// Creates an applier with no open transactions.
    pub fn new(storage: Arc<dyn StorageApplier>) -> Self {
        Self {
            storage,
            open: BTreeMap::new(),
        }
    }

    /// Sequence number the next entry of `txid` must carry.
    pub fn next_seq(&self, txid: TransactionId) -> CoreResult<u64> {
        self.open
            .get(&txid)
            .map(|tx| tx.last_seq + 1)
            .ok_or(CoreError::UnknownTransaction { txid })
    }

    /// Returns true if `txid` is open.
    pub fn is_open(&self, txid: TransactionId) -> bool {
        self.open.contains_key(&txid)
    }

    /// Returns true if no transaction is open.
    pub fn is_idle(&self) -> bool {
        self.open.is_empty()
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Open transactions whose Start is older than `timeout_ms` at `now_ms`.
    pub fn expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<TransactionId> {
        self.open
            .iter()
            .filter(|(_, tx)| now_ms.saturating_sub(tx.started_at_ms) > timeout_ms)
            .map(|(txid, _)| *txid)
            .collect()
    }

    /// Processes one entry that was written at `offset` in `wal`.
    ///
    /// Errors from the storage applier during a Commit are returned after
    /// the transaction has been purged. A failing effect does not stop the
    /// ones after it; the first error is returned.
    pub fn process(&mut self, offset: u64, record: &WalRecord, wal: &WalManager) -> CoreResult<()> {
        let txid = record.key.txid;

        if let WalOp::Start { timestamp_ms } = record.op {
            if self.open.contains_key(&txid) {
                return Err(CoreError::wal_corruption(format!(
                    "duplicate start for {txid}"
                )));
            }
            self.open.insert(
                txid,
                OpenTransaction {
                    started_at_ms: timestamp_ms,
                    last_seq: record.key.seq,
                    pending: HashMap::new(),
                    effects: Vec::new(),
                },
            );
            return Ok(());
        }

        let tx = self
            .open
            .get_mut(&txid)
            .ok_or(CoreError::UnknownTransaction { txid })?;
        if record.key.seq <= tx.last_seq {
            return Err(CoreError::wal_corruption(format!(
                "{txid} entry {} is not after entry {}",
                record.key.seq, tx.last_seq
            )));
        }
        tx.last_seq = record.key.seq;

        match &record.op {
            WalOp::Start { .. } => {
                return Err(CoreError::wal_corruption(format!(
                    "duplicate start for {txid}"
                )))
            }
            WalOp::StoreChunk { entity, id, bytes } => {
                let target = ChunkTarget::Store {
                    entity: entity.clone(),
                    id: *id,
                };
                tx.chunk(target, offset, bytes.is_empty());
            }
            WalOp::IndexChunk {
                entity,
                index,
                id,
                bytes,
            } => {
                let target = ChunkTarget::Index {
                    entity: entity.clone(),
                    index: index.clone(),
                    id: *id,
                };
                tx.chunk(target, offset, bytes.is_empty());
            }
            WalOp::Delete { entity, id } => tx.effects.push(Effect::Delete {
                entity: entity.clone(),
                id: *id,
            }),
            WalOp::Commit => {
                let tx = self
                    .open
                    .remove(&txid)
                    .ok_or(CoreError::UnknownTransaction { txid })?;
                return self.commit(txid, tx, wal);
            }
            WalOp::Rollback => {
                if let Some(tx) = self.open.remove(&txid) {
                    debug!(txid = %txid, effects = tx.effects.len(), "transaction rolled back");
                }
            }
        }
        Ok(())
    }

    fn commit(&self, txid: TransactionId, tx: OpenTransaction, wal: &WalManager) -> CoreResult<()> {
        if !tx.pending.is_empty() {
            warn!(
                txid = %txid,
                unterminated = tx.pending.len(),
                "committing with unterminated values; they are discarded"
            );
        }

        let result = self.apply_effects(txid, &tx.effects, wal);
        self.storage.transaction_complete(txid, result.as_ref().err());
        debug!(txid = %txid, effects = tx.effects.len(), ok = result.is_ok(), "transaction applied");
        result
    }

    fn apply_effects(&self, txid: TransactionId, effects: &[Effect], wal: &WalManager) -> CoreResult<()> {
        self.storage.transaction_start(txid)?;
        let mut first_error = None;
        for effect in effects {
            let result = match effect {
                Effect::Store { entity, id, chunks } => {
                    let mut reader = ChunkReader::new(wal, chunks);
                    self.storage.store(entity, *id, &mut reader)
                }
                Effect::Index {
                    entity,
                    index,
                    id,
                    chunks,
                } => {
                    let mut reader = ChunkReader::new(wal, chunks);
                    self.storage.index(entity, index, *id, &mut reader)
                }
                Effect::Delete { entity, id } => self.storage.delete(entity, *id),
            };
            if let Err(e) = result {
                warn!(txid = %txid, error = %e, "committed effect failed to apply");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl OpenTransaction {
    /// Remembers a chunk; an empty chunk completes the value.
    fn chunk(&mut self, target: ChunkTarget, offset: u64, terminator: bool) {
        if !terminator {
            self.pending.entry(target).or_default().push(offset);
            return;
        }

        let chunks = self.pending.remove(&target).unwrap_or_default();
        let effect = match target {
            ChunkTarget::Store { entity, id } => Effect::Store { entity, id, chunks },
            ChunkTarget::Index { entity, index, id } => Effect::Index {
                entity,
                index,
                id,
                chunks,
            },
        };
        self.effects.push(effect);
    }
}

impl std::fmt::Debug for TransactionLogApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLogApplier")
            .field("open", &self.open.len())
            .finish_non_exhaustive()
    }
}

/// Streams a value back out of its chunk records, one record at a time.
struct ChunkReader<'a> {
    wal: &'a WalManager,
    offsets: std::slice::Iter<'a, u64>,
    current: Vec<u8>,
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(wal: &'a WalManager, offsets: &'a [u64]) -> Self {
        Self {
            wal,
            offsets: offsets.iter(),
            current: Vec::new(),
            pos: 0,
        }
    }

    fn load_next(&mut self) -> io::Result<bool> {
        let Some(&offset) = self.offsets.next() else {
            return Ok(false);
        };
        let record = self
            .wal
            .read_at(offset)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.current = match record.op {
            WalOp::StoreChunk { bytes, .. } | WalOp::IndexChunk { bytes, .. } => bytes,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected a chunk at offset {offset}, found {:?}", other.tag()),
                ))
            }
        };
        self.pos = 0;
        Ok(true)
    }
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            if !self.load_next()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
