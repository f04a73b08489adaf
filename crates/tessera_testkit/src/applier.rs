//! A [`StorageApplier`] that records what it was asked to do.

use parking_lot::Mutex;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use tessera_core::{CoreError, CoreResult, DataId, StorageApplier, TransactionId};

/// One call received by a [`RecordingApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// `transaction_start`.
    Start(TransactionId),
    /// `store`, with the value read in full.
    Store {
        /// Entity name.
        entity: String,
        /// Record id.
        id: DataId,
        /// Value bytes.
        bytes: Vec<u8>,
    },
    /// `delete`.
    Delete {
        /// Entity name.
        entity: String,
        /// Record id.
        id: DataId,
    },
    /// `index`, with the payload read in full.
    Index {
        /// Entity name.
        entity: String,
        /// Index name.
        index: String,
        /// Record id.
        id: DataId,
        /// Payload bytes.
        bytes: Vec<u8>,
    },
    /// `transaction_complete`, with the error message if any.
    Complete(TransactionId, Option<String>),
}

/// Records every call in order.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<Applied>>,
    fail_store_of: Mutex<Option<DataId>>,
    persisted: AtomicUsize,
}

impl RecordingApplier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<Applied> {
        self.calls.lock().clone()
    }

    /// `(txid, id, bytes)` of every store, with the transaction it ran in.
    pub fn stores(&self) -> Vec<(TransactionId, DataId, Vec<u8>)> {
        let mut current = None;
        let mut stores = Vec::new();
        for call in self.calls.lock().iter() {
            match call {
                Applied::Start(txid) => current = Some(*txid),
                Applied::Store { id, bytes, .. } => {
                    if let Some(txid) = current {
                        stores.push((txid, *id, bytes.clone()));
                    }
                }
                _ => {}
            }
        }
        stores
    }

    /// Number of `store` calls.
    pub fn store_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Applied::Store { .. }))
            .count()
    }

    /// Number of `persist` calls.
    pub fn persist_count(&self) -> usize {
        self.persisted.load(Ordering::SeqCst)
    }

    /// Makes `store` fail for `id`.
    pub fn fail_store_of(&self, id: DataId) {
        *self.fail_store_of.lock() = Some(id);
    }

    /// Forgets recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Applied) {
        self.calls.lock().push(call);
    }
}

impl StorageApplier for RecordingApplier {
    fn transaction_start(&self, txid: TransactionId) -> CoreResult<()> {
        self.record(Applied::Start(txid));
        Ok(())
    }

    fn store(&self, entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
        if *self.fail_store_of.lock() == Some(id) {
            return Err(CoreError::invalid_operation(format!("store of {id} refused")));
        }
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.record(Applied::Store {
            entity: entity.to_string(),
            id,
            bytes,
        });
        Ok(())
    }

    fn delete(&self, entity: &str, id: DataId) -> CoreResult<()> {
        self.record(Applied::Delete {
            entity: entity.to_string(),
            id,
        });
        Ok(())
    }

    fn index(&self, entity: &str, index: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.record(Applied::Index {
            entity: entity.to_string(),
            index: index.to_string(),
            id,
            bytes,
        });
        Ok(())
    }

    fn transaction_complete(&self, txid: TransactionId, error: Option<&CoreError>) {
        self.record(Applied::Complete(txid, error.map(ToString::to_string)));
    }

    fn persist(&self) -> CoreResult<()> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
