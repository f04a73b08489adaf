//! A simple in-memory index: each record maps to its payload.

use crate::error::CoreResult;
use crate::index::traits::Index;
use crate::types::{DataId, OpId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct Durable {
    entries: BTreeMap<DataId, Vec<u8>>,
    hard_commit: OpId,
}

#[derive(Debug, Default)]
struct Live {
    entries: BTreeMap<DataId, Vec<u8>>,
    last_op: OpId,
}

/// Keeps `data_id -> payload` in memory.
///
/// The payload is the record's raw bytes (`generate` copies its input).
/// [`hard_commit`](Self::hard_commit) snapshots the live state into a
/// "durable" copy shared with [`reopen`](Self::reopen), which models an
/// index persisting itself and later loading from disk.
#[derive(Debug)]
pub struct MemoryIndex {
    name: String,
    live: RwLock<Live>,
    durable: Arc<Mutex<Durable>>,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: RwLock::new(Live::default()),
            durable: Arc::new(Mutex::new(Durable::default())),
        }
    }

    /// Persists the live state; returns the new hard commit.
    pub fn hard_commit(&self) -> OpId {
        let live = self.live.read();
        let mut durable = self.durable.lock();
        durable.entries = live.entries.clone();
        durable.hard_commit = live.last_op;
        durable.hard_commit
    }

    /// A fresh instance loaded from the last hard commit.
    pub fn reopen(&self) -> Self {
        let durable = self.durable.lock().clone();
        Self {
            name: self.name.clone(),
            live: RwLock::new(Live {
                entries: durable.entries,
                last_op: durable.hard_commit,
            }),
            durable: Arc::clone(&self.durable),
        }
    }

    /// Payload for `data_id`.
    pub fn get(&self, data_id: DataId) -> Option<Vec<u8>> {
        self.live.read().entries.get(&data_id).cloned()
    }

    /// Returns true if any record maps to `payload`.
    pub fn contains_payload(&self, payload: &[u8]) -> bool {
        self.live.read().entries.values().any(|v| v == payload)
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.live.read().entries.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.live.read().entries.is_empty()
    }

    /// Highest op applied to the live state.
    pub fn last_applied(&self) -> OpId {
        self.live.read().last_op
    }
}

impl Index for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, data: &mut dyn Read, out: &mut dyn Write) -> CoreResult<()> {
        std::io::copy(data, out)?;
        Ok(())
    }

    fn apply(&self, op: OpId, data_id: DataId, payload: &mut dyn Read) -> CoreResult<()> {
        let mut bytes = Vec::new();
        payload.read_to_end(&mut bytes)?;
        let mut live = self.live.write();
        live.entries.insert(data_id, bytes);
        live.last_op = live.last_op.max(op);
        Ok(())
    }

    fn delete(&self, op: OpId, data_id: DataId) -> CoreResult<()> {
        let mut live = self.live.write();
        live.entries.remove(&data_id);
        live.last_op = live.last_op.max(op);
        Ok(())
    }

    fn clear(&self) -> CoreResult<()> {
        *self.live.write() = Live::default();
        *self.durable.lock() = Durable::default();
        Ok(())
    }

    fn last_hard_commit(&self) -> CoreResult<OpId> {
        Ok(self.durable.lock().hard_commit)
    }
}
