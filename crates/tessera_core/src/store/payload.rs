//! Storage for derived index payloads, keyed by [`StoredId`].

use crate::error::CoreResult;
use crate::store::map::OrderedMap;
use crate::types::StoredId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Derived payloads produced by an index's `generate`.
///
/// Ids are allocated past the largest id present, so an id is never handed
/// out twice while its payload is still stored.
pub struct PayloadStore {
    map: Arc<OrderedMap>,
    next_id: Mutex<u64>,
}

impl PayloadStore {
    /// Wraps a map.
    pub fn new(map: Arc<OrderedMap>) -> Self {
        let next_id = map.last_key().map_or(1, |last| last + 1);
        Self {
            map,
            next_id: Mutex::new(next_id),
        }
    }

    /// Persists a payload under a fresh id.
    pub fn insert(&self, payload: &[u8]) -> CoreResult<StoredId> {
        let mut next = self.next_id.lock();
        let id = StoredId::new(*next);
        self.map.put(id.as_u64(), payload)?;
        *next += 1;
        Ok(id)
    }

    /// Reads a payload.
    pub fn get(&self, id: StoredId) -> Option<Vec<u8>> {
        self.map.get(id.as_u64())
    }

    /// Returns true if the payload exists.
    pub fn contains(&self, id: StoredId) -> bool {
        self.map.contains(id.as_u64())
    }

    /// Drops a payload.
    pub fn remove(&self, id: StoredId) -> CoreResult<bool> {
        Ok(self.map.remove(id.as_u64())?.is_some())
    }

    /// Every stored id, in order.
    pub fn ids(&self) -> Vec<StoredId> {
        self.map.keys().into_iter().map(StoredId::new).collect()
    }

    /// Number of payloads held.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no payloads are held.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every payload.
    pub fn clear(&self) -> CoreResult<()> {
        self.map.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    #[test]
    fn ids_continue_after_reopen() {
        let backend = InMemoryBackend::new();
        let first = {
            let map = OrderedMap::open("payloads", Box::new(backend.share())).unwrap();
            let store = PayloadStore::new(Arc::new(map));
            assert_eq!(store.insert(b"a").unwrap(), StoredId::new(1));
            store.insert(b"b").unwrap()
        };

        let map = OrderedMap::open("payloads", Box::new(backend.share())).unwrap();
        let store = PayloadStore::new(Arc::new(map));
        let next = store.insert(b"c").unwrap();

        assert!(next > first);
        assert_eq!(store.get(first), Some(b"b".to_vec()));
        assert_eq!(store.len(), 3);
    }
}
