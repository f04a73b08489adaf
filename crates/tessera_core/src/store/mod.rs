//! Durable ordered map store.
//!
//! Primary storage, the per-index operation logs and the payload store are
//! all named [`OrderedMap`]s opened through a [`MapStore`].

mod map;
mod payload;
mod provider;
mod typed;

pub use map::{MapSnapshot, OrderedMap};
pub use payload::PayloadStore;
pub use provider::{validate_name, BackendProvider, DirectoryProvider, MemoryProvider};
pub use typed::{decode, encode, TypedMap};

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Opens and caches named maps over a [`BackendProvider`].
pub struct MapStore {
    provider: Arc<dyn BackendProvider>,
    maps: Mutex<BTreeMap<String, Arc<OrderedMap>>>,
}

impl MapStore {
    /// Creates a store over `provider`.
    pub fn new(provider: Arc<dyn BackendProvider>) -> Self {
        Self {
            provider,
            maps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the map `name`, or returns the already-open instance.
    pub fn open_map(&self, name: &str) -> CoreResult<Arc<OrderedMap>> {
        let mut maps = self.maps.lock();
        if let Some(map) = maps.get(name) {
            return Ok(Arc::clone(map));
        }

        let backend = self.provider.open(name)?;
        let scratch = self.provider.open(&compaction_name(name))?;
        let map = Arc::new(OrderedMap::open_compacting(name, backend, scratch)?);
        maps.insert(name.to_string(), Arc::clone(&map));
        Ok(map)
    }

    /// Opens a typed view of the map `name`.
    pub fn open_typed<V>(&self, name: &str) -> CoreResult<TypedMap<V>>
    where
        V: serde::Serialize + serde::de::DeserializeOwned,
    {
        Ok(TypedMap::new(self.open_map(name)?))
    }

    /// Commits every open map.
    pub fn commit_all(&self) -> CoreResult<()> {
        let maps: Vec<Arc<OrderedMap>> = self.maps.lock().values().cloned().collect();
        for map in &maps {
            map.commit()?;
        }
        debug!(maps = maps.len(), "committed map store");
        Ok(())
    }

    /// Names of the maps opened so far.
    pub fn names(&self) -> Vec<String> {
        self.maps.lock().keys().cloned().collect()
    }
}

/// Name of the backend a map stages its compaction image in.
pub fn compaction_name(map: &str) -> String {
    format!("compacting.{map}")
}

impl std::fmt::Debug for MapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("maps", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_map_is_cached() {
        let store = MapStore::new(Arc::new(MemoryProvider::new()));
        let a = store.open_map("primary.user").unwrap();
        let b = store.open_map("primary.user").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.put(1, b"x").unwrap();
        store.commit_all().unwrap();
        assert_eq!(b.version(), 1);
    }

    #[test]
    fn maps_survive_a_new_store_over_the_same_provider() {
        let provider = MemoryProvider::new();
        {
            let store = MapStore::new(Arc::new(provider.clone()));
            store.open_map("m").unwrap().put(3, b"three").unwrap();
        }

        let store = MapStore::new(Arc::new(provider));
        assert_eq!(store.open_map("m").unwrap().get(3), Some(b"three".to_vec()));
    }

    #[test]
    fn overwritten_map_stays_small_across_commits() {
        let provider = MemoryProvider::new();
        {
            let store = MapStore::new(Arc::new(provider.clone()));
            let meta = store.open_map("index.user.raw.meta").unwrap();
            for i in 0..2000u64 {
                meta.put(0, &i.to_le_bytes()).unwrap();
                if i % 50 == 49 {
                    store.commit_all().unwrap();
                }
            }
        }

        let size = |name: &str| provider.backend(name).map_or(0, |b| b.data().len());
        assert!(size("index.user.raw.meta") < 4096);
        assert_eq!(size(&compaction_name("index.user.raw.meta")), 0);

        let store = MapStore::new(Arc::new(provider));
        let meta = store.open_map("index.user.raw.meta").unwrap();
        assert_eq!(meta.get(0), Some(1999u64.to_le_bytes().to_vec()));
    }
}
