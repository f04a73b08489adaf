//! Typed values over an [`OrderedMap`], encoded as CBOR.

use crate::error::{CoreError, CoreResult};
use crate::store::map::OrderedMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Encodes a value as CBOR.
pub fn encode<V: Serialize>(value: &V) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub fn decode<V: DeserializeOwned>(bytes: &[u8]) -> CoreResult<V> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

/// A map whose values are `V`, stored through serde.
pub struct TypedMap<V> {
    map: Arc<OrderedMap>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> TypedMap<V> {
    /// Wraps a raw map.
    pub fn new(map: Arc<OrderedMap>) -> Self {
        Self {
            map,
            _marker: PhantomData,
        }
    }

    /// The underlying raw map.
    pub fn raw(&self) -> &Arc<OrderedMap> {
        &self.map
    }

    /// Returns the value under `key`.
    pub fn get(&self, key: u64) -> CoreResult<Option<V>> {
        self.map.get(key).map(|bytes| decode(&bytes)).transpose()
    }

    /// Stores `value` under `key`.
    pub fn put(&self, key: u64, value: &V) -> CoreResult<()> {
        self.map.put(key, &encode(value)?)
    }

    /// Removes `key`, returning the old value.
    pub fn remove(&self, key: u64) -> CoreResult<Option<V>> {
        self.map
            .remove(key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Least entry with key `>= key`.
    pub fn ceiling(&self, key: u64) -> CoreResult<Option<(u64, V)>> {
        self.map
            .ceiling(key)
            .map(|(k, bytes)| decode(&bytes).map(|v| (k, v)))
            .transpose()
    }

    /// Decoded entries with keys in `(after, up_to]`.
    pub fn entries_between(&self, after: u64, up_to: u64) -> CoreResult<Vec<(u64, V)>> {
        if up_to <= after {
            return Ok(Vec::new());
        }
        self.map
            .range(after + 1..=up_to)
            .into_iter()
            .map(|(k, bytes)| decode(&bytes).map(|v| (k, v)))
            .collect()
    }

    /// Every decoded entry, in key order.
    pub fn entries(&self) -> CoreResult<Vec<(u64, V)>> {
        self.map
            .range(..)
            .into_iter()
            .map(|(k, bytes)| decode(&bytes).map(|v| (k, v)))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.map.clear()
    }
}
