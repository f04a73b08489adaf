//! Durable ordered `u64 -> bytes` map.
//!
//! Each map is an in-memory `BTreeMap` backed by an append-only record log:
//!
//! ```text
//! | tag (1) | key (8) | length (4) | value (N) | crc32 (4) |
//! ```
//!
//! Tags: 1 = put, 2 = remove, 3 = end of a compaction image. The log is
//! replayed on open. A torn tail is dropped; a checksum mismatch or unknown
//! tag is fatal. When the map becomes empty the log is truncated to zero.
//!
//! ## Compaction
//!
//! Overwrites and removes leave dead records behind. A map opened with a
//! scratch backend rewrites its log at commit time once dead records
//! outnumber live ones:
//!
//! 1. the live entries plus an end record (key = entry count) are written
//!    to the scratch backend and synced
//! 2. the main log is rewritten from the same entries and synced
//! 3. the scratch backend is emptied
//!
//! A complete image left in the scratch backend means step 2 may have been
//! interrupted; open copies it over the main log. An incomplete image is
//! discarded. Compaction never changes the map's contents.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_storage::{StorageBackend, StorageError};
use tracing::{debug, info, warn};

const TAG_PUT: u8 = 1;
const TAG_REMOVE: u8 = 2;
const TAG_IMAGE_END: u8 = 3;

/// tag (1) + key (8) + length (4)
const RECORD_HEADER: usize = 13;
const RECORD_CRC: usize = 4;

/// Logs shorter than this are never compacted.
const COMPACT_MIN_RECORDS: u64 = 128;

/// A point-in-time copy of a map's contents.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    /// Commit version the snapshot was taken at.
    pub version: u64,
    /// Entries in key order.
    pub entries: BTreeMap<u64, Vec<u8>>,
}

impl MapSnapshot {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest key, if any.
    pub fn last_key(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }
}

/// The record log behind a map.
struct MapLog {
    main: Box<dyn StorageBackend>,
    scratch: Option<Box<dyn StorageBackend>>,
    /// Records in `main`, live or dead.
    records: u64,
}

/// A named, durable, ordered map with floor/ceiling lookups.
///
/// Writes are appended to the backend immediately; [`commit`](Self::commit)
/// syncs them, compacts the log when it has grown mostly dead, and bumps
/// the version.
pub struct OrderedMap {
    name: String,
    entries: RwLock<BTreeMap<u64, Vec<u8>>>,
    log: Mutex<MapLog>,
    version: AtomicU64,
}

impl OrderedMap {
    /// Opens a map over `backend`, replaying any existing records.
    ///
    /// The log is never compacted.
    pub fn open(name: impl Into<String>, backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        Self::open_with(name.into(), backend, None)
    }

    /// Opens a map that compacts its log through `scratch`.
    ///
    /// Finishes a compaction that was interrupted before replaying.
    pub fn open_compacting(
        name: impl Into<String>,
        backend: Box<dyn StorageBackend>,
        scratch: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        Self::open_with(name.into(), backend, Some(scratch))
    }

    fn open_with(
        name: String,
        mut main: Box<dyn StorageBackend>,
        mut scratch: Option<Box<dyn StorageBackend>>,
    ) -> CoreResult<Self> {
        if let Some(scratch) = scratch.as_mut() {
            restore_image(&name, main.as_mut(), scratch.as_mut())?;
        }

        let data = main.read_all()?;
        let mut entries = BTreeMap::new();
        let mut records = 0u64;
        let valid_end = scan(&data, |tag, key, value, offset| {
            match tag {
                TAG_PUT => {
                    entries.insert(key, value.to_vec());
                }
                TAG_REMOVE => {
                    entries.remove(&key);
                }
                other => {
                    return Err(StorageError::Corrupted(format!(
                        "unknown map record tag {other} at offset {offset}"
                    ))
                    .into());
                }
            }
            records += 1;
            Ok(())
        })?;

        let size = data.len() as u64;
        if valid_end < size {
            warn!(map = %name, valid_end, size, "dropping torn tail of map log");
            main.truncate(valid_end)?;
        }
        debug!(map = %name, entries = entries.len(), records, "opened ordered map");

        Ok(Self {
            name,
            entries: RwLock::new(entries),
            log: Mutex::new(MapLog {
                main,
                scratch,
                records,
            }),
            version: AtomicU64::new(0),
        })
    }

    /// Map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: u64) -> Option<Vec<u8>> {
        self.entries.read().get(&key).cloned()
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: u64) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// Inserts or replaces a value.
    pub fn put(&self, key: u64, value: &[u8]) -> CoreResult<()> {
        let record = encode_record(TAG_PUT, key, value)?;
        let mut log = self.log.lock();
        log.main.append(&record)?;
        log.records += 1;
        self.entries.write().insert(key, value.to_vec());
        Ok(())
    }

    /// Removes a key, returning its previous value.
    pub fn remove(&self, key: u64) -> CoreResult<Option<Vec<u8>>> {
        let mut log = self.log.lock();
        if !self.entries.read().contains_key(&key) {
            return Ok(None);
        }

        let mut entries = self.entries.write();
        let previous = entries.remove(&key);
        if entries.is_empty() {
            log.main.truncate(0)?;
            log.records = 0;
        } else {
            log.main.append(&encode_record(TAG_REMOVE, key, &[])?)?;
            log.records += 1;
        }
        Ok(previous)
    }

    /// Removes every entry and truncates the log.
    pub fn clear(&self) -> CoreResult<()> {
        let mut log = self.log.lock();
        log.main.truncate(0)?;
        log.records = 0;
        self.entries.write().clear();
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Smallest key.
    pub fn first_key(&self) -> Option<u64> {
        self.entries.read().keys().next().copied()
    }

    /// Largest key.
    pub fn last_key(&self) -> Option<u64> {
        self.entries.read().keys().next_back().copied()
    }

    /// Greatest entry with key `<= key`.
    pub fn floor(&self, key: u64) -> Option<(u64, Vec<u8>)> {
        self.entries
            .read()
            .range(..=key)
            .next_back()
            .map(|(k, v)| (*k, v.clone()))
    }

    /// Least entry with key `>= key`.
    pub fn ceiling(&self, key: u64) -> Option<(u64, Vec<u8>)> {
        self.entries
            .read()
            .range(key..)
            .next()
            .map(|(k, v)| (*k, v.clone()))
    }

    /// Copies out the entries within `range`, in key order.
    pub fn range<R: RangeBounds<u64>>(&self, range: R) -> Vec<(u64, Vec<u8>)> {
        self.entries
            .read()
            .range(range)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Copies out every key, in order.
    pub fn keys(&self) -> Vec<u64> {
        self.entries.read().keys().copied().collect()
    }

    /// Makes all writes so far durable and bumps the version.
    ///
    /// Compacts the log first when dead records outnumber live ones.
    pub fn commit(&self) -> CoreResult<u64> {
        let mut log = self.log.lock();
        log.main.flush()?;
        log.main.sync()?;
        let live = self.entries.read().len() as u64;
        if log.scratch.is_some()
            && log.records >= COMPACT_MIN_RECORDS
            && log.records >= live.saturating_mul(2)
        {
            self.compact(&mut log)?;
        }
        Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn compact(&self, log: &mut MapLog) -> CoreResult<()> {
        let MapLog {
            main,
            scratch,
            records,
        } = log;
        let Some(scratch) = scratch.as_mut() else {
            return Ok(());
        };

        let entries = self.entries.read();
        let mut image = Vec::new();
        for (key, value) in entries.iter() {
            image.extend_from_slice(&encode_record(TAG_PUT, *key, value)?);
        }
        let live = entries.len() as u64;
        drop(entries);

        scratch.truncate(0)?;
        scratch.append(&image)?;
        scratch.append(&encode_record(TAG_IMAGE_END, live, &[])?)?;
        scratch.sync()?;

        main.truncate(0)?;
        main.append(&image)?;
        main.sync()?;

        scratch.truncate(0)?;
        scratch.sync()?;

        debug!(map = %self.name, before = *records, after = live, "compacted map log");
        *records = live;
        Ok(())
    }

    /// Number of commits since open.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Takes a consistent point-in-time copy of the map.
    pub fn snapshot(&self) -> MapSnapshot {
        let _log = self.log.lock();
        MapSnapshot {
            version: self.version(),
            entries: self.entries.read().clone(),
        }
    }
}

impl std::fmt::Debug for OrderedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMap")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

fn encode_record(tag: u8, key: u64, value: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(value.len())
        .map_err(|_| CoreError::invalid_argument("map value too large"))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER + value.len() + RECORD_CRC);
    buf.push(tag);
    buf.extend_from_slice(&key.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Walks the records in `data`, calling `visit(tag, key, value, offset)`
/// for each, and returns the end of the intact prefix.
fn scan(
    data: &[u8],
    mut visit: impl FnMut(u8, u64, &[u8], usize) -> CoreResult<()>,
) -> CoreResult<u64> {
    let mut pos = 0usize;

    while data.len() - pos >= RECORD_HEADER {
        let header = &data[pos..pos + RECORD_HEADER];
        let tag = header[0];
        let mut key_bytes = [0u8; 8];
        key_bytes.copy_from_slice(&header[1..9]);
        let key = u64::from_le_bytes(key_bytes);
        let len = u32::from_le_bytes([header[9], header[10], header[11], header[12]]) as usize;

        let end = pos + RECORD_HEADER + len + RECORD_CRC;
        if end > data.len() {
            break;
        }

        let body = &data[pos..end - RECORD_CRC];
        let crc_bytes = &data[end - RECORD_CRC..end];
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        visit(tag, key, &body[RECORD_HEADER..], pos)?;
        pos = end;
    }

    Ok(pos as u64)
}

/// Returns the put records of a complete compaction image, or `None`.
fn read_image(data: &[u8]) -> Option<&[u8]> {
    let mut puts = 0u64;
    let mut image_end = None;
    let valid_end = scan(data, |tag, key, _, offset| {
        match (tag, image_end) {
            (TAG_PUT, None) => puts += 1,
            (TAG_IMAGE_END, None) if key == puts => image_end = Some(offset),
            _ => {
                return Err(StorageError::Corrupted("malformed compaction image".into()).into())
            }
        }
        Ok(())
    })
    .ok()?;
    let image_end = image_end?;
    (valid_end == data.len() as u64).then(|| &data[..image_end])
}

/// Copies a complete image from `scratch` over `main`, then empties `scratch`.
fn restore_image(
    name: &str,
    main: &mut dyn StorageBackend,
    scratch: &mut dyn StorageBackend,
) -> CoreResult<()> {
    if scratch.size()? == 0 {
        return Ok(());
    }

    let data = scratch.read_all()?;
    match read_image(&data) {
        Some(image) => {
            info!(map = %name, bytes = image.len(), "finishing interrupted compaction");
            main.truncate(0)?;
            main.append(image)?;
            main.sync()?;
        }
        None => warn!(map = %name, "discarding incomplete compaction image"),
    }
    scratch.truncate(0)?;
    scratch.sync()?;
    Ok(())
}
