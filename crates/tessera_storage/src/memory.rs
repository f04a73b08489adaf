//! Bytes kept in process memory.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A backend whose bytes live only as long as some handle onto them.
///
/// [`share`](Self::share) hands out another handle onto the same buffer.
/// Dropping a database and reopening it over a shared handle is how tests
/// restart without touching the filesystem. `flush` and `sync` do nothing.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend holding `bytes`, as if they had been written earlier.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Another handle onto the same bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// A copy of the current contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= bytes.len());
        match range {
            Some(range) => Ok(bytes[range].to_vec()),
            None => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        match usize::try_from(new_size) {
            Ok(len) if len <= bytes.len() => {
                bytes.truncate(len);
                Ok(())
            }
            _ => Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: bytes.len() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_land_at_the_previous_size() {
        let mut wal = InMemoryBackend::new();
        assert_eq!(wal.append(b"start").unwrap(), 0);
        assert_eq!(wal.append(b"commit").unwrap(), 5);
        assert_eq!(wal.size().unwrap(), 11);
        assert_eq!(wal.read_at(5, 6).unwrap(), b"commit");
    }

    #[test]
    fn reads_past_the_end_fail() {
        let wal = InMemoryBackend::with_data(b"start".to_vec());

        for (offset, len) in [(3, 10), (10, 1), (u64::MAX, 1)] {
            assert!(matches!(
                wal.read_at(offset, len),
                Err(StorageError::ReadPastEnd { .. })
            ));
        }
        assert!(InMemoryBackend::new().read_all().unwrap().is_empty());
    }

    #[test]
    fn reopened_handle_sees_earlier_writes() {
        let mut before_restart = InMemoryBackend::new();
        let after_restart = before_restart.share();
        before_restart.append(b"record").unwrap();
        drop(before_restart);

        assert_eq!(after_restart.read_all().unwrap(), b"record");
    }

    #[test]
    fn truncate_only_shrinks() {
        let mut ops = InMemoryBackend::with_data(b"wholetorn".to_vec());

        ops.truncate(5).unwrap();
        assert_eq!(ops.data(), b"whole");
        assert!(matches!(
            ops.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }
}
