//! One log file per backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// A backend stored as `<dir>/<name>.log`.
///
/// `flush` hands buffered bytes to the OS; `sync` and `truncate` wait for
/// them to reach the disk.
#[derive(Debug)]
pub struct FileBackend {
    log: Mutex<LogFile>,
}

/// The open file and its length; reads seek, so they take the lock too.
#[derive(Debug)]
struct LogFile {
    file: File,
    len: u64,
}

impl FileBackend {
    /// Opens `<dir>/<name>.log`, creating `dir` and the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open_in(dir: &Path, name: &str) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(format!("{name}.log")))
    }

    fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened log file");
        Ok(Self {
            log: Mutex::new(LogFile { file, len }),
        })
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut log = self.log.lock();
        let size = log.len;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let mut bytes = vec![0u8; len];
        if len > 0 {
            log.file.seek(SeekFrom::Start(offset))?;
            log.file.read_exact(&mut bytes)?;
        }
        Ok(bytes)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let log = self.log.get_mut();
        let offset = log.len;
        if !data.is_empty() {
            log.file.seek(SeekFrom::Start(offset))?;
            log.file.write_all(data)?;
            log.len += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(self.log.get_mut().file.flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.log.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(self.log.get_mut().file.sync_all()?)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let log = self.log.get_mut();
        if new_size > log.len {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: log.len,
            });
        }
        log.file.set_len(new_size)?;
        log.file.sync_all()?;
        log.len = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_return_offsets_and_read_back() {
        let dir = tempdir().unwrap();
        let mut wal = FileBackend::open_in(dir.path(), "wal").unwrap();

        assert_eq!(wal.append(b"start").unwrap(), 0);
        assert_eq!(wal.append(b"commit").unwrap(), 5);
        assert_eq!(wal.read_at(5, 6).unwrap(), b"commit");
        assert!(matches!(
            wal.read_at(8, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn synced_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut map = FileBackend::open_in(dir.path(), "primary.user").unwrap();
            map.append(b"record").unwrap();
            map.sync().unwrap();
        }

        let map = FileBackend::open_in(dir.path(), "primary.user").unwrap();
        assert_eq!(map.read_all().unwrap(), b"record");
        assert!(dir.path().join("primary.user.log").exists());
    }

    #[test]
    fn torn_tail_can_be_cut_off() {
        let dir = tempdir().unwrap();
        let mut ops = FileBackend::open_in(dir.path(), "ops").unwrap();
        ops.append(b"whole").unwrap();
        ops.append(b"tor").unwrap();

        ops.truncate(5).unwrap();
        assert_eq!(ops.append(b"!").unwrap(), 5);
        assert_eq!(ops.read_all().unwrap(), b"whole!");
        assert!(ops.truncate(50).is_err());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("db").join("indexes");

        let backend = FileBackend::open_in(&nested, "meta").unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(nested.join("meta.log").exists());
    }
}
