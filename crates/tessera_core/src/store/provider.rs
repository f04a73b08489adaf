//! Where named backends come from.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Opens the byte store behind a named log or map.
pub trait BackendProvider: Send + Sync {
    /// Opens (or creates) the backend called `name`.
    fn open(&self, name: &str) -> CoreResult<Box<dyn StorageBackend>>;
}

/// Checks that `name` is usable as a backend name: ASCII alphanumerics,
/// `_`, `-` and `.`, not starting with a dot.
pub fn validate_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_argument(format!(
            "invalid backend name: {name:?}"
        )))
    }
}

/// In-memory backends, kept by name.
///
/// Opening the same name twice returns handles onto the same bytes, and
/// clones of the provider share everything, so a database can be dropped
/// and reopened over the same provider to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    backends: Arc<Mutex<HashMap<String, InMemoryBackend>>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle onto an already-opened backend.
    pub fn backend(&self, name: &str) -> Option<InMemoryBackend> {
        self.backends.lock().get(name).map(InMemoryBackend::share)
    }

    /// Forgets a backend, as if its file had been deleted.
    pub fn discard(&self, name: &str) -> bool {
        self.backends.lock().remove(name).is_some()
    }

    /// Names of every backend opened so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl BackendProvider for MemoryProvider {
    fn open(&self, name: &str) -> CoreResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let mut backends = self.backends.lock();
        let backend = backends.entry(name.to_string()).or_default();
        Ok(Box::new(backend.share()))
    }
}

/// File backends under one directory, one `<name>.log` file each.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    dir: PathBuf,
}

impl DirectoryProvider {
    /// Creates a provider rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// The root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackendProvider for DirectoryProvider {
    fn open(&self, name: &str) -> CoreResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        Ok(Box::new(FileBackend::open_in(&self.dir, name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_provider_shares_by_name() {
        let provider = MemoryProvider::new();
        let mut first = provider.open("wal").unwrap();
        first.append(b"abc").unwrap();

        let second = provider.clone().open("wal").unwrap();
        assert_eq!(second.size().unwrap(), 3);

        assert!(provider.discard("wal"));
        assert_eq!(provider.open("wal").unwrap().size().unwrap(), 0);
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("index.user.by_name.ops").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(MemoryProvider::new().open("a b").is_err());
    }

    #[test]
    fn directory_provider_persists_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryProvider::new(dir.path());
        {
            let mut backend = provider.open("primary.user").unwrap();
            backend.append(b"record").unwrap();
            backend.flush().unwrap();
        }

        assert!(dir.path().join("primary.user.log").exists());
        assert_eq!(provider.open("primary.user").unwrap().size().unwrap(), 6);
    }
}
