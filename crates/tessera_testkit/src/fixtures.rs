//! Fixtures for controller and database tests.

use std::sync::{Arc, Once};
use tempfile::TempDir;
use tessera_core::index::primary_map_name;
use tessera_core::store::compaction_name;
use tessera_core::{
    Config, CoreResult, DataId, DirectoryProvider, Index, IndexController, IndexEvents, MapStore,
    MemoryProvider, OpId, OrderedMap,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test subscriber once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A directory provider over a temporary directory removed on drop.
pub struct TempProvider {
    dir: TempDir,
}

impl TempProvider {
    /// Creates a fresh temporary directory.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    /// A provider writing into the directory. Every call returns a new
    /// provider over the same files.
    pub fn provider(&self) -> DirectoryProvider {
        DirectoryProvider::new(self.dir.path())
    }

    /// Path of the directory.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Storage that outlives controller sessions, so a test can "restart"
/// by dropping one [`IndexSession`] and opening another.
#[derive(Debug, Clone)]
pub struct IndexHarness {
    entity: String,
    provider: MemoryProvider,
    config: Config,
}

impl IndexHarness {
    /// A harness for records of `entity`.
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            provider: MemoryProvider::new(),
            config: Config::default(),
        }
    }

    /// The storage shared by every session.
    pub fn provider(&self) -> &MemoryProvider {
        &self.provider
    }

    /// Opens a session driving `index`. The controller is not started.
    pub fn open(&self, index: Arc<dyn Index>) -> CoreResult<IndexSession> {
        let maps = MapStore::new(Arc::new(self.provider.clone()));
        let events = Arc::new(IndexEvents::new());
        let controller = IndexController::open(&self.entity, index, &maps, events, &self.config)?;
        Ok(IndexSession {
            primary: maps.open_map(&primary_map_name(&self.entity))?,
            controller,
            maps,
        })
    }

    /// Forgets the named index's operation log and payloads, as if its
    /// files had been deleted.
    pub fn discard_index_state(&self, index: &str) {
        for suffix in ["ops", "meta", "data", "payloads"] {
            let name = format!("index.{}.{index}.{suffix}", self.entity);
            self.provider.discard(&compaction_name(&name));
            self.provider.discard(&name);
        }
    }
}

/// One controller lifetime over an [`IndexHarness`].
pub struct IndexSession {
    maps: MapStore,
    primary: Arc<OrderedMap>,
    controller: IndexController,
}

impl IndexSession {
    /// The controller.
    pub fn controller(&self) -> &IndexController {
        &self.controller
    }

    /// Primary storage.
    pub fn primary(&self) -> &Arc<OrderedMap> {
        &self.primary
    }

    /// The session's map store.
    pub fn maps(&self) -> &MapStore {
        &self.maps
    }

    /// Commits primary storage, then hands the value to the index, the
    /// way a committed transaction does.
    pub fn store(&self, id: u64, value: &[u8]) -> CoreResult<OpId> {
        self.primary.put(id, value)?;
        self.controller.store(DataId::new(id), value)
    }

    /// Deletes from primary storage, then from the index.
    pub fn delete(&self, id: u64) -> CoreResult<OpId> {
        self.primary.remove(id)?;
        self.controller.delete(DataId::new(id))
    }

    /// Commits every map.
    pub fn commit(&self) -> CoreResult<()> {
        self.maps.commit_all()
    }
}
