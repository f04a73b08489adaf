//! Database facade: primary storage, indexes and the transaction log.

use crate::background::Periodic;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::index::{
    generate_bytes, primary_map_name, Index, IndexController, IndexEvent, IndexEvents,
};
use crate::store::{validate_name, BackendProvider, DirectoryProvider, MapStore, MemoryProvider};
use crate::transaction::{StorageApplier, Transaction, TransactionLog, TransactionSupport};
use crate::types::{DataId, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the backend holding the transaction log.
const WAL_NAME: &str = "wal";

/// Controllers by entity, in registration order.
#[derive(Debug, Default)]
struct Registry {
    by_entity: BTreeMap<String, Vec<Arc<IndexController>>>,
}

impl Registry {
    fn for_entity(&self, entity: &str) -> &[Arc<IndexController>] {
        self.by_entity.get(entity).map_or(&[], Vec::as_slice)
    }

    fn find(&self, entity: &str, index: &str) -> Option<&Arc<IndexController>> {
        self.for_entity(entity).iter().find(|c| c.name() == index)
    }

    fn all(&self) -> impl Iterator<Item = &Arc<IndexController>> {
        self.by_entity.values().flatten()
    }
}

/// Applies committed transactions to primary storage and fans derived
/// payloads out to index controllers.
struct IndexingApplier {
    maps: Arc<MapStore>,
    registry: Arc<Registry>,
}

impl StorageApplier for IndexingApplier {
    fn transaction_start(&self, txid: TransactionId) -> CoreResult<()> {
        debug!(txid = %txid, "applying committed transaction");
        Ok(())
    }

    fn store(&self, entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.maps
            .open_map(&primary_map_name(entity))?
            .put(id.as_u64(), &bytes)
    }

    fn delete(&self, entity: &str, id: DataId) -> CoreResult<()> {
        self.maps
            .open_map(&primary_map_name(entity))?
            .remove(id.as_u64())?;
        // every index gets the delete even when an earlier one could not log it
        let mut first_error = None;
        for controller in self.registry.for_entity(entity) {
            if let Err(e) = controller.delete(id) {
                warn!(index = %controller.name(), data_id = %id, error = %e, "index delete not logged");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn index(&self, entity: &str, index: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
        let Some(controller) = self.registry.find(entity, index) else {
            warn!(entity, index, data_id = %id, "dropping payload for an unregistered index");
            return Ok(());
        };
        let mut payload = Vec::new();
        data.read_to_end(&mut payload)?;
        // apply failures fail the index, not the transaction
        controller.store(id, &payload)?;
        Ok(())
    }

    fn persist(&self) -> CoreResult<()> {
        self.maps.commit_all()
    }

    fn transaction_complete(&self, txid: TransactionId, error: Option<&CoreError>) {
        if let Some(e) = error {
            warn!(txid = %txid, error = %e, "committed transaction failed to apply");
        }
    }
}

/// Collects indexes and storage before the database opens.
///
/// Indexes must be known before the transaction log replays, so that
/// replayed index payloads reach their controllers.
pub struct DatabaseBuilder {
    config: Config,
    provider: Option<Arc<dyn BackendProvider>>,
    indexes: Vec<(String, Arc<dyn Index>)>,
}

impl DatabaseBuilder {
    /// Stores everything through `provider`.
    #[must_use]
    pub fn provider(mut self, provider: impl BackendProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Stores everything as files in `dir`.
    #[must_use]
    pub fn directory(self, dir: impl AsRef<Path>) -> Self {
        self.provider(DirectoryProvider::new(dir))
    }

    /// Registers `index` on `entity`.
    #[must_use]
    pub fn register_index(mut self, entity: &str, index: Arc<dyn Index>) -> Self {
        self.indexes.push((entity.to_string(), index));
        self
    }

    /// Opens the database.
    ///
    /// Opens every map, creates a controller per registered index and then
    /// replays the transaction log. Indexes are not started; call
    /// [`Database::start_indexes`].
    pub fn open(self) -> CoreResult<Database> {
        let provider: Arc<dyn BackendProvider> = self
            .provider
            .unwrap_or_else(|| Arc::new(MemoryProvider::new()));
        let maps = Arc::new(MapStore::new(Arc::clone(&provider)));
        let events = Arc::new(IndexEvents::new());

        let mut registry = Registry::default();
        for (entity, index) in self.indexes {
            validate_name(&entity)?;
            validate_name(index.name())?;
            let entries = registry.by_entity.entry(entity.clone()).or_default();
            if entries.iter().any(|c| c.name() == index.name()) {
                return Err(CoreError::invalid_argument(format!(
                    "index {} is registered twice on {entity}",
                    index.name()
                )));
            }
            let controller =
                IndexController::open(&entity, index, &maps, Arc::clone(&events), &self.config)?;
            entries.push(Arc::new(controller));
        }
        let registry = Arc::new(registry);

        let applier = Arc::new(IndexingApplier {
            maps: Arc::clone(&maps),
            registry: Arc::clone(&registry),
        });
        let log = Arc::new(TransactionLog::open(
            provider.open(WAL_NAME)?,
            applier,
            &self.config,
        )?);

        let committer = {
            let maps = Arc::clone(&maps);
            let registry = Arc::clone(&registry);
            Periodic::spawn("committer", self.config.store_commit_interval, move || {
                commit_and_checkpoint(&maps, &registry)
            })?
        };
        let sweeper = {
            let log = Arc::clone(&log);
            Periodic::spawn("sweeper", self.config.sweep_interval, move || {
                log.sweep_stale().map(|_| ())
            })?
        };

        info!(
            indexes = registry.all().count(),
            maps = maps.names().len(),
            "database opened"
        );

        Ok(Database {
            support: TransactionSupport::new(Arc::clone(&log), self.config.retry.clone()),
            config: self.config,
            maps,
            log,
            registry,
            events,
            workers: Mutex::new(vec![committer, sweeper]),
            startups: Mutex::new(Vec::new()),
            is_open: RwLock::new(true),
        })
    }
}

fn commit_and_checkpoint(maps: &MapStore, registry: &Registry) -> CoreResult<()> {
    for controller in registry.all() {
        controller.checkpoint()?;
    }
    maps.commit_all()
}

/// The main database handle.
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tessera_core::{Config, DataId, Database, MemoryIndex};
///
/// let by_bytes = Arc::new(MemoryIndex::new("by_bytes"));
/// let db = Database::builder(Config::default())
///     .register_index("user", by_bytes.clone())
///     .open()?;
/// db.start_indexes()?;
///
/// db.run_in_transaction(|tx| db.store(tx, "user", DataId::new(1), b"alice"))?;
/// assert_eq!(db.get("user", DataId::new(1))?, Some(b"alice".to_vec()));
/// ```
pub struct Database {
    config: Config,
    maps: Arc<MapStore>,
    log: Arc<TransactionLog>,
    support: TransactionSupport,
    registry: Arc<Registry>,
    events: Arc<IndexEvents>,
    workers: Mutex<Vec<Periodic>>,
    startups: Mutex<Vec<JoinHandle<CoreResult<()>>>>,
    is_open: RwLock<bool>,
}

impl Database {
    /// Starts configuring a database.
    pub fn builder(config: Config) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            provider: None,
            indexes: Vec::new(),
        }
    }

    /// Opens an in-memory database with no indexes.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::builder(Config::default()).open()
    }

    /// Runs every controller's startup, each on its own thread.
    ///
    /// Returns once the threads are spawned; use
    /// [`wait_up_to_date`](Self::wait_up_to_date) or [`subscribe`](Self::subscribe)
    /// to learn when each index is ready.
    pub fn start_indexes(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let mut startups = self.startups.lock();
        for controller in self.registry.all() {
            let controller = Arc::clone(controller);
            let handle = std::thread::Builder::new()
                .name(format!("tessera-index-{}", controller.name()))
                .spawn(move || controller.start())?;
            startups.push(handle);
        }
        Ok(())
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        Ok(self.support.begin())
    }

    /// Stores `bytes` as `entity/id` in `tx`, along with a derived payload
    /// for every index registered on `entity`.
    pub fn store(&self, tx: &Transaction, entity: &str, id: DataId, bytes: &[u8]) -> CoreResult<()> {
        self.ensure_open()?;
        validate_name(entity)?;
        tx.store_bytes(entity, id, bytes)?;
        for controller in self.registry.for_entity(entity) {
            let payload = generate_bytes(controller.index().as_ref(), bytes)?;
            tx.store_index(entity, controller.name(), id, &mut payload.as_slice())?;
        }
        Ok(())
    }

    /// Deletes `entity/id` in `tx`.
    pub fn delete(&self, tx: &Transaction, entity: &str, id: DataId) -> CoreResult<()> {
        self.ensure_open()?;
        validate_name(entity)?;
        tx.delete(entity, id)
    }

    /// Reads the committed value of `entity/id`.
    pub fn get(&self, entity: &str, id: DataId) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        validate_name(entity)?;
        Ok(self.maps.open_map(&primary_map_name(entity))?.get(id.as_u64()))
    }

    /// Number of committed records of `entity`.
    pub fn len(&self, entity: &str) -> CoreResult<usize> {
        self.ensure_open()?;
        validate_name(entity)?;
        Ok(self.maps.open_map(&primary_map_name(entity))?.len())
    }

    /// Runs `work` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn run_in_transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        self.ensure_open()?;
        self.support.run_in_transaction(work)
    }

    /// Like [`run_in_transaction`](Self::run_in_transaction), retrying the
    /// whole unit on a transaction conflict.
    pub fn run_with_retry<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnMut(&Transaction) -> CoreResult<T>,
    {
        self.ensure_open()?;
        self.support.run_with_retry(work)
    }

    /// The controller of `index` on `entity`.
    pub fn controller(&self, entity: &str, index: &str) -> Option<Arc<IndexController>> {
        self.registry.find(entity, index).cloned()
    }

    /// Blocks until `index` on `entity` is up to date.
    pub fn wait_up_to_date(&self, entity: &str, index: &str, timeout: Duration) -> CoreResult<()> {
        let controller = self
            .registry
            .find(entity, index)
            .ok_or_else(|| CoreError::IndexNotFound {
                name: format!("{entity}.{index}"),
            })?;
        controller.status().wait_up_to_date(index, timeout)
    }

    /// Receives index events emitted from now on.
    pub fn subscribe(&self) -> Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Checkpoints every index and commits every map.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        commit_and_checkpoint(&self.maps, &self.registry)?;
        self.log.flush()
    }

    /// Rolls back transactions open longer than the stale timeout.
    pub fn sweep_stale(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        self.log.sweep_stale()
    }

    /// The transaction log.
    pub fn transaction_log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops background work and flushes everything.
    ///
    /// Index startups still running are cancelled; their progress is kept.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        *is_open = false;

        for worker in self.workers.lock().iter_mut() {
            worker.stop();
        }
        for controller in self.registry.all() {
            controller.cancel();
        }
        for handle in self.startups.lock().drain(..) {
            if handle.join().is_err() {
                warn!("index startup thread panicked");
            }
        }

        commit_and_checkpoint(&self.maps, &self.registry)?;
        self.log.flush()?;
        info!("database closed");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing database on drop failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("maps", &self.maps)
            .field("registry", &self.registry)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}
