//! Drives one index: startup reconciliation and online updates.
//!
//! ## Startup
//!
//! 1. Read the index's own hard commit. If it is beyond the log's latest
//!    op, the index reflects history the log no longer has: clear it.
//! 2. With nothing trustworthy applied (cursor 0), rebuild from primary
//!    storage: clear the log, open a rebuild window sized to primary
//!    storage, and re-log payloads already generated by an interrupted
//!    pass.
//! 3. Record the cursor as the log's hard commit, truncating below it.
//! 4. Replay up to the last rebuild op written so far.
//! 5. If the window is still open, generate the rest: for each primary
//!    record after the generation pointer, generate (or reuse) its
//!    payload, log it, apply it, and advance the pointer. A crash resumes
//!    from the last applied record.
//! 6. Replay to the latest op, then serve online writes.
//!
//! ## Online writes
//!
//! A write persists its payload, records `data_id -> stored_id`, appends a
//! log entry and then drains: every entry up to the log horizon is applied
//! in op order. An entry whose predecessor is still being written waits
//! for the writer of that predecessor to drain.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::index::events::{IndexEvent, IndexEvents, IndexState, IndexStatus};
use crate::index::oplog::{IndexOp, IndexOperationLog, RebuildWindow};
use crate::index::traits::{generate_bytes, Index};
use crate::store::{MapStore, OrderedMap, PayloadStore, TypedMap};
use crate::types::{DataId, OpId, StoredId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Name of the primary-storage map for `entity`.
pub fn primary_map_name(entity: &str) -> String {
    format!("primary.{entity}")
}

/// Controller for one index of one entity.
pub struct IndexController {
    entity: String,
    index: Arc<dyn Index>,
    log: IndexOperationLog,
    primary: Arc<OrderedMap>,
    data: TypedMap<StoredId>,
    payloads: PayloadStore,
    soft_cursor: AtomicU64,
    apply_lock: Mutex<()>,
    gc_lock: RwLock<()>,
    drain_requested: AtomicBool,
    running: AtomicBool,
    cancelled: AtomicBool,
    status: IndexStatus,
    events: Arc<IndexEvents>,
    progress_interval: Duration,
}

impl IndexController {
    /// Opens the controller's maps. Nothing is applied until [`start`](Self::start).
    pub fn open(
        entity: &str,
        index: Arc<dyn Index>,
        maps: &MapStore,
        events: Arc<IndexEvents>,
        config: &Config,
    ) -> CoreResult<Self> {
        let prefix = format!("index.{entity}.{}", index.name());
        let log = IndexOperationLog::open(
            maps.open_typed(&format!("{prefix}.ops"))?,
            maps.open_typed(&format!("{prefix}.meta"))?,
        )?;

        Ok(Self {
            entity: entity.to_string(),
            log,
            primary: maps.open_map(&primary_map_name(entity))?,
            data: maps.open_typed(&format!("{prefix}.data"))?,
            payloads: PayloadStore::new(maps.open_map(&format!("{prefix}.payloads"))?),
            index,
            soft_cursor: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
            gc_lock: RwLock::new(()),
            drain_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            status: IndexStatus::new(),
            events,
            progress_interval: config.progress_interval,
        })
    }

    /// Index name.
    pub fn name(&self) -> &str {
        self.index.name()
    }

    /// Entity the index belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The index being driven.
    pub fn index(&self) -> &Arc<dyn Index> {
        &self.index
    }

    /// The index's operation log.
    pub fn log(&self) -> &IndexOperationLog {
        &self.log
    }

    /// Last op applied to the live index.
    pub fn soft_cursor(&self) -> OpId {
        OpId::new(self.soft_cursor.load(Ordering::SeqCst))
    }

    /// Latest op id in the log.
    pub fn last_op_id(&self) -> OpId {
        self.log.latest_op()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        self.status.get()
    }

    /// Waitable status.
    pub fn status(&self) -> &IndexStatus {
        &self.status
    }

    /// Returns true once startup finished and online writes are applied.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks a running startup to stop at the next record. Progress is kept.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Reconciles the index with its log and primary storage.
    ///
    /// Blocks until the index is up to date. Failures are fatal for this
    /// index only and are also reported through its status and events.
    pub fn start(&self) -> CoreResult<()> {
        self.status.set(IndexState::Starting);
        match self.run_startup() {
            Ok(()) => Ok(()),
            Err(CoreError::Cancelled) => {
                info!(index = %self.name(), "index startup cancelled");
                self.status.set(IndexState::Cancelled);
                Err(CoreError::Cancelled)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Marks the index failed and stops applying online writes.
    ///
    /// Ops that were logged but not applied stay in the log; the next
    /// startup replays them.
    pub(crate) fn fail(&self, e: CoreError) -> CoreError {
        self.running.store(false, Ordering::SeqCst);
        let message = match e {
            CoreError::IndexFailed { message, .. } => message,
            other => other.to_string(),
        };
        error!(index = %self.name(), error = %message, "index failed");
        self.status.set(IndexState::Failed(message.clone()));
        self.events.emit(IndexEvent::Failed {
            index: self.name().to_string(),
            message: message.clone(),
        });
        CoreError::index_failed(self.name(), message)
    }

    /// Records a new payload for `data_id` and applies it when no earlier
    /// op is still pending.
    ///
    /// Errors only if the op could not be recorded. A failure to apply it
    /// fails the index instead (see [`state`](Self::state)).
    pub fn store(&self, data_id: DataId, payload: &[u8]) -> CoreResult<OpId> {
        let op = {
            let _gc = self.gc_lock.read();
            let stored_id = self.payloads.insert(payload)?;
            self.data.put(data_id.as_u64(), &stored_id)?;
            self.log.append_store(data_id, stored_id)?
        };
        self.after_append(op)?;
        Ok(op)
    }

    /// Records the deletion of `data_id`.
    pub fn delete(&self, data_id: DataId) -> CoreResult<OpId> {
        self.data.remove(data_id.as_u64())?;
        let op = self.log.append_delete(data_id)?;
        self.after_append(op)?;
        Ok(op)
    }

    /// Syncs the index's durable watermark into the log, dropping entries
    /// it covers and any payload nothing refers to any more.
    pub fn checkpoint(&self) -> CoreResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let hard = self.index.last_hard_commit()?;
        if hard <= self.log.last_hard_commit() {
            return Ok(());
        }
        if hard > self.log.latest_op() {
            warn!(index = %self.name(), hard = %hard, "index hard commit is beyond its log");
            return Ok(());
        }

        let _gc = self.gc_lock.write();
        let dropped = self.log.set_last_hard_commit(hard)?;
        let pruned = self.prune_payloads()?;
        debug!(
            index = %self.name(),
            hard_commit = %hard,
            dropped = dropped.len(),
            pruned,
            "index checkpoint"
        );
        Ok(())
    }

    fn after_append(&self, op: OpId) -> CoreResult<()> {
        if !self.is_running() {
            debug!(index = %self.name(), op_id = %op, "deferring op until the next startup");
            return Ok(());
        }
        if let Err(e) = self.drain() {
            self.fail(e);
        }
        Ok(())
    }

    /// Applies everything up to the log horizon.
    ///
    /// Only one thread applies at a time. A thread that finds the apply
    /// lock taken leaves a request behind, which the holder honours before
    /// releasing.
    fn drain(&self) -> CoreResult<()> {
        self.drain_requested.store(true, Ordering::SeqCst);
        loop {
            let Some(guard) = self.apply_lock.try_lock() else {
                return Ok(());
            };
            while self.drain_requested.swap(false, Ordering::SeqCst) {
                self.apply_through(self.log.horizon())?;
            }
            drop(guard);
            if !self.drain_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    fn run_startup(&self) -> CoreResult<()> {
        let started = Instant::now();
        let guard = self.apply_lock.lock();

        let hard = self.index.last_hard_commit()?;
        let latest = self.log.latest_op();
        let mut cursor = hard;
        if hard > latest {
            warn!(
                index = %self.name(),
                hard_commit = %hard,
                latest = %latest,
                "index is ahead of its log; clearing it"
            );
            self.index.clear()?;
            cursor = OpId::ZERO;
        }

        if cursor == OpId::ZERO {
            self.prepare_rebuild()?;
        }
        self.log.set_last_hard_commit(cursor)?;
        self.soft_cursor.store(cursor.as_u64(), Ordering::SeqCst);

        if let Some(window) = self.log.rebuild_window() {
            self.apply_through(OpId::new(window.next.as_u64() - 1))?;
            self.generate_remaining(window)?;
        }
        if self.log.generation_pointer() != DataId::default() {
            self.log.set_generation_pointer(DataId::default())?;
        }

        self.status.set(IndexState::Queryable);
        self.events.emit(IndexEvent::Queryable {
            index: self.name().to_string(),
        });

        self.apply_through(self.log.horizon())?;
        self.running.store(true, Ordering::SeqCst);
        drop(guard);
        self.drain()?;

        self.status.set(IndexState::UpToDate);
        self.events.emit(IndexEvent::UpToDate {
            index: self.name().to_string(),
        });
        info!(
            index = %self.name(),
            soft_cursor = %self.soft_cursor(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index up to date"
        );
        Ok(())
    }

    /// Clears the log and opens a rebuild window over primary storage,
    /// re-logging payloads an interrupted pass already generated.
    fn prepare_rebuild(&self) -> CoreResult<()> {
        let pointer = self.log.generation_pointer();
        self.index.clear()?;
        self.log.clear()?;

        let snapshot = self.primary.snapshot();
        for (data_id, _) in self.data.entries()? {
            if !snapshot.entries.contains_key(&data_id) {
                self.data.remove(data_id)?;
            }
        }

        let Some(largest) = snapshot.last_key() else {
            debug!(index = %self.name(), "primary storage is empty; nothing to rebuild");
            return Ok(());
        };
        self.log
            .set_rebuild_max(snapshot.len() as u64, DataId::new(largest))?;
        info!(
            index = %self.name(),
            size = snapshot.len(),
            resume_after = %pointer,
            "rebuilding index from primary storage"
        );

        for (&key, bytes) in snapshot.entries.range(..=pointer.as_u64()) {
            let data_id = DataId::new(key);
            let stored_id = self.payload_for(data_id, bytes)?;
            self.log.append_rebuild(data_id, stored_id)?;
        }
        Ok(())
    }

    /// Generates and applies the rest of the rebuild window, one record
    /// at a time.
    fn generate_remaining(&self, window: RebuildWindow) -> CoreResult<()> {
        let pointer = self.log.generation_pointer();
        let total = window.max.as_u64();
        let mut done = window.next.as_u64() - 1;
        let mut last_progress = Instant::now();

        if pointer < window.max_data_id {
            let snapshot = self.primary.snapshot();
            let range = (
                Bound::Excluded(pointer.as_u64()),
                Bound::Included(window.max_data_id.as_u64()),
            );
            for (&key, bytes) in snapshot.entries.range(range) {
                if self.cancelled.load(Ordering::SeqCst) {
                    return Err(CoreError::Cancelled);
                }

                let data_id = DataId::new(key);
                let stored_id = self.payload_for(data_id, bytes)?;
                let op = self.log.append_rebuild(data_id, stored_id)?;
                self.apply_entry(op, IndexOp::Store { data_id, stored_id })?;
                self.log.set_generation_pointer(data_id)?;
                done += 1;

                if last_progress.elapsed() >= self.progress_interval {
                    last_progress = Instant::now();
                    info!(index = %self.name(), done, total, "rebuild progress");
                    self.events.emit(IndexEvent::Progress {
                        index: self.name().to_string(),
                        done,
                        total,
                    });
                }
                if self.log.rebuild_window().is_none() {
                    break;
                }
            }
        }

        self.log.close_rebuild_window()?;
        self.events.emit(IndexEvent::Progress {
            index: self.name().to_string(),
            done,
            total,
        });
        Ok(())
    }

    /// Stored payload for a primary record, generating it only if no
    /// stored payload exists yet.
    fn payload_for(&self, data_id: DataId, bytes: &[u8]) -> CoreResult<StoredId> {
        let _gc = self.gc_lock.read();
        if let Some(stored_id) = self.data.get(data_id.as_u64())? {
            if self.payloads.contains(stored_id) {
                return Ok(stored_id);
            }
        }

        let payload = generate_bytes(self.index.as_ref(), bytes)?;
        let stored_id = self.payloads.insert(&payload)?;
        self.data.put(data_id.as_u64(), &stored_id)?;
        Ok(stored_id)
    }

    fn apply_through(&self, target: OpId) -> CoreResult<()> {
        let cursor = self.soft_cursor();
        if target <= cursor {
            return Ok(());
        }
        for (op, entry) in self.log.entries(cursor, target)? {
            self.apply_entry(op, entry)?;
        }
        self.soft_cursor.fetch_max(target.as_u64(), Ordering::SeqCst);
        Ok(())
    }

    fn apply_entry(&self, op: OpId, entry: IndexOp) -> CoreResult<()> {
        match entry {
            IndexOp::Store { data_id, stored_id } => {
                let payload = self.payloads.get(stored_id).ok_or_else(|| {
                    CoreError::index_failed(
                        self.name(),
                        format!("payload {stored_id} for {data_id} is missing"),
                    )
                })?;
                self.index.apply(op, data_id, &mut payload.as_slice())?;
            }
            IndexOp::Deletion { data_id } => self.index.delete(op, data_id)?,
        }
        self.soft_cursor.fetch_max(op.as_u64(), Ordering::SeqCst);
        Ok(())
    }

    fn prune_payloads(&self) -> CoreResult<usize> {
        let mut referenced: BTreeSet<StoredId> = self.log.referenced_payloads()?;
        referenced.extend(self.data.entries()?.into_iter().map(|(_, id)| id));

        let mut pruned = 0;
        for stored_id in self.payloads.ids() {
            if !referenced.contains(&stored_id) {
                self.payloads.remove(stored_id)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for IndexController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexController")
            .field("entity", &self.entity)
            .field("index", &self.name())
            .field("soft_cursor", &self.soft_cursor())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::store::MemoryProvider;

    struct Fixture {
        provider: MemoryProvider,
        maps: MapStore,
        events: Arc<IndexEvents>,
    }

    impl Fixture {
        fn new() -> Self {
            let provider = MemoryProvider::new();
            Self {
                maps: MapStore::new(Arc::new(provider.clone())),
                provider,
                events: Arc::new(IndexEvents::new()),
            }
        }

        fn controller(&self, index: Arc<MemoryIndex>) -> IndexController {
            IndexController::open(
                "user",
                index,
                &self.maps,
                Arc::clone(&self.events),
                &Config::default(),
            )
            .unwrap()
        }

        fn primary(&self) -> Arc<OrderedMap> {
            self.maps.open_map(&primary_map_name("user")).unwrap()
        }

        fn put(&self, controller: &IndexController, id: u64, value: &[u8]) -> OpId {
            self.primary().put(id, value).unwrap();
            controller.store(DataId::new(id), value).unwrap()
        }
    }

    #[test]
    fn store_then_store() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        controller.start().unwrap();

        fx.put(&controller, 1, b"v1");
        fx.put(&controller, 2, b"v2");

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(DataId::new(1)), Some(b"v1".to_vec()));
        assert_eq!(index.get(DataId::new(2)), Some(b"v2".to_vec()));
        assert_eq!(controller.soft_cursor(), OpId::new(2));
    }

    #[test]
    fn store_delete_store() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        controller.start().unwrap();

        fx.put(&controller, 1, b"v1");
        fx.primary().remove(1).unwrap();
        controller.delete(DataId::new(1)).unwrap();
        fx.put(&controller, 1, b"v1");

        assert_eq!(index.len(), 1);
        assert!(index.contains_payload(b"v1"));
        assert_eq!(controller.last_op_id(), OpId::new(3));
    }

    #[test]
    fn empty_start_is_immediately_up_to_date() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        let events = fx.events.subscribe();

        controller.start().unwrap();

        assert_eq!(controller.state(), IndexState::UpToDate);
        assert!(controller.log().rebuild_window().is_none());
        assert_eq!(controller.last_op_id(), OpId::ZERO);
        assert_eq!(controller.log().watermarks().rebuild_max, OpId::ZERO);
        let received: Vec<IndexEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                IndexEvent::Queryable { index: "raw".into() },
                IndexEvent::UpToDate { index: "raw".into() },
            ]
        );
    }

    #[test]
    fn writes_before_start_are_applied_by_start() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));

        fx.put(&controller, 1, b"early");
        assert!(index.is_empty());

        controller.start().unwrap();
        assert_eq!(index.get(DataId::new(1)), Some(b"early".to_vec()));
    }

    #[test]
    fn later_op_waits_for_an_earlier_unwritten_one() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        controller.start().unwrap();

        // a concurrent writer has reserved op 1 but not written it yet
        let pending = controller.log.reserve().unwrap();
        let stored = controller.payloads.insert(b"first").unwrap();

        let op = fx.put(&controller, 2, b"second");
        assert_eq!(op, OpId::new(2));
        assert!(index.is_empty());
        assert_eq!(controller.soft_cursor(), OpId::ZERO);

        controller
            .log
            .persist(
                pending,
                IndexOp::Store {
                    data_id: DataId::new(1),
                    stored_id: stored,
                },
            )
            .unwrap();
        controller.drain().unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(controller.soft_cursor(), OpId::new(2));
    }

    #[test]
    fn checkpoint_truncates_log_and_prunes_payloads() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        controller.start().unwrap();

        fx.put(&controller, 1, b"old");
        fx.put(&controller, 1, b"new");
        assert_eq!(controller.payloads.len(), 2);

        index.hard_commit();
        controller.checkpoint().unwrap();

        assert!(controller.log().is_empty());
        assert_eq!(controller.log().last_hard_commit(), OpId::new(2));
        assert_eq!(controller.payloads.len(), 1);
        assert_eq!(index.get(DataId::new(1)), Some(b"new".to_vec()));
    }

    #[test]
    fn index_ahead_of_log_is_rebuilt() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        {
            let controller = fx.controller(Arc::clone(&index));
            controller.start().unwrap();
            fx.put(&controller, 1, b"a");
            fx.put(&controller, 2, b"b");
            index.hard_commit();
        }

        // the log is lost; the index claims op 2
        fx.provider.discard("index.user.raw.ops");
        fx.provider.discard("index.user.raw.meta");
        let maps = MapStore::new(Arc::new(fx.provider.clone()));
        let reopened = Arc::new(index.reopen());
        let controller = IndexController::open(
            "user",
            Arc::clone(&reopened) as Arc<dyn Index>,
            &maps,
            Arc::new(IndexEvents::new()),
            &Config::default(),
        )
        .unwrap();

        controller.start().unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(controller.last_op_id(), OpId::new(2));
    }

    #[test]
    fn failed_apply_fails_startup() {
        let fx = Fixture::new();
        let index = Arc::new(MemoryIndex::new("raw"));
        let controller = fx.controller(Arc::clone(&index));
        controller.log.append_store(DataId::new(1), StoredId::new(99)).unwrap();
        index.apply(OpId::new(1), DataId::new(5), &mut &b"x"[..]).unwrap();
        index.hard_commit();
        controller.log.append_store(DataId::new(2), StoredId::new(98)).unwrap();

        let err = controller.start().unwrap_err();
        assert!(matches!(err, CoreError::IndexFailed { .. }));
        assert!(matches!(controller.state(), IndexState::Failed(_)));
        assert!(controller
            .status()
            .wait_up_to_date("raw", Duration::from_millis(10))
            .is_err());
    }
}
