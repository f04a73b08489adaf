//! Per-index operation log.
//!
//! A second, independently truncatable log per index. Each entry records a
//! store (`data_id -> stored_id`) or a deletion under a monotonically
//! increasing op id. Alongside the entries sit a handful of watermarks,
//! kept in one reserved slot and replaced on every update:
//!
//! - `latest_op`: highest op id handed out
//! - `rebuild_next..=rebuild_max`: the open rebuild window, if any
//! - `rebuild_max_data_id`: last primary id the window covers
//! - `generation_pointer`: last primary id whose payload was generated
//! - `last_hard_commit`: the index's own durable watermark
//!
//! Op ids are reserved before their entry is written. A reserved id whose
//! entry is not yet written holds back [`IndexOperationLog::horizon`], so
//! readers never skip past an op that is still being written.

use crate::error::{CoreError, CoreResult};
use crate::store::TypedMap;
use crate::types::{DataId, OpId, StoredId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

const WATERMARK_SLOT: u64 = 0;

/// One entry of the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOp {
    /// `data_id` now has the payload stored under `stored_id`.
    Store {
        /// Primary record.
        data_id: DataId,
        /// Derived payload.
        stored_id: StoredId,
    },
    /// `data_id` was deleted.
    Deletion {
        /// Primary record.
        data_id: DataId,
    },
}

impl IndexOp {
    /// The primary record this entry is about.
    pub fn data_id(&self) -> DataId {
        match self {
            Self::Store { data_id, .. } | Self::Deletion { data_id } => *data_id,
        }
    }
}

/// Persistent watermarks of one log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Highest op id handed out.
    pub latest_op: OpId,
    /// Next op id the rebuild window will use.
    pub rebuild_next: OpId,
    /// Last op id of the rebuild window; zero when no window is open.
    pub rebuild_max: OpId,
    /// Largest primary id covered by the rebuild window.
    pub rebuild_max_data_id: DataId,
    /// Last primary id whose payload was generated during a rebuild.
    pub generation_pointer: DataId,
    /// The index's durable watermark.
    pub last_hard_commit: OpId,
}

/// An open rebuild window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildWindow {
    /// Next op id to hand out.
    pub next: OpId,
    /// Last op id of the window.
    pub max: OpId,
    /// Largest primary id covered.
    pub max_data_id: DataId,
}

/// An op id handed out but not yet written.
#[derive(Debug)]
#[must_use = "a reservation holds back the log horizon until persisted"]
pub struct Reservation {
    op: OpId,
    epoch: u64,
}

impl Reservation {
    /// The reserved op id.
    pub fn op(&self) -> OpId {
        self.op
    }
}

#[derive(Debug)]
struct LogState {
    marks: Watermarks,
    in_flight: BTreeSet<u64>,
    epoch: u64,
}

/// The per-index operation log.
pub struct IndexOperationLog {
    ops: TypedMap<IndexOp>,
    meta: TypedMap<Watermarks>,
    state: Mutex<LogState>,
}

impl IndexOperationLog {
    /// Opens a log over its entry map and watermark map.
    pub fn open(ops: TypedMap<IndexOp>, meta: TypedMap<Watermarks>) -> CoreResult<Self> {
        let mut marks = meta.get(WATERMARK_SLOT)?.unwrap_or_default();
        if let Some(last) = ops.raw().last_key() {
            if last > marks.latest_op.as_u64() {
                warn!(last, latest = %marks.latest_op, "operation log ahead of its watermark");
                marks.latest_op = OpId::new(last);
            }
        }
        debug!(entries = ops.len(), latest = %marks.latest_op, "opened index operation log");

        Ok(Self {
            ops,
            meta,
            state: Mutex::new(LogState {
                marks,
                in_flight: BTreeSet::new(),
                epoch: 0,
            }),
        })
    }

    /// Appends a store entry at `latest_op + 1`.
    pub fn append_store(&self, data_id: DataId, stored_id: StoredId) -> CoreResult<OpId> {
        let reservation = self.reserve()?;
        self.persist(reservation, IndexOp::Store { data_id, stored_id })
    }

    /// Appends a deletion entry at `latest_op + 1`.
    pub fn append_delete(&self, data_id: DataId) -> CoreResult<OpId> {
        let reservation = self.reserve()?;
        self.persist(reservation, IndexOp::Deletion { data_id })
    }

    /// Hands out the next op id without writing its entry yet.
    pub fn reserve(&self) -> CoreResult<Reservation> {
        let mut state = self.state.lock();
        let op = state.marks.latest_op.next();
        state.marks.latest_op = op;
        self.save(&state.marks)?;
        state.in_flight.insert(op.as_u64());
        Ok(Reservation {
            op,
            epoch: state.epoch,
        })
    }

    /// Writes the entry for a reservation.
    ///
    /// If the log was cleared since the reservation was made, the entry is
    /// dropped: a cleared log is rebuilt from primary storage.
    pub fn persist(&self, reservation: Reservation, entry: IndexOp) -> CoreResult<OpId> {
        let mut state = self.state.lock();
        let op = reservation.op;
        if reservation.epoch != state.epoch {
            debug!(op_id = %op, "dropping entry reserved before the log was cleared");
            return Ok(op);
        }
        state.in_flight.remove(&op.as_u64());
        self.ops.put(op.as_u64(), &entry)?;
        Ok(op)
    }

    /// Highest op id below which every reserved entry has been written.
    pub fn horizon(&self) -> OpId {
        let state = self.state.lock();
        match state.in_flight.first() {
            Some(first) => OpId::new(first - 1),
            None => state.marks.latest_op,
        }
    }

    /// Appends an entry inside the open rebuild window.
    pub fn append_rebuild(&self, data_id: DataId, stored_id: StoredId) -> CoreResult<OpId> {
        let mut state = self.state.lock();
        let marks = &mut state.marks;
        if marks.rebuild_max == OpId::ZERO {
            return Err(CoreError::invalid_operation("no rebuild window is open"));
        }

        let op = marks.rebuild_next;
        self.ops.put(op.as_u64(), &IndexOp::Store { data_id, stored_id })?;
        if op >= marks.rebuild_max {
            marks.rebuild_next = OpId::ZERO;
            marks.rebuild_max = OpId::ZERO;
            marks.rebuild_max_data_id = DataId::default();
        } else {
            marks.rebuild_next = op.next();
        }
        self.save(&state.marks)?;
        Ok(op)
    }

    /// Opens a window of `size` op ids for entries regenerated from
    /// primary storage, ending at primary id `largest`.
    ///
    /// A size of zero opens nothing.
    pub fn set_rebuild_max(&self, size: u64, largest: DataId) -> CoreResult<()> {
        if size == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let marks = &mut state.marks;
        if marks.rebuild_max != OpId::ZERO {
            return Err(CoreError::invalid_operation("a rebuild window is already open"));
        }

        marks.rebuild_next = marks.latest_op.next();
        marks.rebuild_max = OpId::new(marks.latest_op.as_u64() + size);
        marks.rebuild_max_data_id = largest;
        marks.latest_op = marks.rebuild_max;
        debug!(from = %marks.rebuild_next, to = %marks.rebuild_max, "opened rebuild window");
        self.save(&state.marks)
    }

    /// The open rebuild window, if any.
    pub fn rebuild_window(&self) -> Option<RebuildWindow> {
        let state = self.state.lock();
        let marks = &state.marks;
        (marks.rebuild_max != OpId::ZERO).then_some(RebuildWindow {
            next: marks.rebuild_next,
            max: marks.rebuild_max,
            max_data_id: marks.rebuild_max_data_id,
        })
    }

    /// Closes the rebuild window even if not every op id was used.
    ///
    /// Unused ids become permanent gaps.
    pub fn close_rebuild_window(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        let marks = &mut state.marks;
        if marks.rebuild_max == OpId::ZERO {
            return Ok(());
        }
        let unused = marks.rebuild_max.as_u64() + 1 - marks.rebuild_next.as_u64();
        warn!(unused, "closing rebuild window early");
        marks.rebuild_next = OpId::ZERO;
        marks.rebuild_max = OpId::ZERO;
        marks.rebuild_max_data_id = DataId::default();
        self.save(&state.marks)
    }

    /// Last primary id whose payload was generated by the current rebuild.
    pub fn generation_pointer(&self) -> DataId {
        self.state.lock().marks.generation_pointer
    }

    /// Records rebuild generation progress.
    pub fn set_generation_pointer(&self, data_id: DataId) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.marks.generation_pointer = data_id;
        self.save(&state.marks)
    }

    /// The index's durable watermark as last recorded here.
    pub fn last_hard_commit(&self) -> OpId {
        self.state.lock().marks.last_hard_commit
    }

    /// Records the index's durable watermark and drops every entry at or
    /// below it. Returns the dropped entries.
    pub fn set_last_hard_commit(&self, op: OpId) -> CoreResult<Vec<(OpId, IndexOp)>> {
        let mut state = self.state.lock();
        if op > state.marks.latest_op {
            return Err(CoreError::invalid_argument(format!(
                "hard commit {op} is beyond the latest op {}",
                state.marks.latest_op
            )));
        }

        let dropped = self.entries_locked(0, op.as_u64())?;
        for (dropped_op, _) in &dropped {
            self.ops.remove(dropped_op.as_u64())?;
        }
        state.marks.last_hard_commit = op;
        self.save(&state.marks)?;
        Ok(dropped)
    }

    /// The latest op id handed out.
    pub fn latest_op(&self) -> OpId {
        self.state.lock().marks.latest_op
    }

    /// A copy of the current watermarks.
    pub fn watermarks(&self) -> Watermarks {
        self.state.lock().marks.clone()
    }

    /// Reads one entry.
    pub fn get(&self, op: OpId) -> CoreResult<Option<IndexOp>> {
        self.ops.get(op.as_u64())
    }

    /// Entries with op ids in `(after, up_to]`, in order.
    pub fn entries(&self, after: OpId, up_to: OpId) -> CoreResult<Vec<(OpId, IndexOp)>> {
        let _state = self.state.lock();
        self.entries_locked(after.as_u64(), up_to.as_u64())
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Stored ids referenced by retained store entries.
    pub fn referenced_payloads(&self) -> CoreResult<BTreeSet<StoredId>> {
        let entries = self.entries(OpId::ZERO, OpId::new(u64::MAX))?;
        Ok(entries
            .into_iter()
            .filter_map(|(_, entry)| match entry {
                IndexOp::Store { stored_id, .. } => Some(stored_id),
                IndexOp::Deletion { .. } => None,
            })
            .collect())
    }

    /// Drops every entry and watermark except the generation pointer, and
    /// restarts op ids at 1. Outstanding reservations are voided.
    pub fn clear(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.ops.clear()?;
        state.epoch += 1;
        state.in_flight.clear();
        state.marks = Watermarks {
            generation_pointer: state.marks.generation_pointer,
            ..Watermarks::default()
        };
        debug!(generation_pointer = %state.marks.generation_pointer, "cleared index operation log");
        self.save(&state.marks)
    }

    fn entries_locked(&self, after: u64, up_to: u64) -> CoreResult<Vec<(OpId, IndexOp)>> {
        Ok(self
            .ops
            .entries_between(after, up_to)?
            .into_iter()
            .map(|(op, entry)| (OpId::new(op), entry))
            .collect())
    }

    fn save(&self, marks: &Watermarks) -> CoreResult<()> {
        self.meta.put(WATERMARK_SLOT, marks)
    }
}

impl std::fmt::Debug for IndexOperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOperationLog")
            .field("watermarks", &self.watermarks())
            .field("entries", &self.len())
            .finish()
    }
}
