//! Secondary indexes kept in step with primary storage.
//!
//! Each index sits behind an [`IndexController`] that owns:
//!
//! - an [`IndexOperationLog`] of stores and deletions, in op-id order
//! - a `data_id -> stored_id` map naming each record's current payload
//! - a payload store holding derived payloads, generated once
//!
//! The index itself only implements [`Index`]: generate a payload, apply
//! it, delete, clear and report how far it has durably persisted. The
//! controller handles ordering, recovery and rebuilds.

mod controller;
mod events;
mod memory;
mod oplog;
mod traits;

pub use controller::{primary_map_name, IndexController};
pub use events::{IndexEvent, IndexEvents, IndexState, IndexStatus};
pub use memory::MemoryIndex;
pub use oplog::{IndexOp, IndexOperationLog, RebuildWindow, Reservation, Watermarks};
pub use traits::{generate_bytes, Index};
