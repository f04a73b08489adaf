//! The pluggable index interface.

use crate::error::CoreResult;
use crate::types::{DataId, OpId};
use std::io::{Read, Write};

/// A derived, independently rebuildable view over one entity's records.
///
/// The controller only sequences calls; it never looks inside payloads.
/// `generate` turns raw primary bytes into the index's own payload, which
/// is stored once and then handed to `apply` (possibly again after a
/// crash). Implementations use interior mutability: queries may run
/// concurrently with `apply`.
///
/// # Contract
///
/// - `apply` and `delete` are called with strictly increasing op ids.
/// - Re-applying an op id at or below the last one seen must be harmless.
/// - `last_hard_commit` is the highest op id whose effect has been made
///   durable by the index itself; everything above it may be replayed.
/// - `clear` drops all state and resets the hard commit to zero.
pub trait Index: Send + Sync {
    /// Index name, unique within its entity.
    fn name(&self) -> &str;

    /// Produces the derived payload for a record's raw bytes.
    fn generate(&self, data: &mut dyn Read, out: &mut dyn Write) -> CoreResult<()>;

    /// Applies a stored payload for `data_id` as operation `op`.
    fn apply(&self, op: OpId, data_id: DataId, payload: &mut dyn Read) -> CoreResult<()>;

    /// Removes `data_id` as operation `op`.
    fn delete(&self, op: OpId, data_id: DataId) -> CoreResult<()>;

    /// Drops all state.
    fn clear(&self) -> CoreResult<()>;

    /// Highest op id the index has durably persisted.
    fn last_hard_commit(&self) -> CoreResult<OpId>;
}

impl<I: Index + ?Sized> Index for std::sync::Arc<I> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate(&self, data: &mut dyn Read, out: &mut dyn Write) -> CoreResult<()> {
        (**self).generate(data, out)
    }

    fn apply(&self, op: OpId, data_id: DataId, payload: &mut dyn Read) -> CoreResult<()> {
        (**self).apply(op, data_id, payload)
    }

    fn delete(&self, op: OpId, data_id: DataId) -> CoreResult<()> {
        (**self).delete(op, data_id)
    }

    fn clear(&self) -> CoreResult<()> {
        (**self).clear()
    }

    fn last_hard_commit(&self) -> CoreResult<OpId> {
        (**self).last_hard_commit()
    }
}

/// Runs `generate` over an in-memory value.
pub fn generate_bytes(index: &dyn Index, data: &[u8]) -> CoreResult<Vec<u8>> {
    let mut input = data;
    let mut out = Vec::new();
    index.generate(&mut input, &mut out)?;
    Ok(out)
}
