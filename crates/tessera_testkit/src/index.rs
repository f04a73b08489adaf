//! [`Index`] wrappers for observing and disturbing the index SPI.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{CoreError, CoreResult, DataId, Index, OpId};

/// Counts `generate`, `apply`, `delete` and `clear` calls, then forwards
/// them to the wrapped index.
#[derive(Debug)]
pub struct CountingIndex<I> {
    inner: Arc<I>,
    generated: AtomicUsize,
    applied: AtomicUsize,
    deleted: AtomicUsize,
    cleared: AtomicUsize,
}

impl<I: Index> CountingIndex<I> {
    /// Wraps `inner`.
    pub fn new(inner: Arc<I>) -> Self {
        Self {
            inner,
            generated: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            cleared: AtomicUsize::new(0),
        }
    }

    /// The wrapped index.
    pub fn inner(&self) -> &Arc<I> {
        &self.inner
    }

    /// `generate` calls so far.
    pub fn generate_calls(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    /// `apply` calls so far.
    pub fn apply_calls(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// `delete` calls so far.
    pub fn delete_calls(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    /// `clear` calls so far.
    pub fn clear_calls(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }

    /// Zeroes every counter.
    pub fn reset_counts(&self) {
        for counter in [&self.generated, &self.applied, &self.deleted, &self.cleared] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

impl<I: Index> Index for CountingIndex<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, data: &mut dyn Read, out: &mut dyn Write) -> CoreResult<()> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(data, out)
    }

    fn apply(&self, op: OpId, data_id: DataId, payload: &mut dyn Read) -> CoreResult<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(op, data_id, payload)
    }

    fn delete(&self, op: OpId, data_id: DataId) -> CoreResult<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(op, data_id)
    }

    fn clear(&self) -> CoreResult<()> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        self.inner.clear()
    }

    fn last_hard_commit(&self) -> CoreResult<OpId> {
        self.inner.last_hard_commit()
    }
}

/// Forwards to the wrapped index until told to refuse `apply` calls.
#[derive(Debug)]
pub struct FlakyIndex<I> {
    inner: Arc<I>,
    refusing: AtomicBool,
}

impl<I: Index> FlakyIndex<I> {
    /// Wraps `inner`; applies succeed until [`refuse_applies`](Self::refuse_applies).
    pub fn new(inner: Arc<I>) -> Self {
        Self {
            inner,
            refusing: AtomicBool::new(false),
        }
    }

    /// The wrapped index.
    pub fn inner(&self) -> &Arc<I> {
        &self.inner
    }

    /// Makes every later `apply` fail.
    pub fn refuse_applies(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }
}

impl<I: Index> Index for FlakyIndex<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, data: &mut dyn Read, out: &mut dyn Write) -> CoreResult<()> {
        self.inner.generate(data, out)
    }

    fn apply(&self, op: OpId, data_id: DataId, payload: &mut dyn Read) -> CoreResult<()> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(CoreError::index_failed(
                self.inner.name(),
                format!("refused apply of {op}"),
            ));
        }
        self.inner.apply(op, data_id, payload)
    }

    fn delete(&self, op: OpId, data_id: DataId) -> CoreResult<()> {
        self.inner.delete(op, data_id)
    }

    fn clear(&self) -> CoreResult<()> {
        self.inner.clear()
    }

    fn last_hard_commit(&self) -> CoreResult<OpId> {
        self.inner.last_hard_commit()
    }
}
