//! The transactional boundary callers see.
//!
//! An exchange accumulates one logical transaction. It allocates its log
//! transaction id lazily on the first write, and may be shared by several
//! [`Transaction`] handles (nesting); only the last handle to release it
//! commits or rolls back.

use crate::error::{CoreError, CoreResult};
use crate::transaction::log::TransactionLog;
use crate::types::{DataId, TransactionId};
use parking_lot::Mutex;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No write yet; no transaction id allocated.
    Unstarted,
    /// At least one write; holds a transaction id.
    Active,
    /// Committed. Terminal.
    Committed,
    /// Rolled back. Terminal.
    RolledBack,
    /// The final commit or rollback could not be logged or applied. Terminal.
    Failed,
}

impl ExchangeState {
    /// Returns true for committed or rolled back.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct ExchangeInner {
    state: ExchangeState,
    txid: Option<TransactionId>,
    handles: usize,
    rollback_only: bool,
}

struct Exchange {
    log: Arc<TransactionLog>,
    inner: Mutex<ExchangeInner>,
}

impl Exchange {
    /// Returns the transaction id, starting the log transaction on first use.
    fn txid_for_write(&self) -> CoreResult<TransactionId> {
        let mut inner = self.inner.lock();
        match inner.state {
            ExchangeState::Active => inner
                .txid
                .ok_or_else(|| CoreError::invalid_operation("active exchange without an id")),
            ExchangeState::Unstarted => {
                let txid = self.log.start_transaction()?;
                inner.txid = Some(txid);
                inner.state = ExchangeState::Active;
                Ok(txid)
            }
            state => Err(CoreError::finished(state.to_string())),
        }
    }

    /// Drops one handle's claim; the last claim finalizes the exchange.
    fn release(&self, commit: bool) -> CoreResult<()> {
        let (txid, rollback) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(CoreError::finished(inner.state.to_string()));
            }
            if !commit {
                inner.rollback_only = true;
            }
            inner.handles = inner.handles.saturating_sub(1);
            if inner.handles > 0 {
                return Ok(());
            }

            (inner.txid.take(), inner.rollback_only)
        };

        // the state turns terminal only once the log has the outcome
        let outcome = match txid {
            Some(txid) if rollback => self.log.rollback(txid),
            Some(txid) => self.log.commit(txid),
            None => Ok(()),
        };
        self.inner.lock().state = match (&outcome, rollback) {
            (Err(_), _) => ExchangeState::Failed,
            (Ok(()), true) => ExchangeState::RolledBack,
            (Ok(()), false) => ExchangeState::Committed,
        };
        if let Some(txid) = txid {
            debug!(txid = %txid, rollback, ok = outcome.is_ok(), "exchange finished");
        }
        outcome?;

        if commit && rollback {
            return Err(CoreError::invalid_operation(
                "transaction was marked rollback-only and has been rolled back",
            ));
        }
        Ok(())
    }
}

/// A handle onto an exchange.
///
/// Dropping a handle that was neither committed nor rolled back rolls
/// back its share of the exchange.
pub struct Transaction {
    exchange: Arc<Exchange>,
    released: bool,
}

impl Transaction {
    pub(crate) fn begin(log: Arc<TransactionLog>) -> Self {
        Self {
            exchange: Arc::new(Exchange {
                log,
                inner: Mutex::new(ExchangeInner {
                    state: ExchangeState::Unstarted,
                    txid: None,
                    handles: 1,
                    rollback_only: false,
                }),
            }),
            released: false,
        }
    }

    /// Returns another handle onto the same exchange.
    pub fn join(&self) -> CoreResult<Transaction> {
        self.ensure_held()?;
        let mut inner = self.exchange.inner.lock();
        if inner.state.is_terminal() {
            return Err(CoreError::finished(inner.state.to_string()));
        }
        inner.handles += 1;
        Ok(Self {
            exchange: Arc::clone(&self.exchange),
            released: false,
        })
    }

    /// State of the shared exchange.
    pub fn state(&self) -> ExchangeState {
        self.exchange.inner.lock().state
    }

    /// Log transaction id, present only while the exchange is active.
    pub fn id(&self) -> Option<TransactionId> {
        self.exchange.inner.lock().txid
    }

    /// Returns true if some handle has rolled back.
    pub fn is_rollback_only(&self) -> bool {
        self.exchange.inner.lock().rollback_only
    }

    /// Streams a primary-storage value into the exchange.
    pub fn store(&self, entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
        let txid = self.txid_for_write()?;
        self.exchange.log.store(txid, entity, id, data)
    }

    /// Stores a primary-storage value from a byte slice.
    pub fn store_bytes(&self, entity: &str, id: DataId, bytes: &[u8]) -> CoreResult<()> {
        let mut reader = bytes;
        self.store(entity, id, &mut reader)
    }

    /// Streams a derived payload for one index into the exchange.
    pub fn store_index(
        &self,
        entity: &str,
        index: &str,
        id: DataId,
        data: &mut dyn Read,
    ) -> CoreResult<()> {
        let txid = self.txid_for_write()?;
        self.exchange.log.store_index(txid, entity, index, id, data)
    }

    /// Deletes a primary-storage value.
    pub fn delete(&self, entity: &str, id: DataId) -> CoreResult<()> {
        let txid = self.txid_for_write()?;
        self.exchange.log.delete(txid, entity, id)
    }

    /// Releases this handle with intent to commit.
    ///
    /// The exchange commits when the last handle releases, unless another
    /// handle rolled back; then it rolls back and this returns an error.
    pub fn commit(&mut self) -> CoreResult<()> {
        self.ensure_held()?;
        self.released = true;
        self.exchange.release(true)
    }

    /// Releases this handle and marks the exchange rollback-only.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_held()?;
        self.released = true;
        self.exchange.release(false)
    }

    fn txid_for_write(&self) -> CoreResult<TransactionId> {
        self.ensure_held()?;
        self.exchange.txid_for_write()
    }

    fn ensure_held(&self) -> CoreResult<()> {
        if self.released {
            let state = self.state();
            let state = if state.is_terminal() {
                state.to_string()
            } else {
                "handle released".to_string()
            };
            return Err(CoreError::finished(state));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.exchange.release(false) {
                warn!(error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.exchange.inner.lock();
        f.debug_struct("Transaction")
            .field("state", &inner.state)
            .field("txid", &inner.txid)
            .field("handles", &inner.handles)
            .field("released", &self.released)
            .finish()
    }
}
