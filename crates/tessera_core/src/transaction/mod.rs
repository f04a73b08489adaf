//! Transactions: the log, its applier, and the exchange callers hold.
//!
//! ## Write path
//!
//! ```text
//! Transaction ─► TransactionLog ─► WAL append ─► TransactionLogApplier ─► StorageApplier
//! ```
//!
//! Writes become WAL entries immediately but have no effect until Commit.
//! The applier runs a committed transaction's effects in logged order, in
//! one pass, so concurrent transactions never interleave their effects.

mod applier;
mod exchange;
mod log;
mod support;

pub use applier::{StorageApplier, TransactionLogApplier};
pub use exchange::{ExchangeState, Transaction};
pub use log::TransactionLog;
pub use support::TransactionSupport;
