//! # Tessera Core
//!
//! Crash-safe write path for an embedded store with derived indexes.
//!
//! This crate provides:
//! - a chunk-framed transaction log (WAL) with a sequential applier
//! - transaction exchanges with nesting and bounded retry
//! - a durable ordered map store for primary data and index bookkeeping
//! - per-index operation logs and controllers that replay or rebuild
//!   each index independently after a crash
//! - the [`Database`] facade wiring these together
//!
//! Indexes plug in through the [`Index`] trait. Everything durable lives
//! on [`tessera_storage::StorageBackend`]s handed out by a
//! [`BackendProvider`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod background;
mod config;
mod database;
mod error;
pub mod index;
pub mod store;
pub mod transaction;
mod types;
pub mod wal;

pub use background::Periodic;
pub use config::{Config, RetryConfig};
pub use database::{Database, DatabaseBuilder};
pub use error::{CoreError, CoreResult};
pub use index::{
    Index, IndexController, IndexEvent, IndexEvents, IndexOp, IndexOperationLog, IndexState,
    MemoryIndex,
};
pub use store::{BackendProvider, DirectoryProvider, MapStore, MemoryProvider, OrderedMap};
pub use transaction::{
    ExchangeState, StorageApplier, Transaction, TransactionLog, TransactionLogApplier,
    TransactionSupport,
};
pub use types::{DataId, OpId, StoredId, TransactionId};
