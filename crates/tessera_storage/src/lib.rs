//! # Tessera Storage
//!
//! Byte-store backends for Tessera.
//!
//! Every durable structure in Tessera (the transaction log, the per-index
//! operation logs and the ordered maps) is an append-only record stream
//! written to one of these backends. Backends are **opaque byte stores**:
//! they never interpret the records they hold.
//!
//! - [`InMemoryBackend`] keeps bytes in memory; handles can be shared so a
//!   test can reopen the same bytes after dropping a database
//! - [`FileBackend`] keeps one `<name>.log` file per backend

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
