//! Write-ahead transaction log storage.
//!
//! Every transaction entry is framed and appended here before it has any
//! effect. Replaying the log from the start rebuilds all in-flight state.
//!
//! ## Record Format
//!
//! ```text
//! | magic "TWAL" (4) | version (2) | tag (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload starts with the varint transaction id and varint sequence
//! number, followed by tag-specific fields. Strings and byte strings are
//! varint-length-prefixed.
//!
//! ## Recovery Policy
//!
//! - An incomplete tail record (crash mid-append) ends the log cleanly.
//! - CRC mismatch, bad magic, an unknown tag or a newer version is fatal;
//!   the log must not be opened.

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{EntryKey, WalOp, WalRecord, WalTag, WAL_MAGIC, WAL_VERSION};
pub use writer::WalManager;
