//! # Tessera Testkit
//!
//! Test utilities for Tessera.
//!
//! This crate provides:
//! - [`CrashableBackend`] and [`CrashingProvider`] for torn writes, and
//!   [`PowerLossProvider`] for losing unsynced writes
//! - [`RecordingApplier`], a `StorageApplier` that records its calls
//! - [`CountingIndex`], counting calls into the index SPI, and
//!   [`FlakyIndex`], failing applies on demand
//! - proptest strategies for index action sequences
//! - [`IndexHarness`] for controller restart scenarios
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! let harness = IndexHarness::new("user");
//! let session = harness.open(Arc::new(MemoryIndex::new("raw")))?;
//! session.controller().start()?;
//! session.store(1, b"v1")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod applier;
pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod index;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::applier::*;
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::index::*;
}

pub use applier::{Applied, RecordingApplier};
pub use crash::{CrashSwitch, CrashableBackend, CrashingProvider, PowerLossProvider};
pub use fixtures::{init_tracing, IndexHarness, IndexSession, TempProvider};
pub use generators::*;
pub use index::{CountingIndex, FlakyIndex};
