//! Crash simulation for storage backends.
//!
//! A [`CrashableBackend`] wraps a real backend and, once armed, fails
//! writes past a byte budget. The write that crosses the budget is torn:
//! its leading bytes reach the inner backend and the rest are lost, which
//! is what a power cut mid-`write` looks like on disk.
//!
//! Backends are owned (boxed) by the logs that write them, so crashes are
//! armed through a shared [`CrashSwitch`]. [`CrashingProvider`] hands out
//! crashable backends by name.
//!
//! [`PowerLossProvider`] models the other half of a power cut: anything
//! written or truncated since a backend's last `sync` is lost.
//!
//! ```rust,ignore
//! let provider = CrashingProvider::new(MemoryProvider::new());
//! let wal = provider.switch("wal");
//! // ... open a database over `provider`, write some data ...
//! wal.crash_after(40);
//! // ... the next write tears; reopen over `provider.inner()` ...
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{BackendProvider, CoreResult, MemoryProvider};
use tessera_storage::{StorageBackend, StorageError, StorageResult};

#[derive(Debug)]
struct CrashState {
    budget: AtomicU64,
    written: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

/// Shared control over one or more [`CrashableBackend`]s.
#[derive(Debug, Clone)]
pub struct CrashSwitch {
    state: Arc<CrashState>,
}

impl Default for CrashSwitch {
    fn default() -> Self {
        Self {
            state: Arc::new(CrashState {
                budget: AtomicU64::new(u64::MAX),
                written: AtomicU64::new(0),
                crashed: AtomicBool::new(false),
                fail_on_flush: AtomicBool::new(false),
            }),
        }
    }
}

impl CrashSwitch {
    /// Creates a disarmed switch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `bytes` more bytes through, then tears the write that crosses
    /// the budget and fails every write after it.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.state.written.load(Ordering::SeqCst);
        self.state
            .budget
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Fails every flush and sync from now on.
    pub fn fail_flushes(&self) {
        self.state.fail_on_flush.store(true, Ordering::SeqCst);
    }

    /// Disarms the switch; the crashed flag is cleared too.
    pub fn reset(&self) {
        self.state.budget.store(u64::MAX, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns true once a simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Bytes written through the switch so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.written.load(Ordering::SeqCst)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
    }
}

/// A backend that fails on command.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: CrashSwitch,
}

impl CrashableBackend {
    /// Wraps `inner` under `switch`.
    pub fn new(inner: Box<dyn StorageBackend>, switch: CrashSwitch) -> Self {
        Self { inner, switch }
    }

    /// The switch controlling this backend.
    pub fn switch(&self) -> &CrashSwitch {
        &self.switch
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = &self.switch.state;
        if state.crashed.load(Ordering::SeqCst) {
            return Err(self.switch.crash("write"));
        }

        let len = data.len() as u64;
        let written = state.written.fetch_add(len, Ordering::SeqCst);
        let budget = state.budget.load(Ordering::SeqCst);
        if written.saturating_add(len) > budget {
            let kept = budget.saturating_sub(written) as usize;
            if kept > 0 {
                let _ = self.inner.append(&data[..kept]);
                let _ = self.inner.flush();
            }
            return Err(self.switch.crash("partial write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.crash("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.crash("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// A [`MemoryProvider`] whose chosen backends can crash.
#[derive(Debug, Clone)]
pub struct CrashingProvider {
    inner: MemoryProvider,
    switches: Arc<Mutex<HashMap<String, CrashSwitch>>>,
}

impl CrashingProvider {
    /// Wraps `inner`; no backend crashes until a switch is armed.
    pub fn new(inner: MemoryProvider) -> Self {
        Self {
            inner,
            switches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The switch for backend `name`, created on first use.
    ///
    /// Only backends opened after this call are wrapped.
    pub fn switch(&self, name: &str) -> CrashSwitch {
        self.switches
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The underlying provider, for reopening after a crash.
    pub fn inner(&self) -> &MemoryProvider {
        &self.inner
    }
}

impl BackendProvider for CrashingProvider {
    fn open(&self, name: &str) -> CoreResult<Box<dyn StorageBackend>> {
        let backend = self.inner.open(name)?;
        match self.switches.lock().get(name) {
            Some(switch) => Ok(Box::new(CrashableBackend::new(backend, switch.clone()))),
            None => Ok(backend),
        }
    }
}

/// A [`MemoryProvider`] that keeps each backend's contents as of its last
/// `sync`.
#[derive(Debug, Clone, Default)]
pub struct PowerLossProvider {
    inner: MemoryProvider,
    synced: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl PowerLossProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live provider, unsynced writes included.
    pub fn inner(&self) -> &MemoryProvider {
        &self.inner
    }

    /// What a power cut right now would leave behind: every backend as of
    /// its last sync. Backends that were never synced are empty.
    pub fn surviving(&self) -> CoreResult<MemoryProvider> {
        let survivor = MemoryProvider::new();
        for (name, bytes) in self.synced.lock().iter() {
            survivor.open(name)?.append(bytes)?;
        }
        Ok(survivor)
    }
}

impl BackendProvider for PowerLossProvider {
    fn open(&self, name: &str) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(VolatileBackend {
            name: name.to_string(),
            inner: self.inner.open(name)?,
            synced: Arc::clone(&self.synced),
        }))
    }
}

/// Records its contents into the owning [`PowerLossProvider`] on sync.
struct VolatileBackend {
    name: String,
    inner: Box<dyn StorageBackend>,
    synced: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl StorageBackend for VolatileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()?;
        let contents = self.inner.read_all()?;
        self.synced.lock().insert(self.name.clone(), contents);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    #[test]
    fn crossing_write_is_torn() {
        let memory = InMemoryBackend::new();
        let switch = CrashSwitch::new();
        let mut backend = CrashableBackend::new(Box::new(memory.share()), switch.clone());

        backend.append(b"hello").unwrap();
        switch.crash_after(3);
        assert!(backend.append(b"world").is_err());

        assert!(switch.has_crashed());
        assert_eq!(memory.data(), b"hellowor");
        assert!(backend.append(b"!").is_err());
    }

    #[test]
    fn reset_disarms() {
        let switch = CrashSwitch::new();
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()), switch.clone());

        switch.crash_after(0);
        assert!(backend.append(b"x").is_err());
        switch.reset();
        assert!(backend.append(b"y").is_ok());
        assert!(!switch.has_crashed());
    }

    #[test]
    fn failing_flush() {
        let switch = CrashSwitch::new();
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()), switch.clone());
        switch.fail_flushes();
        assert!(backend.flush().is_err());
        assert!(backend.sync().is_err());
    }

    #[test]
    fn provider_wraps_only_armed_names() {
        let provider = CrashingProvider::new(MemoryProvider::new());
        let switch = provider.switch("wal");
        switch.crash_after(0);

        let mut wal = provider.open("wal").unwrap();
        let mut other = provider.open("primary.user").unwrap();
        assert!(wal.append(b"x").is_err());
        assert!(other.append(b"x").is_ok());
    }

    #[test]
    fn power_loss_keeps_only_synced_bytes() {
        let provider = PowerLossProvider::new();
        let mut synced = provider.open("synced").unwrap();
        let mut unsynced = provider.open("unsynced").unwrap();

        synced.append(b"durable").unwrap();
        synced.sync().unwrap();
        synced.append(b" lost").unwrap();
        unsynced.append(b"lost").unwrap();

        let survivor = provider.surviving().unwrap();
        assert_eq!(survivor.backend("synced").unwrap().data(), b"durable");
        assert!(survivor.backend("unsynced").is_none());
        assert_eq!(provider.inner().backend("synced").unwrap().data(), b"durable lost");
    }

    #[test]
    fn unsynced_truncate_is_undone_by_power_loss() {
        let provider = PowerLossProvider::new();
        let mut backend = provider.open("wal").unwrap();
        backend.append(b"records").unwrap();
        backend.sync().unwrap();
        backend.truncate(0).unwrap();

        let survivor = provider.surviving().unwrap();
        assert_eq!(survivor.backend("wal").unwrap().data(), b"records");
    }
}
