//! Periodic background work on a dedicated thread.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs a task every `interval` until stopped or dropped.
///
/// Stopping wakes the thread immediately instead of waiting out the
/// current interval.
pub struct Periodic {
    name: &'static str,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    /// Spawns a thread that calls `task` every `interval`. A zero interval
    /// never calls it.
    ///
    /// Task errors are logged and do not stop the loop.
    pub fn spawn<F, E>(name: &'static str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: std::fmt::Display,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(format!("tessera-{name}"))
            .spawn(move || loop {
                if interval.is_zero() {
                    // disabled; only wait to be stopped
                    let _ = stopped.recv();
                    debug!(task = name, "background task stopped");
                    return;
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = task() {
                            warn!(task = name, error = %e, "background task failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(task = name, "background task stopped");
                        return;
                    }
                }
            })?;

        Ok(Self {
            name,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Task name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(task = self.name, "background task panicked");
            }
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Periodic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Periodic")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}
