//! Index lifecycle events and waitable status.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

/// Something that happened to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// Rebuild progress. Throttled.
    Progress {
        /// Index name.
        index: String,
        /// Rebuild entries done.
        done: u64,
        /// Rebuild entries in total.
        total: u64,
    },
    /// The index answers queries, though it may still be catching up.
    Queryable {
        /// Index name.
        index: String,
    },
    /// The index has applied every logged operation.
    UpToDate {
        /// Index name.
        index: String,
    },
    /// Startup failed; the index will not serve until restarted.
    Failed {
        /// Index name.
        index: String,
        /// What went wrong.
        message: String,
    },
}

/// Fans index events out to subscribers.
///
/// Subscribers whose receiver was dropped are removed on the next emit.
#[derive(Debug, Default)]
pub struct IndexEvents {
    subscribers: RwLock<Vec<Sender<IndexEvent>>>,
}

impl IndexEvents {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives all events emitted from now on.
    pub fn subscribe(&self) -> Receiver<IndexEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends an event to every live subscriber.
    pub fn emit(&self, event: IndexEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Where an index is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    /// Registered, startup not run yet.
    Created,
    /// Reconciling against its log and primary storage.
    Starting,
    /// Serving queries, replaying the tail of its log.
    Queryable,
    /// Serving queries with every logged op applied at the last check.
    UpToDate,
    /// Startup failed.
    Failed(String),
    /// Startup was cancelled; progress so far is kept.
    Cancelled,
}

/// Waitable state of one index.
#[derive(Debug)]
pub struct IndexStatus {
    state: Mutex<IndexState>,
    changed: Condvar,
}

impl Default for IndexStatus {
    fn default() -> Self {
        Self {
            state: Mutex::new(IndexState::Created),
            changed: Condvar::new(),
        }
    }
}

impl IndexStatus {
    /// Creates a status in [`IndexState::Created`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn get(&self) -> IndexState {
        self.state.lock().clone()
    }

    /// Replaces the state and wakes waiters.
    pub fn set(&self, state: IndexState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    /// Blocks until the index is up to date, it fails, or `timeout` passes.
    ///
    /// A failed index reports its failure as [`CoreError::IndexFailed`].
    pub fn wait_up_to_date(&self, index: &str, timeout: Duration) -> CoreResult<()> {
        self.wait_for(index, timeout, |state| matches!(state, IndexState::UpToDate))
    }

    /// Blocks until the index is queryable (or up to date).
    pub fn wait_queryable(&self, index: &str, timeout: Duration) -> CoreResult<()> {
        self.wait_for(index, timeout, |state| {
            matches!(state, IndexState::Queryable | IndexState::UpToDate)
        })
    }

    fn wait_for(
        &self,
        index: &str,
        timeout: Duration,
        done: impl Fn(&IndexState) -> bool,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if done(&state) {
                return Ok(());
            }
            match &*state {
                IndexState::Failed(message) => {
                    return Err(CoreError::index_failed(index, message.clone()))
                }
                IndexState::Cancelled => return Err(CoreError::Cancelled),
                _ => {}
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(CoreError::index_failed(
                    index,
                    format!("not ready after {timeout:?}"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn emit_reaches_every_subscriber() {
        let events = IndexEvents::new();
        let a = events.subscribe();
        let b = events.subscribe();

        let event = IndexEvent::Queryable {
            index: "by_name".into(),
        };
        events.emit(event.clone());

        assert_eq!(a.recv_timeout(Duration::from_millis(100)).unwrap(), event);
        assert_eq!(b.recv_timeout(Duration::from_millis(100)).unwrap(), event);
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let events = IndexEvents::new();
        drop(events.subscribe());
        events.emit(IndexEvent::UpToDate { index: "i".into() });
        assert_eq!(events.subscriber_count(), 0);
    }

    #[test]
    fn waiter_is_woken_by_another_thread() {
        let status = Arc::new(IndexStatus::new());
        let setter = Arc::clone(&status);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set(IndexState::UpToDate);
        });

        status.wait_up_to_date("i", Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn failure_is_reported_to_waiters() {
        let status = IndexStatus::new();
        status.set(IndexState::Failed("payload missing".into()));

        let err = status.wait_queryable("i", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.to_string(), "index i failed: payload missing");
    }

    #[test]
    fn waiting_times_out() {
        let status = IndexStatus::new();
        status.set(IndexState::Queryable);
        assert!(status.wait_queryable("i", Duration::ZERO).is_ok());
        assert!(status.wait_up_to_date("i", Duration::from_millis(10)).is_err());
    }
}
