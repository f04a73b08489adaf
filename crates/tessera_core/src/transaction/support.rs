//! Run-in-transaction helpers.

use crate::config::RetryConfig;
use crate::error::CoreResult;
use crate::transaction::exchange::Transaction;
use crate::transaction::log::TransactionLog;
use std::sync::Arc;
use tracing::{debug, warn};

/// Begins transactions and runs units of work inside them.
#[derive(Debug, Clone)]
pub struct TransactionSupport {
    log: Arc<TransactionLog>,
    retry: RetryConfig,
}

impl TransactionSupport {
    /// Creates helpers over `log`.
    pub fn new(log: Arc<TransactionLog>, retry: RetryConfig) -> Self {
        Self { log, retry }
    }

    /// The underlying transaction log.
    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Begins a new, unstarted transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::begin(Arc::clone(&self.log))
    }

    /// Runs `work` in a new transaction: commit on `Ok`, roll back on `Err`.
    pub fn run_in_transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        finish(self.begin(), work)
    }

    /// Runs `work` as a nested participant of `outer`'s exchange.
    ///
    /// Nothing is committed until `outer`'s last handle commits; an error
    /// marks the whole exchange rollback-only.
    pub fn run_nested<T, F>(&self, outer: &Transaction, work: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        finish(outer.join()?, work)
    }

    /// Runs `work` in a fresh transaction, retrying the whole unit on a
    /// retryable conflict up to the configured number of attempts.
    ///
    /// Each failed attempt is rolled back before the next. The last
    /// conflict is returned once attempts run out.
    pub fn run_with_retry<T, F>(&self, mut work: F) -> CoreResult<T>
    where
        F: FnMut(&Transaction) -> CoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            match self.run_in_transaction(&mut work) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    debug!(attempt, error = %e, "retrying transaction");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn finish<T, F>(mut tx: Transaction, work: F) -> CoreResult<T>
where
    F: FnOnce(&Transaction) -> CoreResult<T>,
{
    match work(&tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, "rollback after failed unit of work failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::CoreError;
    use crate::transaction::applier::StorageApplier;
    use crate::transaction::ExchangeState;
    use crate::types::{DataId, TransactionId};
    use parking_lot::Mutex;
    use std::io::Read;
    use std::time::Duration;
    use tessera_storage::InMemoryBackend;

    #[derive(Default)]
    struct Stored(Mutex<Vec<DataId>>);

    impl StorageApplier for Stored {
        fn transaction_start(&self, _txid: TransactionId) -> CoreResult<()> {
            Ok(())
        }

        fn store(&self, _entity: &str, id: DataId, data: &mut dyn Read) -> CoreResult<()> {
            std::io::copy(data, &mut std::io::sink())?;
            self.0.lock().push(id);
            Ok(())
        }

        fn delete(&self, _entity: &str, _id: DataId) -> CoreResult<()> {
            Ok(())
        }

        fn index(&self, _: &str, _: &str, _: DataId, _: &mut dyn Read) -> CoreResult<()> {
            Ok(())
        }

        fn transaction_complete(&self, _txid: TransactionId, _error: Option<&CoreError>) {}
    }

    fn support(attempts: u32) -> (TransactionSupport, Arc<Stored>) {
        let stored = Arc::new(Stored::default());
        let log = TransactionLog::open(
            Box::new(InMemoryBackend::new()),
            Arc::clone(&stored) as Arc<dyn StorageApplier>,
            &Config::default(),
        )
        .unwrap();
        let retry = RetryConfig::new(attempts).with_initial_delay(Duration::from_millis(1));
        (TransactionSupport::new(Arc::new(log), retry), stored)
    }

    #[test]
    fn run_in_transaction_commits_on_success() {
        let (support, stored) = support(1);
        let value = support
            .run_in_transaction(|tx| {
                tx.store_bytes("e", DataId::new(1), b"v")?;
                Ok(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(stored.0.lock().clone(), vec![DataId::new(1)]);
    }

    #[test]
    fn run_in_transaction_rolls_back_on_error() {
        let (support, stored) = support(1);
        let err = support
            .run_in_transaction(|tx| {
                tx.store_bytes("e", DataId::new(1), b"v")?;
                Err::<(), _>(CoreError::invalid_argument("bad input"))
            })
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert!(stored.0.lock().is_empty());
        assert_eq!(support.log().open_transactions(), 0);
    }

    #[test]
    fn nested_work_commits_with_the_outer_exchange() {
        let (support, stored) = support(1);
        let mut outer = support.begin();
        support
            .run_nested(&outer, |tx| tx.store_bytes("e", DataId::new(2), b"n"))
            .unwrap();
        assert!(stored.0.lock().is_empty());
        assert_eq!(outer.state(), ExchangeState::Active);

        outer.commit().unwrap();
        assert_eq!(stored.0.lock().len(), 1);
    }

    #[test]
    fn conflicts_are_retried_until_success() {
        let (support, stored) = support(3);
        let mut calls = 0;
        support
            .run_with_retry(|tx| {
                calls += 1;
                tx.store_bytes("e", DataId::new(calls), b"v")?;
                if calls < 3 {
                    return Err(CoreError::conflict("concurrent update"));
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(calls, 3);
        // failed attempts were rolled back
        assert_eq!(stored.0.lock().clone(), vec![DataId::new(3)]);
    }

    #[test]
    fn last_conflict_is_rethrown() {
        let (support, _) = support(2);
        let mut calls = 0;
        let err = support
            .run_with_retry(|_| {
                calls += 1;
                Err::<(), _>(CoreError::conflict(format!("attempt {calls}")))
            })
            .unwrap_err();

        assert_eq!(calls, 2);
        assert_eq!(err.to_string(), "transaction conflict: attempt 2");
    }

    #[test]
    fn non_retryable_errors_are_not_retried() {
        let (support, _) = support(5);
        let mut calls = 0;
        let err = support
            .run_with_retry(|_| {
                calls += 1;
                Err::<(), _>(CoreError::Cancelled)
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, CoreError::Cancelled));
    }
}
