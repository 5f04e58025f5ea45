//! Coordinator: transaction factory, lifecycle and retry policy
//!
//! The "current transaction" used to be ambient, task-local state; here it
//! is an explicit handle returned by `begin_transaction` and threaded by
//! the caller. The coordinator still enforces one live transaction at a
//! time through its active slot, so accidental nesting fails fast.

use crate::error::{CoordinatorError, Result};
use crate::options::TransactionOptions;
use crate::session::{SessionFactory, ShardRegistry};
use crate::transaction::{ActiveSlot, Transaction};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// Factory and lifecycle manager for distributed transactions.
pub struct Coordinator {
    registry: Arc<dyn ShardRegistry>,
    factory: Arc<dyn SessionFactory>,
    active: Arc<ActiveSlot>,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn ShardRegistry>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            registry,
            factory,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// The live transaction, if one has been begun and not yet disposed.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.active.lock().clone()
    }

    /// Begin a new distributed transaction.
    ///
    /// Fails with InvalidState while a previous transaction is still live:
    /// nested transactions are not supported. A terminal but undisposed
    /// transaction does not block a new begin.
    pub fn begin_transaction(&self, options: TransactionOptions) -> Result<Transaction> {
        let mut slot = self.active.lock();
        if let Some(existing) = slot.as_ref()
            && !existing.state().is_terminal()
        {
            return Err(CoordinatorError::InvalidState {
                expected: "no live transaction".to_string(),
                actual: format!(
                    "transaction {} in state {}",
                    existing.id(),
                    existing.state()
                ),
            });
        }

        let txn = Transaction::begin(
            options,
            self.registry.clone(),
            self.factory.clone(),
            Arc::downgrade(&self.active),
        );
        tracing::debug!(
            txn_id = %txn.id(),
            timeout_ms = txn.timeout().as_millis() as u64,
            isolation = %txn.isolation_level(),
            "transaction started"
        );
        *slot = Some(txn.clone());
        Ok(txn)
    }

    /// Begin a transaction, run `action` against it, and commit.
    ///
    /// Any error from the action or the commit rolls the transaction back
    /// and propagates unchanged; rollback problems are logged, never
    /// allowed to mask the original cause. The transaction is always
    /// disposed, success or failure.
    ///
    /// When retry is enabled, transient failures are retried against a
    /// fresh transaction per attempt. In-doubt outcomes are never retried.
    pub async fn run_in_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        action: F,
    ) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let txn = self.begin_transaction(options.clone())?;
            let outcome = Self::attempt(&txn, &action).await;
            txn.dispose().await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = options.enable_retry
                        && attempt < options.max_retry_attempts
                        && error.is_transient();
                    if !retryable {
                        return Err(error);
                    }
                    let delay = options.delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        %error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying in a fresh transaction"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(txn: &Transaction, action: &F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match action(txn.clone()).await {
            Ok(value) => txn.commit().await.map(|()| value),
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            tracing::warn!(txn_id = %txn.id(), %error, "transaction failed, rolling back");
            // Rollback never propagates; a prepare failure has already
            // rolled everything back and rollback() no-ops on terminal
            // states.
            if let Err(rollback_error) = txn.rollback().await {
                tracing::warn!(txn_id = %txn.id(), error = %rollback_error, "rollback failed");
            }
        }
        result
    }

    /// Recover in-doubt transactions from a durable log.
    ///
    /// No durable transaction log exists, so this always reports zero
    /// recovered transactions. An explicit scope limit, not a defect:
    /// in-doubt outcomes carry their committed/failed shard lists for
    /// manual reconciliation instead.
    pub async fn recover(&self) -> Result<usize> {
        tracing::debug!("recover requested, no durable transaction log present");
        Ok(0)
    }
}
