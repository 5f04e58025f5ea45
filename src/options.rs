//! Transaction options and isolation levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Advisory isolation level forwarded to each shard's local session.
///
/// Enforcement is the local session's responsibility; the coordinator
/// only carries the level through to `begin_local_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        };
        write!(f, "{s}")
    }
}

/// Options controlling a single distributed transaction.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Overall transaction timeout, measured from construction.
    pub timeout: Duration,

    /// Advisory isolation level for every enlisted shard.
    pub isolation_level: IsolationLevel,

    /// Whether `run_in_transaction` retries transient failures.
    pub enable_retry: bool,

    /// Additional attempts after the first failure.
    pub max_retry_attempts: u32,

    /// Base delay between retry attempts.
    pub retry_delay: Duration,

    /// Double the delay on each attempt, capped at `max_retry_delay`.
    pub use_exponential_backoff: bool,

    /// Upper bound for the backoff delay.
    pub max_retry_delay: Duration,

    /// Optional human-readable name embedded in the transaction id.
    pub transaction_name: Option<String>,

    /// Reserved: no durable transaction log exists yet, so recovery is
    /// a stub regardless of this flag.
    pub enable_recovery: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            isolation_level: IsolationLevel::ReadCommitted,
            enable_retry: true,
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(200),
            use_exponential_backoff: true,
            max_retry_delay: Duration::from_secs(10),
            transaction_name: None,
            enable_recovery: false,
        }
    }
}

impl TransactionOptions {
    /// Preset for short interactive writes.
    pub fn short_lived() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retry_attempts: 2,
            enable_recovery: false,
            ..Self::default()
        }
    }

    /// Preset for long batch-style transactions.
    pub fn long_running() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retry_attempts: 5,
            enable_recovery: true,
            ..Self::default()
        }
    }

    /// Builder-style name setter.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.transaction_name = Some(name.into());
        self
    }

    /// Delay before the given retry attempt (0-based).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.retry_delay;
        }
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}
