//! Error types for the coordinator

use crate::session::{SessionError, ShardId};
use std::fmt;
use thiserror::Error;

/// Phase during which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Enlist,
    Prepare,
    Commit,
}

impl fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnPhase::Enlist => "enlist",
            TxnPhase::Prepare => "prepare",
            TxnPhase::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The shard id is not present in the registry. Fatal, never retried.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// An operation was attempted in a state that does not allow it.
    /// A programming error, never retried.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// At least one participant voted to abort during phase 1. Every
    /// participant has already been rolled back by the time this surfaces.
    #[error("prepare failed, aborted by shards [{}]", shard_list(.aborted))]
    PrepareFailed {
        aborted: Vec<ShardId>,
        #[source]
        source: SessionError,
    },

    /// Some shards committed and some did not. The most severe outcome:
    /// no durable log exists to reconcile automatically, so the lists are
    /// carried for manual reconciliation. Never retried.
    #[error(
        "transaction in doubt: committed shards [{}], failed shards [{}]",
        shard_list(.committed),
        shard_list(.failed)
    )]
    InDoubt {
        committed: Vec<ShardId>,
        failed: Vec<ShardId>,
        #[source]
        source: SessionError,
    },

    /// The transaction deadline expired. Distinguished from other failures
    /// for differentiated alerting; eligible for retry.
    #[error("transaction timed out during {phase} phase")]
    Timeout { phase: TxnPhase },

    /// A shard-local session call failed outside the prepare/commit votes.
    #[error("session error on shard {shard}")]
    Session {
        shard: ShardId,
        #[source]
        source: SessionError,
    },
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

fn shard_list(shards: &[ShardId]) -> String {
    shards
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoordinatorError {
    /// Whether this error is worth retrying in a fresh transaction.
    ///
    /// Timeouts are always transient. In-doubt outcomes never are, no
    /// matter what caused them. Everything else is transient only if its
    /// message, or any wrapped cause, mentions a deadlock, timeout, or
    /// connection failure.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinatorError::Timeout { .. } => true,
            CoordinatorError::InDoubt { .. } => false,
            CoordinatorError::InvalidState { .. } | CoordinatorError::ShardNotFound(_) => false,
            other => message_chain_matches(other),
        }
    }
}

/// Walk the error and its `source()` chain looking for transient markers.
fn message_chain_matches(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let msg = e.to_string().to_ascii_lowercase();
        if msg.contains("deadlock") || msg.contains("timeout") || msg.contains("connection") {
            return true;
        }
        current = e.source();
    }
    false
}
