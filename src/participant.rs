//! Participant: one shard's stake in a distributed transaction

use crate::error::{CoordinatorError, Result};
use crate::options::IsolationLevel;
use crate::session::{SessionError, SessionResult, ShardId, ShardSession};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A participant's declared readiness to commit, decided during phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// Prepare has not run yet.
    Pending,
    /// Pending changes were flushed, validated and locked; the local
    /// commit is now expected to succeed.
    Prepared,
    /// Prepare failed; the transaction must be rolled back everywhere.
    Abort,
    /// No pending changes; the commit phase skips this participant.
    ReadOnly,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Vote::Pending => "pending",
            Vote::Prepared => "prepared",
            Vote::Abort => "abort",
            Vote::ReadOnly => "read-only",
        };
        write!(f, "{s}")
    }
}

/// A write operation queued against one shard, executed at prepare time.
/// Operations capture whatever handles they need to stage writes on the
/// shard's session; nothing runs until prepare.
pub type QueuedOperation = BoxFuture<'static, SessionResult<()>>;

/// Wraps one shard's local session and local transaction.
///
/// The local transaction is opened eagerly at construction, not lazily at
/// prepare time, so enlistment failures surface where the caller can still
/// choose not to proceed.
pub struct Participant {
    shard_id: ShardId,
    session: Box<dyn ShardSession>,
    vote: Vote,
    queue: Vec<QueuedOperation>,
    open: bool,
}

impl Participant {
    /// Construct a participant and open its local transaction.
    pub(crate) async fn open(
        shard_id: ShardId,
        mut session: Box<dyn ShardSession>,
        isolation: IsolationLevel,
    ) -> Result<Self> {
        session
            .begin_local_transaction(isolation)
            .await
            .map_err(|source| CoordinatorError::Session {
                shard: shard_id.clone(),
                source,
            })?;

        tracing::debug!(shard = %shard_id, %isolation, "participant opened local transaction");

        Ok(Self {
            shard_id,
            session,
            vote: Vote::Pending,
            queue: Vec::new(),
            open: true,
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn vote(&self) -> Vote {
        self.vote
    }

    /// Whether the local transaction is still unresolved.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Direct access to the shard-local session, for shard-local reads and
    /// writes between enlistment and commit.
    pub fn session_mut(&mut self) -> &mut dyn ShardSession {
        self.session.as_mut()
    }

    /// Queue a write operation. Nothing executes until prepare.
    pub fn enqueue(&mut self, op: QueuedOperation) {
        self.queue.push(op);
    }

    /// Phase 1: execute queued operations, then flush pending changes.
    ///
    /// No pending changes after the queue drains means the participant is
    /// read-only and the commit phase will skip it. A failed operation or
    /// flush records an abort vote and propagates the cause.
    pub(crate) async fn prepare(&mut self) -> std::result::Result<Vote, SessionError> {
        for op in std::mem::take(&mut self.queue) {
            if let Err(source) = op.await {
                self.vote = Vote::Abort;
                tracing::warn!(shard = %self.shard_id, error = %source, "queued operation failed");
                return Err(source);
            }
        }

        if !self.session.has_pending_changes() {
            self.vote = Vote::ReadOnly;
            tracing::debug!(shard = %self.shard_id, "participant voted read-only");
            return Ok(Vote::ReadOnly);
        }

        match self.session.flush_pending_changes().await {
            Ok(()) => {
                self.vote = Vote::Prepared;
                tracing::debug!(shard = %self.shard_id, "participant voted prepared");
                Ok(Vote::Prepared)
            }
            Err(source) => {
                self.vote = Vote::Abort;
                tracing::warn!(shard = %self.shard_id, error = %source, "flush failed, voting abort");
                Err(source)
            }
        }
    }

    /// Phase 2: commit the local transaction.
    ///
    /// Only reachable for Prepared participants via the owning Transaction;
    /// any other vote is a programming error.
    pub(crate) async fn commit(&mut self) -> Result<()> {
        match self.vote {
            Vote::Prepared => {
                self.session
                    .commit_local_transaction()
                    .await
                    .map_err(|source| CoordinatorError::Session {
                        shard: self.shard_id.clone(),
                        source,
                    })?;
                self.open = false;
                tracing::debug!(shard = %self.shard_id, "participant committed");
                Ok(())
            }
            Vote::ReadOnly => Ok(()),
            other => Err(CoordinatorError::InvalidState {
                expected: "prepared or read-only vote".to_string(),
                actual: format!("{other} vote"),
            }),
        }
    }

    /// Best-effort rollback. Never fails: this often runs inside cleanup
    /// paths where a secondary error would mask the primary cause.
    pub(crate) async fn rollback(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(error) = self.session.rollback_local_transaction().await {
            tracing::warn!(shard = %self.shard_id, %error, "participant rollback failed");
        } else {
            tracing::debug!(shard = %self.shard_id, "participant rolled back");
        }
    }

    /// Idempotent: rolls back if the local transaction is still open, then
    /// releases the session.
    pub(crate) async fn dispose(&mut self) {
        if self.open {
            self.rollback().await;
        }
        self.session.dispose().await;
    }
}
