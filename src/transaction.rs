//! Transaction: the two-phase-commit state machine
//!
//! A Transaction aggregates one Participant per enlisted shard under a
//! single identity, timeout and isolation level. Phase 1 fans prepares out
//! concurrently and always collects every vote; phase 2 commits prepared
//! participants sequentially in enlistment order, continuing past
//! individual failures so the partial-failure report is exact.

use crate::error::{CoordinatorError, Result, TxnPhase};
use crate::options::{IsolationLevel, TransactionOptions};
use crate::participant::{Participant, QueuedOperation, Vote};
use crate::session::{SessionError, SessionFactory, ShardId, ShardRegistry};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

/// Globally unique, human-debuggable transaction identifier of the form
/// `XS-<name?>-<UTC timestamp>-<random suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub(crate) fn generate(name: Option<&str>) -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let suffix = &uuid[..8];
        match name {
            Some(name) => Self(format!("XS-{name}-{stamp}-{suffix}")),
            None => Self(format!("XS-{stamp}-{suffix}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction lifecycle state. Transitions are monotonic; Committed,
/// RolledBack and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting enlistments and queued operations.
    Active,
    /// Phase 1 in progress.
    Preparing,
    /// Every vote came back Prepared or ReadOnly.
    Prepared,
    /// Phase 2 in progress.
    Committing,
    /// All prepared participants committed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// All participants rolled back.
    RolledBack,
    /// Prepare abort, commit failure, or deadline expiry.
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "active",
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling-back",
            TransactionState::RolledBack => "rolled-back",
            TransactionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The coordinator's slot for its single live transaction.
pub(crate) type ActiveSlot = Mutex<Option<Transaction>>;

#[derive(Clone)]
struct ParticipantEntry {
    shard_id: ShardId,
    participant: Arc<AsyncMutex<Participant>>,
}

struct Inner {
    id: TransactionId,
    options: TransactionOptions,
    state: Mutex<TransactionState>,
    // Vec preserves enlistment order, which phase 2 depends on.
    participants: Mutex<Vec<ParticipantEntry>>,
    registry: Arc<dyn ShardRegistry>,
    factory: Arc<dyn SessionFactory>,
    deadline: Instant,
    slot: Weak<ActiveSlot>,
}

/// Handle to a distributed transaction. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn begin(
        options: TransactionOptions,
        registry: Arc<dyn ShardRegistry>,
        factory: Arc<dyn SessionFactory>,
        slot: Weak<ActiveSlot>,
    ) -> Self {
        let id = TransactionId::generate(options.transaction_name.as_deref());
        let deadline = Instant::now() + options.timeout;
        Self {
            inner: Arc::new(Inner {
                id,
                options,
                state: Mutex::new(TransactionState::Active),
                participants: Mutex::new(Vec::new()),
                registry,
                factory,
                deadline,
                slot,
            }),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.options.isolation_level
    }

    pub fn timeout(&self) -> Duration {
        self.inner.options.timeout
    }

    /// Shard ids in enlistment order.
    pub fn enlisted_shard_ids(&self) -> Vec<ShardId> {
        self.inner
            .participants
            .lock()
            .iter()
            .map(|e| e.shard_id.clone())
            .collect()
    }

    pub fn get_participant(&self, shard_id: &ShardId) -> Option<Arc<AsyncMutex<Participant>>> {
        self.inner
            .participants
            .lock()
            .iter()
            .find(|e| &e.shard_id == shard_id)
            .map(|e| e.participant.clone())
    }

    /// Enlist a shard, opening its local transaction immediately.
    ///
    /// Idempotent: a shard id maps to at most one participant. Valid only
    /// while Active.
    pub async fn enlist(&self, shard_id: impl Into<ShardId>) -> Result<()> {
        let shard_id = shard_id.into();
        self.check_deadline(TxnPhase::Enlist)?;
        self.guard_active()?;

        if self.get_participant(&shard_id).is_some() {
            return Ok(());
        }

        let descriptor = self
            .inner
            .registry
            .lookup(&shard_id)
            .ok_or_else(|| CoordinatorError::ShardNotFound(shard_id.clone()))?;

        let remaining = self.remaining();
        let open = async {
            let session = self
                .inner
                .factory
                .create_session(&shard_id)
                .await
                .map_err(|source| CoordinatorError::Session {
                    shard: shard_id.clone(),
                    source,
                })?;
            Participant::open(
                shard_id.clone(),
                session,
                self.inner.options.isolation_level,
            )
            .await
        };
        let mut participant = tokio::time::timeout(remaining, open)
            .await
            .map_err(|_| CoordinatorError::Timeout {
                phase: TxnPhase::Enlist,
            })??;

        let mut participants = self.inner.participants.lock();
        if participants.iter().any(|e| e.shard_id == shard_id) {
            // Lost a race with a concurrent enlist of the same shard.
            tokio::spawn(async move { participant.dispose().await });
            return Ok(());
        }
        tracing::debug!(
            txn_id = %self.inner.id,
            shard = %shard_id,
            endpoint = %descriptor.endpoint,
            "shard enlisted"
        );
        participants.push(ParticipantEntry {
            shard_id,
            participant: Arc::new(AsyncMutex::new(participant)),
        });
        Ok(())
    }

    /// Queue a write operation against an already-enlisted shard.
    pub async fn enqueue(&self, shard_id: &ShardId, op: QueuedOperation) -> Result<()> {
        self.check_deadline(TxnPhase::Enlist)?;
        self.guard_active()?;
        let participant = self
            .get_participant(shard_id)
            .ok_or_else(|| CoordinatorError::ShardNotFound(shard_id.clone()))?;
        participant.lock().await.enqueue(op);
        Ok(())
    }

    /// Run two-phase commit across every enlisted participant.
    pub async fn commit(&self) -> Result<()> {
        self.check_deadline(TxnPhase::Prepare)?;
        self.guard_active()?;

        let entries: Vec<ParticipantEntry> = self.inner.participants.lock().clone();
        if entries.is_empty() {
            self.set_state(TransactionState::Committed);
            tracing::debug!(txn_id = %self.inner.id, "no participants, committed trivially");
            return Ok(());
        }

        self.prepare_all(&entries).await?;

        self.set_state(TransactionState::Prepared);
        self.set_state(TransactionState::Committing);
        self.commit_prepared(&entries).await
    }

    /// Phase 1: prepare every participant concurrently, collecting every
    /// vote. Never short-circuits: each opened local transaction must be
    /// resolved, so the fan-out always runs to completion (or the deadline).
    async fn prepare_all(&self, entries: &[ParticipantEntry]) -> Result<()> {
        self.set_state(TransactionState::Preparing);
        let remaining = self.remaining();

        let prepares = entries.iter().map(|entry| {
            let participant = entry.participant.clone();
            let shard_id = entry.shard_id.clone();
            async move {
                let attempt = async {
                    let mut guard = participant.lock().await;
                    guard.prepare().await
                };
                match tokio::time::timeout(remaining, attempt).await {
                    Ok(Ok(vote)) => (shard_id, vote, None, false),
                    Ok(Err(source)) => (shard_id, Vote::Abort, Some(source), false),
                    Err(_) => (shard_id, Vote::Abort, None, true),
                }
            }
        });
        let outcomes: Vec<(ShardId, Vote, Option<SessionError>, bool)> = join_all(prepares).await;

        let timed_out = outcomes.iter().any(|(_, _, _, elapsed)| *elapsed);
        let aborted: Vec<ShardId> = outcomes
            .iter()
            .filter(|(_, vote, _, _)| *vote == Vote::Abort)
            .map(|(shard, _, _, _)| shard.clone())
            .collect();

        if aborted.is_empty() {
            return Ok(());
        }

        // Every participant is rolled back, not only the aborting ones.
        self.rollback_participants(entries).await;
        self.set_state(TransactionState::Failed);
        tracing::warn!(
            txn_id = %self.inner.id,
            aborted = ?aborted.iter().map(ShardId::as_str).collect::<Vec<_>>(),
            timed_out,
            "prepare phase aborted, all participants rolled back"
        );

        if timed_out {
            return Err(CoordinatorError::Timeout {
                phase: TxnPhase::Prepare,
            });
        }
        let source = outcomes
            .into_iter()
            .find_map(|(_, _, source, _)| source)
            .unwrap_or_else(|| "participant voted abort".to_string().into());
        Err(CoordinatorError::PrepareFailed { aborted, source })
    }

    /// Phase 2: commit prepared participants sequentially in enlistment
    /// order, continuing past individual failures. Prepared local
    /// transactions are already durable and locked; stopping mid-flight
    /// would be worse than finishing and reporting the exact partial state.
    async fn commit_prepared(&self, entries: &[ParticipantEntry]) -> Result<()> {
        let mut committed: Vec<ShardId> = Vec::new();
        let mut failed: Vec<ShardId> = Vec::new();
        let mut first_failure: Option<CoordinatorError> = None;
        let mut any_timeout = false;

        for entry in entries {
            let mut participant = entry.participant.lock().await;
            match participant.vote() {
                Vote::ReadOnly => {
                    // Nothing to commit; release the local transaction now
                    // so no participant is left unresolved.
                    participant.rollback().await;
                    tracing::debug!(
                        txn_id = %self.inner.id,
                        shard = %entry.shard_id,
                        "read-only participant skipped"
                    );
                    continue;
                }
                Vote::Prepared => {}
                // Unreachable when driven through commit(): prepare_all
                // already resolved any Pending/Abort vote.
                other => {
                    failed.push(entry.shard_id.clone());
                    first_failure.get_or_insert(CoordinatorError::InvalidState {
                        expected: "prepared or read-only vote".to_string(),
                        actual: format!("{other} vote"),
                    });
                    continue;
                }
            }

            let remaining = self.remaining();
            match tokio::time::timeout(remaining, participant.commit()).await {
                Ok(Ok(())) => committed.push(entry.shard_id.clone()),
                Ok(Err(error)) => {
                    tracing::error!(
                        txn_id = %self.inner.id,
                        shard = %entry.shard_id,
                        %error,
                        "local commit failed, continuing with remaining shards"
                    );
                    failed.push(entry.shard_id.clone());
                    first_failure.get_or_insert(error);
                }
                Err(_) => {
                    tracing::error!(
                        txn_id = %self.inner.id,
                        shard = %entry.shard_id,
                        "local commit timed out, continuing with remaining shards"
                    );
                    failed.push(entry.shard_id.clone());
                    any_timeout = true;
                }
            }
        }

        if failed.is_empty() {
            self.set_state(TransactionState::Committed);
            tracing::info!(
                txn_id = %self.inner.id,
                shards = committed.len(),
                "transaction committed"
            );
            return Ok(());
        }

        // Resolve anything still open (a failed local commit may leave the
        // local transaction dangling), then report the in-doubt condition.
        self.rollback_participants(entries).await;
        self.set_state(TransactionState::Failed);
        tracing::error!(
            txn_id = %self.inner.id,
            committed = ?committed.iter().map(ShardId::as_str).collect::<Vec<_>>(),
            failed = ?failed.iter().map(ShardId::as_str).collect::<Vec<_>>(),
            "commit phase failed, transaction in doubt"
        );

        match first_failure {
            Some(cause) => Err(CoordinatorError::InDoubt {
                committed,
                failed,
                source: Box::new(cause),
            }),
            // Every failure was a timeout.
            None => {
                debug_assert!(any_timeout);
                Err(CoordinatorError::Timeout {
                    phase: TxnPhase::Commit,
                })
            }
        }
    }

    /// Roll back every enlisted participant. No-op once Committed or
    /// RolledBack. A Failed transaction stays Failed but still resolves its
    /// participants: deadline expiry marks the transaction Failed without
    /// touching the shards, so their local transactions may be open here.
    /// Participant::rollback guards on the open flag, making the paths that
    /// already resolved everything harmless repeats.
    pub async fn rollback(&self) -> Result<()> {
        let was_failed = {
            let mut state = self.inner.state.lock();
            match *state {
                TransactionState::Committed | TransactionState::RolledBack => return Ok(()),
                TransactionState::Failed => true,
                _ => {
                    *state = TransactionState::RollingBack;
                    false
                }
            }
        };
        let entries: Vec<ParticipantEntry> = self.inner.participants.lock().clone();
        self.rollback_participants(&entries).await;
        if !was_failed {
            self.set_state(TransactionState::RolledBack);
        }
        tracing::debug!(txn_id = %self.inner.id, "transaction rolled back");
        Ok(())
    }

    /// Idempotent: rolls back if still live, disposes every participant,
    /// and releases the coordinator's active slot.
    pub async fn dispose(&self) {
        if !self.state().is_terminal() {
            let _ = self.rollback().await;
        }
        let entries: Vec<ParticipantEntry> = {
            let mut participants = self.inner.participants.lock();
            participants.drain(..).collect()
        };
        for entry in entries {
            entry.participant.lock().await.dispose().await;
        }
        if let Some(slot) = self.inner.slot.upgrade() {
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|t| t.id() == self.id()) {
                *slot = None;
            }
        }
        tracing::debug!(txn_id = %self.inner.id, "transaction disposed");
    }

    /// Concurrent best-effort rollback; per-participant errors are logged
    /// inside Participant::rollback and never propagate.
    async fn rollback_participants(&self, entries: &[ParticipantEntry]) {
        let rollbacks = entries.iter().map(|entry| {
            let participant = entry.participant.clone();
            async move {
                participant.lock().await.rollback().await;
            }
        });
        join_all(rollbacks).await;
    }

    fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock() = state;
    }

    fn guard_active(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(CoordinatorError::InvalidState {
                expected: TransactionState::Active.to_string(),
                actual: state.to_string(),
            });
        }
        Ok(())
    }

    fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Deadline expiry in any non-terminal state force-sets Failed without
    /// auto-rollback; the caller reacts via the returned Timeout error.
    fn check_deadline(&self, phase: TxnPhase) -> Result<()> {
        if Instant::now() < self.inner.deadline {
            return Ok(());
        }
        let mut state = self.inner.state.lock();
        if !state.is_terminal() {
            tracing::warn!(
                txn_id = %self.inner.id,
                state = %*state,
                "transaction deadline expired"
            );
            *state = TransactionState::Failed;
        }
        Err(CoordinatorError::Timeout { phase })
    }
}
