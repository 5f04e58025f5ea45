//! Shard session contract and registry seams
//!
//! These traits are the boundary between the coordinator and the storage
//! side of the system. Each shard owns its own local transactional session;
//! the coordinator only ever drives it through the small contract below.

use crate::options::IsolationLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a single shard (an independently-failing data partition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection metadata for a registered shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub endpoint: String,
}

/// Errors produced by a shard's local session.
///
/// Boxed so that transient classification can walk `source()` chains of
/// whatever backend error type the session wraps.
pub type SessionError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// One shard's local transactional session.
///
/// Isolation is advisory: the level passed to `begin_local_transaction` is
/// forwarded to the backend, which enforces whatever it actually supports.
#[async_trait]
pub trait ShardSession: Send {
    /// Open the shard-local transaction.
    async fn begin_local_transaction(&mut self, isolation: IsolationLevel) -> SessionResult<()>;

    /// Whether the session has unflushed local changes.
    fn has_pending_changes(&self) -> bool;

    /// Flush pending changes into the local transaction, validating and
    /// locking them. After a successful flush the local commit is expected
    /// to succeed barring catastrophic failure.
    async fn flush_pending_changes(&mut self) -> SessionResult<()>;

    /// Commit the shard-local transaction.
    async fn commit_local_transaction(&mut self) -> SessionResult<()>;

    /// Roll back the shard-local transaction.
    async fn rollback_local_transaction(&mut self) -> SessionResult<()>;

    /// Release the session. Must be safe to call more than once.
    async fn dispose(&mut self);
}

/// Registry of known shards (id -> connection metadata).
pub trait ShardRegistry: Send + Sync {
    /// Look up a shard descriptor, `None` if the id is unknown.
    fn lookup(&self, shard_id: &ShardId) -> Option<ShardDescriptor>;
}

/// Opens a live session for a shard on first enlistment.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, shard_id: &ShardId) -> SessionResult<Box<dyn ShardSession>>;
}
