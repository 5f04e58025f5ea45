//! In-memory mock shards for tests and examples
//!
//! Mirrors the role a real registry and session factory play: a
//! `MockShardRegistry` serves both seams, and each registered
//! `MockShard` exposes failure injection and call counters so 2PC
//! behavior can be asserted precisely.

use crate::options::IsolationLevel;
use crate::participant::QueuedOperation;
use crate::session::{
    SessionFactory, SessionResult, ShardDescriptor, ShardId, ShardRegistry, ShardSession,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct FailPlan {
    message: String,
    remaining: usize,
}

#[derive(Default)]
struct ShardState {
    staged: Vec<String>,
    flushed: Vec<String>,
    committed: Vec<String>,
    open: bool,
    last_isolation: Option<IsolationLevel>,
    fail_flush: Option<FailPlan>,
    fail_commit: Option<FailPlan>,
    flush_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    begin_calls: usize,
    flush_calls: usize,
    commit_calls: usize,
    rollback_calls: usize,
    dispose_calls: usize,
}

impl ShardState {
    fn take_failure(plan: &mut Option<FailPlan>) -> Option<String> {
        match plan {
            Some(p) if p.remaining > 0 => {
                p.remaining -= 1;
                let message = p.message.clone();
                if p.remaining == 0 {
                    *plan = None;
                }
                Some(message)
            }
            _ => None,
        }
    }
}

/// One mock shard: staged writes, injected failures, call counters.
pub struct MockShard {
    name: String,
    state: Mutex<ShardState>,
}

impl MockShard {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(ShardState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a queued operation that stages one write on this shard.
    pub fn write_op(self: &Arc<Self>, value: &str) -> QueuedOperation {
        let shard = self.clone();
        let value = value.to_string();
        async move {
            shard.state.lock().staged.push(value);
            Ok(())
        }
        .boxed()
    }

    /// Fail every flush with the given message.
    pub fn fail_flush(&self, message: &str) {
        self.state.lock().fail_flush = Some(FailPlan {
            message: message.to_string(),
            remaining: usize::MAX,
        });
    }

    /// Fail the next `times` flushes, then succeed.
    pub fn fail_flush_times(&self, message: &str, times: usize) {
        self.state.lock().fail_flush = Some(FailPlan {
            message: message.to_string(),
            remaining: times,
        });
    }

    /// Fail every local commit with the given message.
    pub fn fail_commit(&self, message: &str) {
        self.state.lock().fail_commit = Some(FailPlan {
            message: message.to_string(),
            remaining: usize::MAX,
        });
    }

    /// Delay every flush, to exercise prepare-phase timeouts.
    pub fn delay_flush(&self, delay: Duration) {
        self.state.lock().flush_delay = Some(delay);
    }

    /// Delay every local commit, to exercise commit-phase timeouts.
    pub fn delay_commit(&self, delay: Duration) {
        self.state.lock().commit_delay = Some(delay);
    }

    /// Writes committed to the shard, in commit order.
    pub fn committed_values(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Whether a local transaction is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn last_isolation(&self) -> Option<IsolationLevel> {
        self.state.lock().last_isolation
    }

    pub fn begin_calls(&self) -> usize {
        self.state.lock().begin_calls
    }

    pub fn flush_calls(&self) -> usize {
        self.state.lock().flush_calls
    }

    pub fn commit_calls(&self) -> usize {
        self.state.lock().commit_calls
    }

    pub fn rollback_calls(&self) -> usize {
        self.state.lock().rollback_calls
    }

    pub fn dispose_calls(&self) -> usize {
        self.state.lock().dispose_calls
    }
}

/// Session over a mock shard. State lives on the shard handle so tests
/// keep visibility after the session is consumed by a participant.
struct MockShardSession {
    shard: Arc<MockShard>,
}

#[async_trait]
impl ShardSession for MockShardSession {
    async fn begin_local_transaction(&mut self, isolation: IsolationLevel) -> SessionResult<()> {
        let mut state = self.shard.state.lock();
        state.open = true;
        state.last_isolation = Some(isolation);
        state.begin_calls += 1;
        Ok(())
    }

    fn has_pending_changes(&self) -> bool {
        !self.shard.state.lock().staged.is_empty()
    }

    async fn flush_pending_changes(&mut self) -> SessionResult<()> {
        let delay = self.shard.state.lock().flush_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.shard.state.lock();
        state.flush_calls += 1;
        if let Some(message) = ShardState::take_failure(&mut state.fail_flush) {
            return Err(message.into());
        }
        let staged = std::mem::take(&mut state.staged);
        state.flushed.extend(staged);
        Ok(())
    }

    async fn commit_local_transaction(&mut self) -> SessionResult<()> {
        let delay = self.shard.state.lock().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.shard.state.lock();
        state.commit_calls += 1;
        if let Some(message) = ShardState::take_failure(&mut state.fail_commit) {
            return Err(message.into());
        }
        let flushed = std::mem::take(&mut state.flushed);
        state.committed.extend(flushed);
        state.open = false;
        Ok(())
    }

    async fn rollback_local_transaction(&mut self) -> SessionResult<()> {
        let mut state = self.shard.state.lock();
        state.rollback_calls += 1;
        state.staged.clear();
        state.flushed.clear();
        state.open = false;
        Ok(())
    }

    async fn dispose(&mut self) {
        let mut state = self.shard.state.lock();
        state.dispose_calls += 1;
        state.open = false;
    }
}

/// Registry and session factory over a set of mock shards.
#[derive(Default)]
pub struct MockShardRegistry {
    shards: Mutex<HashMap<ShardId, Arc<MockShard>>>,
}

impl MockShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard and return its handle for injection and assertions.
    pub fn register(&self, name: &str) -> Arc<MockShard> {
        let shard = Arc::new(MockShard::new(name.to_string()));
        self.shards
            .lock()
            .insert(ShardId::from(name), shard.clone());
        shard
    }

    /// Handle to a registered shard. Panics if unknown; test helper only.
    pub fn shard(&self, name: &str) -> Arc<MockShard> {
        self.shards
            .lock()
            .get(&ShardId::from(name))
            .cloned()
            .unwrap_or_else(|| panic!("shard {name} not registered"))
    }
}

impl ShardRegistry for MockShardRegistry {
    fn lookup(&self, shard_id: &ShardId) -> Option<ShardDescriptor> {
        self.shards.lock().get(shard_id).map(|s| ShardDescriptor {
            shard_id: shard_id.clone(),
            endpoint: format!("mock://{}", s.name),
        })
    }
}

#[async_trait]
impl SessionFactory for MockShardRegistry {
    async fn create_session(&self, shard_id: &ShardId) -> SessionResult<Box<dyn ShardSession>> {
        let shard = self
            .shards
            .lock()
            .get(shard_id)
            .cloned()
            .ok_or_else(|| format!("unknown shard: {shard_id}"))?;
        Ok(Box::new(MockShardSession { shard }))
    }
}
