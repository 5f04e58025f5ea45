//! Two-phase commit coordination for writes spanning multiple shards
//!
//! A single logical write that touches several independently-failing data
//! partitions gets all-or-nothing semantics through a prepare-vote round
//! followed by a commit round:
//!
//! - [`Participant`] wraps one shard's local session and local transaction
//!   behind a prepare/commit/rollback protocol with an explicit [`Vote`].
//! - [`Transaction`] aggregates participants under one identity, timeout
//!   and isolation level and owns the 2PC state machine.
//! - [`Coordinator`] mints transactions, enforces one live transaction at
//!   a time, and retries transient failures in fresh transactions.
//!
//! The shard registry and session factory are external seams
//! ([`ShardRegistry`], [`SessionFactory`], [`ShardSession`]); in-memory
//! implementations live in [`mock`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use xshard::mock::MockShardRegistry;
//! use xshard::{Coordinator, TransactionOptions};
//!
//! # async fn demo() -> xshard::Result<()> {
//! let registry = Arc::new(MockShardRegistry::new());
//! let orders = registry.register("orders");
//! let payments = registry.register("payments");
//!
//! let coordinator = Coordinator::new(registry.clone(), registry.clone());
//! coordinator
//!     .run_in_transaction(TransactionOptions::short_lived(), |txn| {
//!         let orders = orders.clone();
//!         let payments = payments.clone();
//!         async move {
//!             txn.enlist("orders").await?;
//!             txn.enlist("payments").await?;
//!             txn.enqueue(&"orders".into(), orders.write_op("order-1")).await?;
//!             txn.enqueue(&"payments".into(), payments.write_op("charge-1")).await?;
//!             Ok(())
//!         }
//!     })
//!     .await
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod mock;
pub mod options;
pub mod participant;
pub mod session;
pub mod transaction;

pub use coordinator::Coordinator;
pub use error::{CoordinatorError, Result, TxnPhase};
pub use options::{IsolationLevel, TransactionOptions};
pub use participant::{Participant, QueuedOperation, Vote};
pub use session::{
    SessionError, SessionFactory, SessionResult, ShardDescriptor, ShardId, ShardRegistry,
    ShardSession,
};
pub use transaction::{Transaction, TransactionId, TransactionState};
