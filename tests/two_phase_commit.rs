//! Integration tests driving two-phase commit across mock shards

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use xshard::mock::MockShardRegistry;
use xshard::{
    Coordinator, CoordinatorError, IsolationLevel, ShardId, TransactionOptions, TransactionState,
    TxnPhase, Vote,
};

fn setup(shards: &[&str]) -> (Arc<MockShardRegistry>, Coordinator) {
    let registry = Arc::new(MockShardRegistry::new());
    for shard in shards {
        registry.register(shard);
    }
    let coordinator = Coordinator::new(registry.clone(), registry.clone());
    (registry, coordinator)
}

fn fast_retry_options() -> TransactionOptions {
    TransactionOptions {
        retry_delay: Duration::from_millis(10),
        use_exponential_backoff: false,
        ..TransactionOptions::default()
    }
}

#[tokio::test]
async fn empty_transaction_commits_trivially() {
    let (_, coordinator) = setup(&[]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    txn.commit().await.unwrap();
    assert_eq!(txn.state(), TransactionState::Committed);
    txn.dispose().await;
}

#[tokio::test]
async fn enlisting_same_shard_twice_yields_one_participant() {
    let (registry, coordinator) = setup(&["a"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    txn.enlist("a").await.unwrap();
    txn.enlist("a").await.unwrap();

    assert_eq!(txn.enlisted_shard_ids(), vec![ShardId::from("a")]);
    assert_eq!(registry.shard("a").begin_calls(), 1);
    txn.dispose().await;
}

#[tokio::test]
async fn enlist_unknown_shard_fails() {
    let (_, coordinator) = setup(&["a"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    let err = txn.enlist("missing").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ShardNotFound(_)));
    txn.dispose().await;
}

#[tokio::test]
async fn all_read_only_participants_skip_commit_phase() {
    let (registry, coordinator) = setup(&["a", "b"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    txn.enlist("a").await.unwrap();
    txn.enlist("b").await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(txn.state(), TransactionState::Committed);
    for name in ["a", "b"] {
        let shard = registry.shard(name);
        // Neither a flush nor a local commit is ever issued for a
        // read-only participant.
        assert_eq!(shard.flush_calls(), 0);
        assert_eq!(shard.commit_calls(), 0);
        assert!(!shard.is_open());

        let participant = txn.get_participant(&ShardId::from(name)).unwrap();
        assert_eq!(participant.lock().await.vote(), Vote::ReadOnly);
    }
    txn.dispose().await;
}

#[tokio::test]
async fn read_only_and_write_mix_commits() {
    let (registry, coordinator) = setup(&["a", "b"]);
    let shard_b = registry.shard("b");
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    txn.enlist("a").await.unwrap();
    txn.enlist("b").await.unwrap();
    txn.enqueue(&ShardId::from("b"), shard_b.write_op("row-1"))
        .await
        .unwrap();
    txn.commit().await.unwrap();

    assert_eq!(txn.state(), TransactionState::Committed);
    let participant_a = txn.get_participant(&ShardId::from("a")).unwrap();
    assert_eq!(participant_a.lock().await.vote(), Vote::ReadOnly);
    assert_eq!(registry.shard("a").commit_calls(), 0);
    assert_eq!(shard_b.committed_values(), vec!["row-1".to_string()]);
    txn.dispose().await;
}

#[tokio::test]
async fn prepare_failure_names_shard_and_rolls_back_everyone() {
    let (registry, coordinator) = setup(&["a", "b", "c"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    for name in ["a", "b", "c"] {
        let shard = registry.shard(name);
        txn.enlist(name).await.unwrap();
        txn.enqueue(&ShardId::from(name), shard.write_op("row"))
            .await
            .unwrap();
    }
    registry.shard("b").fail_flush("disk full");

    let err = txn.commit().await.unwrap_err();
    match err {
        CoordinatorError::PrepareFailed { aborted, .. } => {
            assert_eq!(aborted, vec![ShardId::from("b")]);
        }
        other => panic!("expected PrepareFailed, got {other}"),
    }
    assert_eq!(txn.state(), TransactionState::Failed);

    // Every participant, not only the aborting one, is rolled back once,
    // and no local transaction is left unresolved.
    for name in ["a", "b", "c"] {
        let shard = registry.shard(name);
        assert_eq!(shard.rollback_calls(), 1, "shard {name}");
        assert!(!shard.is_open(), "shard {name}");
        assert!(shard.committed_values().is_empty(), "shard {name}");
    }
    txn.dispose().await;
}

#[tokio::test]
async fn commit_failure_continues_past_failed_shard() {
    let (registry, coordinator) = setup(&["a", "b", "c"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    for name in ["a", "b", "c"] {
        let shard = registry.shard(name);
        txn.enlist(name).await.unwrap();
        txn.enqueue(&ShardId::from(name), shard.write_op("row"))
            .await
            .unwrap();
    }
    registry.shard("b").fail_commit("page corrupted");

    let err = txn.commit().await.unwrap_err();
    match err {
        CoordinatorError::InDoubt { committed, failed, .. } => {
            assert_eq!(committed, vec![ShardId::from("a"), ShardId::from("c")]);
            assert_eq!(failed, vec![ShardId::from("b")]);
        }
        other => panic!("expected InDoubt, got {other}"),
    }
    assert_eq!(txn.state(), TransactionState::Failed);

    // a committed before the failure, c was still attempted after it.
    assert_eq!(registry.shard("a").committed_values(), vec!["row".to_string()]);
    assert_eq!(registry.shard("c").commit_calls(), 1);
    assert_eq!(registry.shard("c").committed_values(), vec!["row".to_string()]);

    // b's dangling local transaction was resolved by rollback.
    assert!(!registry.shard("b").is_open());
    assert_eq!(registry.shard("b").rollback_calls(), 1);
    txn.dispose().await;
}

#[tokio::test]
async fn slow_prepare_times_out_and_fails_transaction() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");
    shard.delay_flush(Duration::from_millis(500));

    let options = TransactionOptions {
        timeout: Duration::from_millis(50),
        ..TransactionOptions::default()
    };
    let txn = coordinator.begin_transaction(options).unwrap();
    txn.enlist("a").await.unwrap();
    txn.enqueue(&ShardId::from("a"), shard.write_op("row"))
        .await
        .unwrap();

    let err = txn.commit().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Timeout {
            phase: TxnPhase::Prepare
        }
    ));
    assert_eq!(txn.state(), TransactionState::Failed);
    assert!(!shard.is_open());
    txn.dispose().await;
}

#[tokio::test]
async fn slow_commit_times_out_as_commit_phase_timeout() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");
    shard.delay_commit(Duration::from_millis(500));

    let options = TransactionOptions {
        timeout: Duration::from_millis(150),
        ..TransactionOptions::default()
    };
    let txn = coordinator.begin_transaction(options).unwrap();
    txn.enlist("a").await.unwrap();
    txn.enqueue(&ShardId::from("a"), shard.write_op("row"))
        .await
        .unwrap();

    let err = txn.commit().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Timeout {
            phase: TxnPhase::Commit
        }
    ));
    assert_eq!(txn.state(), TransactionState::Failed);
    assert!(!shard.is_open());
    assert!(shard.committed_values().is_empty());
    txn.dispose().await;
}

#[tokio::test]
async fn rollback_after_deadline_expiry_resolves_open_participants() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");

    let options = TransactionOptions {
        timeout: Duration::from_millis(50),
        ..TransactionOptions::default()
    };
    let txn = coordinator.begin_transaction(options).unwrap();
    txn.enlist("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Deadline expiry marks the transaction Failed without touching the
    // shard, so its local transaction is still open.
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Timeout { .. }));
    assert_eq!(txn.state(), TransactionState::Failed);
    assert!(shard.is_open());

    txn.rollback().await.unwrap();
    assert!(!shard.is_open());
    assert_eq!(shard.rollback_calls(), 1);
    assert_eq!(txn.state(), TransactionState::Failed);
    txn.dispose().await;
}

#[tokio::test]
async fn second_begin_without_completing_first_is_invalid() {
    let (_, coordinator) = setup(&[]);
    let first = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();

    let err = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidState { .. }));

    first.dispose().await;
    // Disposing the first transaction frees the slot.
    let second = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();
    second.dispose().await;
}

#[tokio::test]
async fn enlist_after_commit_is_invalid_state() {
    let (_, coordinator) = setup(&["a"]);
    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();
    txn.commit().await.unwrap();

    let err = txn.enlist("a").await.unwrap_err();
    match err {
        CoordinatorError::InvalidState { expected, actual } => {
            assert_eq!(expected, "active");
            assert_eq!(actual, "committed");
        }
        other => panic!("expected InvalidState, got {other}"),
    }
    txn.dispose().await;
}

#[tokio::test]
async fn isolation_level_is_forwarded_to_sessions() {
    let (registry, coordinator) = setup(&["a"]);
    let options = TransactionOptions {
        isolation_level: IsolationLevel::Serializable,
        ..TransactionOptions::default()
    };
    let txn = coordinator.begin_transaction(options).unwrap();
    txn.enlist("a").await.unwrap();

    assert_eq!(
        registry.shard("a").last_isolation(),
        Some(IsolationLevel::Serializable)
    );
    txn.dispose().await;
}

#[tokio::test]
async fn current_transaction_tracks_the_live_handle() {
    let (_, coordinator) = setup(&[]);
    assert!(coordinator.current_transaction().is_none());

    let txn = coordinator
        .begin_transaction(TransactionOptions::default())
        .unwrap();
    assert_eq!(
        coordinator.current_transaction().map(|t| t.id().clone()),
        Some(txn.id().clone())
    );

    txn.dispose().await;
    assert!(coordinator.current_transaction().is_none());
}

#[tokio::test]
async fn run_in_transaction_commits_and_returns_value() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");

    let total = coordinator
        .run_in_transaction(TransactionOptions::default(), |txn| {
            let shard = shard.clone();
            async move {
                txn.enlist("a").await?;
                txn.enqueue(&ShardId::from("a"), shard.write_op("row-1"))
                    .await?;
                Ok(42u64)
            }
        })
        .await
        .unwrap();

    assert_eq!(total, 42);
    assert_eq!(shard.committed_values(), vec!["row-1".to_string()]);
    assert!(coordinator.current_transaction().is_none());
}

#[tokio::test]
async fn run_in_transaction_rolls_back_on_action_error() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");

    let err = coordinator
        .run_in_transaction(TransactionOptions::default(), |txn| {
            let shard = shard.clone();
            async move {
                txn.enlist("a").await?;
                txn.enqueue(&ShardId::from("a"), shard.write_op("row-1"))
                    .await?;
                Err::<(), _>(CoordinatorError::Session {
                    shard: ShardId::from("a"),
                    source: "validation rejected".to_string().into(),
                })
            }
        })
        .await
        .unwrap_err();

    // The original action error propagates unchanged.
    assert!(matches!(err, CoordinatorError::Session { .. }));
    assert!(shard.committed_values().is_empty());
    assert_eq!(shard.rollback_calls(), 1);
    assert!(coordinator.current_transaction().is_none());
}

#[tokio::test]
async fn transient_prepare_failure_is_retried_in_fresh_transaction() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");
    shard.fail_flush_times("deadlock detected", 1);

    let attempts = Arc::new(AtomicUsize::new(0));
    let observed = attempts.clone();
    coordinator
        .run_in_transaction(fast_retry_options(), |txn| {
            let shard = shard.clone();
            let attempts = observed.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                txn.enlist("a").await?;
                txn.enqueue(&ShardId::from("a"), shard.write_op("row-1"))
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(shard.committed_values(), vec!["row-1".to_string()]);
    // Each attempt opened its own session/local transaction.
    assert_eq!(shard.begin_calls(), 2);
}

#[tokio::test]
async fn in_doubt_outcome_is_never_retried() {
    let (registry, coordinator) = setup(&["a", "b"]);
    registry.shard("b").fail_commit("connection reset");

    let attempts = Arc::new(AtomicUsize::new(0));
    let observed = attempts.clone();
    let err = coordinator
        .run_in_transaction(fast_retry_options(), |txn| {
            let registry = registry.clone();
            let attempts = observed.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                for name in ["a", "b"] {
                    txn.enlist(name).await?;
                    let shard = registry.shard(name);
                    txn.enqueue(&ShardId::from(name), shard.write_op("row"))
                        .await?;
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

    // Transient-looking cause, but in-doubt is final.
    assert!(matches!(err, CoordinatorError::InDoubt { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_disabled_fails_on_first_transient_error() {
    let (registry, coordinator) = setup(&["a"]);
    let shard = registry.shard("a");
    shard.fail_flush_times("deadlock detected", 1);

    let options = TransactionOptions {
        enable_retry: false,
        ..fast_retry_options()
    };
    let attempts = Arc::new(AtomicUsize::new(0));
    let observed = attempts.clone();
    let err = coordinator
        .run_in_transaction(options, |txn| {
            let shard = shard.clone();
            let attempts = observed.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                txn.enlist("a").await?;
                txn.enqueue(&ShardId::from("a"), shard.write_op("row"))
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::PrepareFailed { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recover_reports_zero_without_durable_log() {
    let (_, coordinator) = setup(&[]);
    assert_eq!(coordinator.recover().await.unwrap(), 0);
}
