//! Integration test: storage faults.
//!
//! Transient failures, outages, hangs and lost acknowledgements injected
//! between the builder and the log.

use std::sync::Arc;
use std::time::Duration;

use keyline_builder::{
    AllowAll, BuilderConfig, EpochBuilder, EpochPhase, RetryPolicy, StatusCode, status_of,
};
use keyline_integration_tests::{Mirror, TestLog, entry_update, identity, test_config};
use keyline_store::{Operation, StorageGateway};

#[tokio::test]
async fn test_transient_write_failures_are_absorbed() {
    let log = TestLog::new();
    let builder = log.open().await;

    for i in 0..10 {
        log.faults.fail_next(Operation::WriteUpdate, 2);
        let record = builder.post(entry_update(&identity(i), i)).await.unwrap();
        assert_eq!(record.sequence, i + 1);
    }

    assert_eq!(log.faults.calls(Operation::WriteUpdate), 30);
    assert_eq!(log.store.update_count(), 10);
}

#[tokio::test]
async fn test_epoch_outage_blocks_admission_until_healed() {
    let log = TestLog::new();
    let builder = log.open().await;

    for i in 0..5 {
        builder.post(entry_update(&identity(i), i)).await.unwrap();
    }

    log.faults.fail_always(Operation::WriteEpochInfo);
    let result = builder.seal().await;
    assert_eq!(status_of(&result), StatusCode::Unavailable);

    let status = builder.state().await;
    assert_eq!(status.phase, EpochPhase::Sealing);
    let pending = builder.pending_seal().await.unwrap();
    assert_eq!(pending.epoch, 1);

    let result = builder.post(entry_update(&identity(10), 0)).await;
    assert_eq!(status_of(&result), StatusCode::Unavailable);

    log.faults.heal(Operation::WriteEpochInfo);
    let sealed = builder.seal().await.unwrap();
    assert_eq!(sealed, pending);
    assert_eq!(sealed.update_count, 5);

    let record = builder.post(entry_update(&identity(10), 0)).await.unwrap();
    assert_eq!((record.sequence, record.epoch), (6, 2));
}

#[tokio::test]
async fn test_lost_epoch_ack_is_retried_to_the_same_record() {
    let log = TestLog::new();
    let builder = log.open().await;
    let mut mirror = Mirror::attach(log.gateway()).await;

    builder.post(entry_update(&identity(1), 1)).await.unwrap();
    log.faults.lose_ack_next(Operation::WriteEpochInfo, 1);
    let first = builder.seal().await.unwrap();
    assert_eq!(log.faults.calls(Operation::WriteEpochInfo), 3);
    assert_eq!(log.store.epoch_count(), 2);

    builder.post(entry_update(&identity(2), 1)).await.unwrap();
    let second = builder.seal().await.unwrap();

    // The duplicate publication of epoch 1 is skipped.
    assert_eq!(mirror.next_epoch().await, Some(first));
    assert_eq!(mirror.next_epoch().await, Some(second));
}

#[tokio::test]
async fn test_lost_update_ack_is_adopted_by_next_post() {
    let log = TestLog::new();
    let builder = log.open().await;

    let orphan = identity(1);
    log.faults
        .lose_ack_next(Operation::WriteUpdate, test_config().retry.max_attempts);
    let result = builder.post(entry_update(&orphan, 1)).await;
    assert_eq!(status_of(&result), StatusCode::Unavailable);

    // The write landed but was never admitted.
    let stored = log.store.read_update(1).await.unwrap().unwrap();
    assert_eq!(builder.lookup(&orphan).await.unwrap(), None);
    assert_eq!(builder.state().await.next_sequence, 1);

    let admitted = identity(2);
    let record = builder.post(entry_update(&admitted, 1)).await.unwrap();
    assert_eq!(record.sequence, 2);
    assert_eq!(log.store.read_update(1).await.unwrap(), Some(stored));
    assert_eq!(log.store.read_update(2).await.unwrap(), Some(record));

    builder.seal().await.unwrap();
    let mirror = Mirror::attach(log.gateway()).await;
    assert!(mirror.index().contains(&admitted));
    assert!(mirror.index().contains(&orphan));
}

/// A write that times out and reaches storage after the next post took its
/// sequence is refused, so the log keeps matching every sealed root.
#[tokio::test]
async fn test_late_write_after_timeout_keeps_log_consistent() {
    let log = TestLog::new();
    let config = BuilderConfig {
        retry: RetryPolicy::no_retry(),
        storage_deadline: Duration::from_millis(50),
        ..test_config()
    };
    let builder = EpochBuilder::open(log.gateway(), config).await.unwrap();
    let mut mirror = Mirror::attach(log.gateway()).await;

    log.faults
        .land_late_next(Operation::WriteUpdate, 1, Duration::from_millis(200));
    let late = builder.post(entry_update(&identity(1), 1)).await;
    assert_eq!(status_of(&late), StatusCode::Unavailable);

    for i in 2..6 {
        builder.post(entry_update(&identity(i), 1)).await.unwrap();
    }
    let first = builder.seal().await.unwrap();
    assert_eq!((first.first_sequence, first.last_sequence), (1, 4));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(log.store.update_count(), 4);
    assert_eq!(mirror.next_epoch().await, Some(first.clone()));
    assert!(!mirror.index().contains(&identity(1)));
    drop(builder);

    let builder = log.open().await;
    assert_eq!(builder.last_sealed().await.unwrap(), first);
}

#[tokio::test]
async fn test_hung_storage_fails_within_deadline() {
    let log = TestLog::new();
    let builder = log.open().await;

    log.faults.hang(Operation::WriteUpdate);
    let started = tokio::time::Instant::now();
    let result = builder.post(entry_update(&identity(1), 1)).await;
    assert_eq!(status_of(&result), StatusCode::Unavailable);

    let config = test_config();
    assert!(started.elapsed() >= config.storage_deadline * config.retry.max_attempts);
    assert_eq!(log.store.update_count(), 0);

    log.faults.heal_all();
    let record = builder.post(entry_update(&identity(1), 1)).await.unwrap();
    assert_eq!(record.sequence, 1);
}

#[tokio::test]
async fn test_crash_during_seal_recovers_open_epoch() {
    let log = TestLog::new();
    {
        let builder = log.open().await;
        for i in 0..3 {
            builder.post(entry_update(&identity(i), i)).await.unwrap();
        }
        log.faults.fail_always(Operation::WriteEpochInfo);
        assert!(builder.seal().await.is_err());
    }
    log.faults.heal_all();

    let builder = log.open().await;
    let status = builder.state().await;
    assert_eq!(status.phase, EpochPhase::Open);
    assert_eq!(status.open_epoch, 1);
    assert_eq!(status.pending_updates, 3);
    assert_eq!(builder.pending_seal().await, None);

    let sealed = builder.seal().await.unwrap();
    assert_eq!((sealed.epoch, sealed.last_sequence), (1, 3));
}

#[tokio::test]
async fn test_recovery_retries_and_reports_read_outages() {
    let log = TestLog::new();
    {
        let builder = log.open().await;
        for i in 0..4 {
            builder.post(entry_update(&identity(i), i)).await.unwrap();
        }
        builder.seal().await.unwrap();
    }

    // Transient read failures are retried.
    log.faults.fail_next(Operation::ReadEpochInfo, 2);
    log.faults.fail_next(Operation::ReadUpdate, 2);
    let builder = log.open().await;
    assert_eq!(builder.last_sealed().await.unwrap().epoch, 1);
    drop(builder);

    // An outage fails recovery as retryable.
    log.faults.fail_always(Operation::ReadUpdate);
    let result = EpochBuilder::recover(log.gateway(), Arc::new(AllowAll), test_config()).await;
    assert_eq!(status_of(&result), StatusCode::Unavailable);
}
