//! Integration test: write path end to end.
//!
//! Updates flow through validation, admission and sealing while a mirror
//! rebuilds the index from the gateway's subscription streams and checks
//! every sealed root.

use std::collections::BTreeMap;
use std::sync::Arc;

use keyline_builder::{Ed25519Authorizer, EpochBuilder, StatusCode, status_of};
use keyline_integration_tests::{
    Mirror, TestLog, entry_update, identity, post_until_admitted, signed_update, signing_key,
};
use keyline_types::{Entry, IdentityKey};

/// Five epochs of overlapping writes. The mirror agrees with every sealed
/// root, and every committed key proves against the builder's snapshots.
#[tokio::test]
async fn test_mirror_reproduces_every_epoch() {
    let log = TestLog::new();
    let builder = log.open().await;
    let mut mirror = Mirror::attach(log.gateway()).await;

    let mut model: BTreeMap<IdentityKey, Vec<u8>> = BTreeMap::new();
    let mut version = 0;

    for epoch in 1..=5u64 {
        for _ in 0..20 {
            version += 1;
            let key = identity(version % 30);
            let update = entry_update(&key, version);
            model.insert(key, update.new_entry.clone());
            builder.post(update).await.unwrap();
        }

        let sealed = builder.seal().await.unwrap();
        assert_eq!(sealed.epoch, epoch);
        assert_eq!(mirror.next_epoch().await, Some(sealed.clone()));
        assert_eq!(mirror.index().len(), model.len());

        let snapshot = builder.sealed_epoch(epoch).await.unwrap();
        for (key, value) in &model {
            assert_eq!(mirror.index().get(key), Some(value.as_slice()));
            snapshot
                .prove(key)
                .verify_inclusion(&sealed.root, value)
                .unwrap();
        }
        snapshot
            .prove(&identity(10_000))
            .verify_exclusion(&sealed.root)
            .unwrap();
    }

    assert_eq!(mirror.last().last_sequence, 100);
    assert_eq!(mirror.fetched(), 0);
}

/// A mirror attached after several seals replays them from the log.
#[tokio::test]
async fn test_late_mirror_catches_up() {
    let log = TestLog::new();
    let builder = log.open().await;

    for i in 0..12 {
        builder.post(entry_update(&identity(i), i)).await.unwrap();
        if i % 4 == 3 {
            builder.seal().await.unwrap();
        }
    }

    let mut mirror = Mirror::attach(log.gateway()).await;
    assert_eq!(mirror.last().epoch, 3);
    assert_eq!(mirror.fetched(), 12);

    builder.post(entry_update(&identity(99), 0)).await.unwrap();
    let sealed = builder.seal().await.unwrap();
    assert_eq!(mirror.next_epoch().await, Some(sealed));
    assert_eq!(mirror.fetched(), 12);
}

/// A mirror that falls behind loses buffered updates, never blocks
/// admission, and fills the gap from the durable log.
#[tokio::test]
async fn test_slow_mirror_fills_gaps_from_log() {
    let log = TestLog::with_capacity(4);
    let builder = log.open().await;
    let mut mirror = Mirror::attach(log.gateway()).await;

    for i in 0..50 {
        builder.post(entry_update(&identity(i), i)).await.unwrap();
    }
    let sealed = builder.seal().await.unwrap();

    assert_eq!(mirror.next_epoch().await, Some(sealed));
    assert_eq!(mirror.dropped(), 46);
    assert_eq!(mirror.fetched(), 46);
    assert_eq!(mirror.index().len(), 50);
}

/// Ownership of an identity moves between keys; only the current owner can
/// update it.
#[tokio::test]
async fn test_signed_ownership_handoff() {
    let log = TestLog::new();
    let builder = log.open_with(Arc::new(Ed25519Authorizer)).await;
    let mut mirror = Mirror::attach(log.gateway()).await;

    let key = identity(1);
    let alice = signing_key(1);
    let bob = signing_key(2);
    let mallory = signing_key(3);

    // A new identity is claimed by a key it lists itself.
    builder
        .post(signed_update(&key, 1, &alice, &alice))
        .await
        .unwrap();

    // Nobody else can take it over.
    let result = builder.post(signed_update(&key, 2, &mallory, &mallory)).await;
    assert_eq!(status_of(&result), StatusCode::PermissionDenied);

    // Alice hands it to Bob, after which only Bob may update.
    builder
        .post(signed_update(&key, 2, &alice, &bob))
        .await
        .unwrap();
    let result = builder.post(signed_update(&key, 3, &alice, &alice)).await;
    assert_eq!(status_of(&result), StatusCode::PermissionDenied);
    builder.post(signed_update(&key, 3, &bob, &bob)).await.unwrap();

    // An unsigned update is refused outright.
    let result = builder.post(entry_update(&identity(2), 1)).await;
    assert_eq!(status_of(&result), StatusCode::PermissionDenied);

    let sealed = builder.seal().await.unwrap();
    assert_eq!(sealed.update_count, 3);
    mirror.next_epoch().await.unwrap();

    let committed = Entry::decode(mirror.index().get(&key).unwrap()).unwrap();
    assert_eq!(committed.update_count, 3);
    assert_eq!(committed.authorized_keys, vec![bob.verifying_key().to_bytes()]);
}

/// Rejected submissions never reach the log.
#[tokio::test]
async fn test_malformed_updates_are_not_logged() {
    let log = TestLog::new();
    let builder = log.open().await;

    let short = keyline_types::SignedEntryUpdate::unsigned(Entry::new(vec![7u8; 16]).encode());
    assert_eq!(
        status_of(&builder.post(short).await),
        StatusCode::InvalidArgument
    );

    let garbage = keyline_types::SignedEntryUpdate::unsigned(vec![0xff, 0x00, 0x01]);
    assert_eq!(status_of(&builder.post(garbage).await), StatusCode::Internal);

    assert_eq!(log.store.update_count(), 0);
    let record = builder.post(entry_update(&identity(0), 0)).await.unwrap();
    assert_eq!(record.sequence, 1);
}

/// Concurrent writers race the background sealer. The sealed chain
/// replays to the same index the builder holds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_with_background_sealer() {
    let log = TestLog::new();
    let builder: Arc<EpochBuilder> = Arc::new(log.open().await);
    builder.spawn_sealer();

    let mut writers = Vec::new();
    for writer in 0..4u64 {
        let builder = builder.clone();
        writers.push(tokio::spawn(async move {
            let mut sequences = Vec::new();
            for i in 0..25 {
                let key = identity(writer * 1_000 + i);
                let record = post_until_admitted(&builder, entry_update(&key, i)).await;
                sequences.push(record.sequence);
                if i % 5 == 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(3)).await;
                }
            }
            sequences
        }));
    }

    let mut sequences = Vec::new();
    for writer in writers {
        sequences.extend(writer.await.unwrap());
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=100).collect::<Vec<_>>());

    let last = builder.seal().await.unwrap();
    builder.close().await;
    assert_eq!(last.last_sequence, 100);

    let mirror = Mirror::attach(log.gateway()).await;
    assert_eq!(mirror.last(), &last);
    assert_eq!(mirror.index().len(), 100);
}
