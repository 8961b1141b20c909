//! Integration test: restarts over a durable fjall log.
//!
//! Each session opens the log, does some work and drops everything. The
//! next session must recover exactly what was acknowledged.

use std::path::Path;
use std::sync::Arc;

use keyline_builder::EpochBuilder;
use keyline_integration_tests::{Mirror, entry_update, identity, test_config};
use keyline_store::{FaultyGateway, FjallGateway, Operation, StorageGateway};

async fn open(path: &Path) -> EpochBuilder {
    let gateway = Arc::new(FjallGateway::open(path).unwrap());
    EpochBuilder::open(gateway, test_config()).await.unwrap()
}

#[tokio::test]
async fn test_sealed_chain_survives_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let mut sealed = Vec::new();

    for session in 0..3u64 {
        let builder = open(tmp.path()).await;
        assert_eq!(builder.state().await.open_epoch, session + 1);
        for i in 0..10 {
            let key = identity(session * 10 + i);
            builder.post(entry_update(&key, session)).await.unwrap();
        }
        // Rewrite a key from the first session.
        builder
            .post(entry_update(&identity(0), 100 + session))
            .await
            .unwrap();
        sealed.push(builder.seal().await.unwrap());
        builder.gateway().disconnect().await.unwrap();
    }

    let builder = open(tmp.path()).await;
    assert_eq!(&builder.last_sealed().await.unwrap(), sealed.last().unwrap());
    for info in &sealed {
        let snapshot = builder.sealed_epoch(info.epoch).await.unwrap();
        assert_eq!(snapshot.info(), info);
    }

    let mirror = Mirror::attach(builder.gateway().clone()).await;
    assert_eq!(mirror.last(), sealed.last().unwrap());
    assert_eq!(mirror.index().len(), 30);
    assert_eq!(
        mirror.index().get(&identity(0)),
        builder.lookup(&identity(0)).await.unwrap().as_deref()
    );
}

#[tokio::test]
async fn test_unsealed_tail_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();

    let root = {
        let builder = open(tmp.path()).await;
        for i in 0..7 {
            builder.post(entry_update(&identity(i), i)).await.unwrap();
        }
        builder.root().await.unwrap()
    };

    let sealed = {
        let builder = open(tmp.path()).await;
        let status = builder.state().await;
        assert_eq!(status.open_epoch, 1);
        assert_eq!(status.pending_updates, 7);
        assert_eq!(status.next_sequence, 8);
        assert_eq!(builder.root().await.unwrap(), root);
        builder.seal().await.unwrap()
    };
    assert_eq!(sealed.root, root);

    let builder = open(tmp.path()).await;
    assert_eq!(builder.last_sealed().await.unwrap(), sealed);
    assert_eq!(builder.state().await.pending_updates, 0);
}

/// A write whose acknowledgement was lost, followed by a seal and a
/// crash, is adopted by the next session and stays recoverable once it is
/// sealed.
#[tokio::test]
async fn test_unacknowledged_write_is_adopted_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let orphan = identity(99);

    {
        let fjall: Arc<dyn StorageGateway> = Arc::new(FjallGateway::open(tmp.path()).unwrap());
        let faults = Arc::new(FaultyGateway::new(fjall));
        let builder = EpochBuilder::open(faults.clone(), test_config()).await.unwrap();

        builder.post(entry_update(&identity(1), 1)).await.unwrap();
        faults.lose_ack_next(Operation::WriteUpdate, test_config().retry.max_attempts);
        assert!(builder.post(entry_update(&orphan, 1)).await.is_err());

        let sealed = builder.seal().await.unwrap();
        assert_eq!(sealed.last_sequence, 1);
    }

    let sealed = {
        let builder = open(tmp.path()).await;
        assert!(builder.lookup(&orphan).await.unwrap().is_some());
        let status = builder.state().await;
        assert_eq!(status.open_epoch, 2);
        assert_eq!(status.pending_updates, 1);

        // Written in epoch 1, sealed in epoch 2.
        let record = builder.gateway().read_update(2).await.unwrap().unwrap();
        assert_eq!(record.epoch, 1);
        builder.seal().await.unwrap()
    };

    let builder = open(tmp.path()).await;
    assert_eq!(builder.last_sealed().await.unwrap(), sealed);
    let snapshot = builder.sealed_epoch(2).await.unwrap();
    assert!(snapshot.lookup(&orphan).value().is_some());
}
