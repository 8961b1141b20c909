//! Shared test utilities for keyline-builder tests.

use std::sync::Arc;
use std::time::Duration;

use keyline_store::{FaultyGateway, MemoryGateway, StorageGateway};
use keyline_types::{Entry, IdentityKey, SignedEntryUpdate};

use crate::builder::EpochBuilder;
use crate::config::{BuilderConfig, RetryPolicy};

/// Deterministic 32-byte identity key from a seed.
pub fn test_key(seed: u64) -> IdentityKey {
    IdentityKey::from(*blake3::hash(&seed.to_le_bytes()).as_bytes())
}

/// Encoded entry bound to `key` with a commitment derived from `version`.
pub fn entry_bytes(key: &IdentityKey, version: u64) -> Vec<u8> {
    Entry {
        index: key.as_bytes().to_vec(),
        commitment: format!("pk-{version}").into_bytes(),
        authorized_keys: Vec::new(),
        update_count: version,
    }
    .encode()
}

/// Unsigned update binding `key` to version `version`.
pub fn update_for(key: &IdentityKey, version: u64) -> SignedEntryUpdate {
    SignedEntryUpdate::unsigned(entry_bytes(key, version))
}

/// Config with millisecond backoff and short deadlines.
pub fn fast_config() -> BuilderConfig {
    BuilderConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        storage_deadline: Duration::from_millis(200),
        seal_interval: Duration::from_millis(50),
        retained_epochs: 16,
    }
}

/// Builder over a fresh in-memory gateway.
pub async fn memory_builder() -> (Arc<MemoryGateway>, EpochBuilder) {
    let gateway = Arc::new(MemoryGateway::new());
    let builder = EpochBuilder::open(gateway.clone(), fast_config())
        .await
        .unwrap();
    (gateway, builder)
}

/// Builder over a fault-injecting wrapper around an in-memory gateway.
pub async fn faulty_builder() -> (Arc<MemoryGateway>, Arc<FaultyGateway>, EpochBuilder) {
    faulty_builder_with(fast_config()).await
}

/// Like [`faulty_builder`], with a caller-supplied config.
pub async fn faulty_builder_with(
    config: BuilderConfig,
) -> (Arc<MemoryGateway>, Arc<FaultyGateway>, EpochBuilder) {
    let inner = Arc::new(MemoryGateway::new());
    let faulty = Arc::new(FaultyGateway::new(inner.clone()));
    let gateway: Arc<dyn StorageGateway> = faulty.clone();
    let builder = EpochBuilder::open(gateway, config).await.unwrap();
    (inner, faulty, builder)
}

/// Config that gives up on the first attempt after 50ms.
pub fn impatient_config() -> BuilderConfig {
    BuilderConfig {
        retry: RetryPolicy::no_retry(),
        storage_deadline: Duration::from_millis(50),
        ..fast_config()
    }
}
