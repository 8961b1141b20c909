//! Shared test harness for Keyline integration tests.
//!
//! Provides [`TestLog`], an in-memory log behind a fault-injecting gateway,
//! and [`Mirror`], an independent consumer that rebuilds the identity index
//! from the gateway's subscription streams and checks every sealed root
//! against its own replay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use keyline_builder::{
    AllowAll, BuilderConfig, EpochBuilder, RetryPolicy, UpdateAuthorizer, validate,
};
use keyline_index::SparseMerkleTree;
use keyline_store::{FaultyGateway, MemoryGateway, StorageGateway, Subscription};
use keyline_types::{
    Entry, EntryStorage, EpochInfo, GENESIS_EPOCH, IdentityKey, SignedEntryUpdate,
};

// =========================================================================
// Fixtures
// =========================================================================

/// Deterministic 32-byte identity key from a seed.
pub fn identity(seed: u64) -> IdentityKey {
    IdentityKey::from(*blake3::hash(&seed.to_be_bytes()).as_bytes())
}

/// Unsigned update binding `key` to a commitment derived from `version`.
pub fn entry_update(key: &IdentityKey, version: u64) -> SignedEntryUpdate {
    let mut entry = Entry::new(key.as_bytes().to_vec());
    entry.commitment = format!("commitment-{version}").into_bytes();
    entry.update_count = version;
    SignedEntryUpdate::unsigned(entry.encode())
}

/// Update for `key` signed by `signer`, handing control to `next_owner`.
pub fn signed_update(
    key: &IdentityKey,
    version: u64,
    signer: &SigningKey,
    next_owner: &SigningKey,
) -> SignedEntryUpdate {
    let mut entry = Entry::new(key.as_bytes().to_vec());
    entry.commitment = format!("commitment-{version}").into_bytes();
    entry.update_count = version;
    entry.authorized_keys = vec![next_owner.verifying_key().to_bytes()];

    let bytes = entry.encode();
    let signature = signer.sign(&bytes);
    SignedEntryUpdate::unsigned(bytes).with_signature(
        signer.verifying_key().to_bytes(),
        signature.to_bytes().to_vec(),
    )
}

/// Deterministic signing key from a one-byte seed.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Builder config with millisecond backoff and short deadlines.
pub fn test_config() -> BuilderConfig {
    BuilderConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        storage_deadline: Duration::from_millis(100),
        seal_interval: Duration::from_millis(20),
        retained_epochs: 16,
    }
}

/// Post `update`, retrying while an epoch is being sealed.
pub async fn post_until_admitted(
    builder: &EpochBuilder,
    update: SignedEntryUpdate,
) -> EntryStorage {
    loop {
        match builder.post(update.clone()).await {
            Ok(record) => return record,
            Err(keyline_builder::BuilderError::EpochSealing { .. }) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => panic!("post failed: {e}"),
        }
    }
}

// =========================================================================
// TestLog
// =========================================================================

/// An in-memory log reached through a [`FaultyGateway`].
///
/// The memory store outlives any builder opened over it, so dropping a
/// builder and opening another one simulates a process restart.
pub struct TestLog {
    pub store: Arc<MemoryGateway>,
    pub faults: Arc<FaultyGateway>,
}

impl TestLog {
    pub fn new() -> Self {
        Self::with_store(MemoryGateway::new())
    }

    /// A log whose subscribers buffer at most `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_store(MemoryGateway::with_capacity(capacity))
    }

    fn with_store(store: MemoryGateway) -> Self {
        let store = Arc::new(store);
        let faults = Arc::new(FaultyGateway::new(store.clone()));
        Self { store, faults }
    }

    /// The fault-injecting gateway as a trait object.
    pub fn gateway(&self) -> Arc<dyn StorageGateway> {
        self.faults.clone()
    }

    /// Open a builder that accepts every valid update.
    pub async fn open(&self) -> EpochBuilder {
        self.open_with(Arc::new(AllowAll)).await
    }

    /// Open a builder with the given authorizer.
    pub async fn open_with(&self, authorizer: Arc<dyn UpdateAuthorizer>) -> EpochBuilder {
        EpochBuilder::recover(self.gateway(), authorizer, test_config())
            .await
            .expect("recovery should succeed")
    }
}

impl Default for TestLog {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Mirror
// =========================================================================

/// Independent replica of the identity index fed by gateway subscriptions.
///
/// Updates are buffered by sequence until the epoch that seals them
/// arrives. Updates the fan-out dropped are read back from the gateway.
pub struct Mirror {
    gateway: Arc<dyn StorageGateway>,
    updates: Subscription<EntryStorage>,
    epochs: Subscription<EpochInfo>,
    buffered: BTreeMap<u64, EntryStorage>,
    index: SparseMerkleTree,
    last: EpochInfo,
    fetched: u64,
}

impl Mirror {
    /// Subscribe to `gateway`, then catch up on every epoch sealed so far.
    pub async fn attach(gateway: Arc<dyn StorageGateway>) -> Self {
        let updates = gateway.subscribe_updates().expect("gateway is connected");
        let epochs = gateway
            .subscribe_epoch_info()
            .expect("gateway is connected");
        let genesis = gateway
            .read_epoch_info(GENESIS_EPOCH)
            .await
            .unwrap()
            .expect("genesis epoch is written on open");

        let mut mirror = Self {
            gateway,
            updates,
            epochs,
            buffered: BTreeMap::new(),
            index: SparseMerkleTree::new(),
            last: genesis,
            fetched: 0,
        };

        while let Some(info) = mirror
            .gateway
            .read_epoch_info(mirror.last.epoch + 1)
            .await
            .unwrap()
        {
            mirror.apply(info).await;
        }
        mirror
    }

    /// Wait for the next newly sealed epoch and verify it.
    ///
    /// Republished copies of an already verified epoch are skipped. Returns
    /// `None` once the gateway disconnects.
    pub async fn next_epoch(&mut self) -> Option<EpochInfo> {
        loop {
            let info = self.epochs.recv().await?;
            if info.epoch <= self.last.epoch {
                if info.epoch == self.last.epoch {
                    assert_eq!(info, self.last, "epoch {} republished differently", info.epoch);
                }
                continue;
            }
            self.apply(info.clone()).await;
            return Some(info);
        }
    }

    async fn apply(&mut self, info: EpochInfo) {
        assert!(
            info.follows(&self.last),
            "epoch {} does not follow epoch {}",
            info.epoch,
            self.last.epoch
        );

        while let Ok(record) = self.updates.try_recv() {
            self.buffered.insert(record.sequence, record);
        }

        for sequence in info.first_sequence..=info.last_sequence {
            let record = match self.buffered.remove(&sequence) {
                Some(record) => record,
                None => {
                    self.fetched += 1;
                    self.gateway
                        .read_update(sequence)
                        .await
                        .unwrap()
                        .unwrap_or_else(|| panic!("sealed update {sequence} is missing"))
                }
            };
            assert_eq!(record.sequence, sequence);
            let validated = validate(&record.update).expect("sealed updates are valid");
            self.index.insert(validated.key, validated.value);
        }
        self.buffered = self.buffered.split_off(&(info.last_sequence + 1));

        assert_eq!(
            self.index.root(),
            info.root,
            "replayed root differs for epoch {}",
            info.epoch
        );
        self.last = info;
    }

    /// Last verified epoch.
    pub fn last(&self) -> &EpochInfo {
        &self.last
    }

    /// The replica index as of [`last`](Self::last).
    pub fn index(&self) -> &SparseMerkleTree {
        &self.index
    }

    /// Updates that had to be read back from the gateway.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Updates the fan-out dropped for this mirror.
    pub fn dropped(&self) -> u64 {
        self.updates.dropped()
    }
}
