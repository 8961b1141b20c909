//! In-memory storage gateway.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use keyline_types::{EntryStorage, EpochInfo};
use tracing::debug;

use crate::error::StoreError;
use crate::fanout::{DEFAULT_SUBSCRIBER_CAPACITY, Fanout, Subscription};
use crate::traits::StorageGateway;

/// Gateway backed by two `RwLock<BTreeMap>`s.
///
/// Useful for tests and for nodes configured to run in memory-only mode.
/// Starts disconnected.
pub struct MemoryGateway {
    connected: AtomicBool,
    updates: RwLock<BTreeMap<u64, EntryStorage>>,
    epochs: RwLock<BTreeMap<u64, EpochInfo>>,
    update_stream: Fanout<EntryStorage>,
    epoch_stream: Fanout<EpochInfo>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Create an empty gateway with the default subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create an empty gateway whose subscribers buffer `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            updates: RwLock::new(BTreeMap::new()),
            epochs: RwLock::new(BTreeMap::new()),
            update_stream: Fanout::new("updates", capacity),
            epoch_stream: Fanout::new("epochs", capacity),
        }
    }

    /// Number of stored updates.
    pub fn update_count(&self) -> usize {
        self.updates.read().expect("lock poisoned").len()
    }

    /// Number of stored epochs.
    pub fn epoch_count(&self) -> usize {
        self.epochs.read().expect("lock poisoned").len()
    }

    /// Overwrite a stored update without publishing it (for testing purposes).
    #[doc(hidden)]
    pub fn tamper_update(&self, record: EntryStorage) {
        self.updates
            .write()
            .expect("lock poisoned")
            .insert(record.sequence, record);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

/// Store `value` under `key` unless something is already there. Returns
/// whether it was inserted; an identical stored value is not an error.
fn insert_once<V: Clone + PartialEq>(
    map: &RwLock<BTreeMap<u64, V>>,
    key: u64,
    value: &V,
) -> Result<bool, StoreError> {
    match map.write().expect("lock poisoned").entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            Ok(true)
        }
        Entry::Occupied(stored) if stored.get() == value => Ok(false),
        Entry::Occupied(_) => Err(StoreError::Conflict(key)),
    }
}

#[async_trait::async_trait]
impl StorageGateway for MemoryGateway {
    async fn connect(&self) -> Result<(), StoreError> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!("memory gateway connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.update_stream.close();
            self.epoch_stream.close();
            debug!("memory gateway disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read_update(&self, sequence: u64) -> Result<Option<EntryStorage>, StoreError> {
        self.ensure_connected()?;
        let map = self.updates.read().expect("lock poisoned");
        Ok(map.get(&sequence).cloned())
    }

    async fn write_update(&self, record: &EntryStorage) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if !insert_once(&self.updates, record.sequence, record)? {
            debug!(sequence = record.sequence, "update already stored");
            return Ok(());
        }
        debug!(sequence = record.sequence, epoch = record.epoch, "stored update in memory");
        self.update_stream.publish(record);
        Ok(())
    }

    async fn read_epoch_info(&self, epoch: u64) -> Result<Option<EpochInfo>, StoreError> {
        self.ensure_connected()?;
        let map = self.epochs.read().expect("lock poisoned");
        Ok(map.get(&epoch).cloned())
    }

    async fn write_epoch_info(&self, epoch: u64, info: &EpochInfo) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if info.epoch != epoch {
            return Err(StoreError::Corrupt(format!(
                "epoch record {} written under key {epoch}",
                info.epoch
            )));
        }
        if !insert_once(&self.epochs, epoch, info)? {
            debug!(epoch, "epoch already stored");
            return Ok(());
        }
        debug!(epoch, root = %info.root, "stored epoch in memory");
        self.epoch_stream.publish(info);
        Ok(())
    }

    fn subscribe_updates(&self) -> Result<Subscription<EntryStorage>, StoreError> {
        self.ensure_connected()?;
        Ok(self.update_stream.subscribe())
    }

    fn subscribe_epoch_info(&self) -> Result<Subscription<EpochInfo>, StoreError> {
        self.ensure_connected()?;
        Ok(self.epoch_stream.subscribe())
    }
}
