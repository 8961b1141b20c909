//! [`StorageGateway`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use keyline_types::{EntryStorage, EpochInfo};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fanout::{DEFAULT_SUBSCRIBER_CAPACITY, Fanout, Subscription};
use crate::traits::StorageGateway;

/// Durable gateway backed by Fjall.
///
/// Records are postcard-encoded and keyed by their sequence or epoch number
/// as 8 big-endian bytes, so keyspace order is numeric order. A write is
/// acknowledged only after the journal is synced to disk.
pub struct FjallGateway {
    db: Database,
    /// sequence (8 bytes BE) → serialized EntryStorage.
    updates: Keyspace,
    /// epoch (8 bytes BE) → serialized EpochInfo.
    epochs: Keyspace,
    connected: AtomicBool,
    /// Serialises the check-then-insert of write-once records.
    write_lock: Mutex<()>,
    update_stream: Fanout<EntryStorage>,
    epoch_stream: Fanout<EpochInfo>,
    /// Keeps the directory of a temporary gateway alive.
    _tmp: Option<TempDir>,
}

impl FjallGateway {
    /// Open a persistent gateway at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Open a persistent gateway whose subscribers buffer `capacity` items.
    pub fn open_with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::builder(path).open()?;
        info!(path = %path.display(), "opened fjall gateway");
        Self::init_keyspaces(db, capacity, None)
    }

    /// Open a temporary gateway that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, DEFAULT_SUBSCRIBER_CAPACITY, Some(tmp))
    }

    fn init_keyspaces(db: Database, capacity: usize, tmp: Option<TempDir>) -> Result<Self, StoreError> {
        let updates = db.keyspace("updates", KeyspaceCreateOptions::default)?;
        let epochs = db.keyspace("epochs", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            updates,
            epochs,
            connected: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            update_stream: Fanout::new("updates", capacity),
            epoch_stream: Fanout::new("epochs", capacity),
            _tmp: tmp,
        })
    }

    /// Insert `value` under `key` in `keyspace` unless a record is already
    /// there, then sync the journal. Returns whether it was inserted.
    fn insert_once(&self, keyspace: &Keyspace, key: u64, value: &[u8]) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let key_bytes = key.to_be_bytes();

        if let Some(stored) = keyspace.get(key_bytes.as_slice())? {
            return if &*stored == value {
                Ok(false)
            } else {
                Err(StoreError::Conflict(key))
            };
        }

        keyspace.insert(key_bytes.as_slice(), value)?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(true)
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

#[async_trait::async_trait]
impl StorageGateway for FjallGateway {
    async fn connect(&self) -> Result<(), StoreError> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!("fjall gateway connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.update_stream.close();
            self.epoch_stream.close();
            debug!("fjall gateway disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read_update(&self, sequence: u64) -> Result<Option<EntryStorage>, StoreError> {
        self.ensure_connected()?;
        let key = sequence.to_be_bytes();
        let Some(bytes) = self.updates.get(key.as_slice())? else {
            return Ok(None);
        };

        let record: EntryStorage = postcard::from_bytes(&bytes)?;
        if record.sequence != sequence {
            return Err(StoreError::Corrupt(format!(
                "update {} stored under sequence {sequence}",
                record.sequence
            )));
        }
        Ok(Some(record))
    }

    async fn write_update(&self, record: &EntryStorage) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let value = postcard::to_allocvec(record)?;
        if !self.insert_once(&self.updates, record.sequence, &value)? {
            debug!(sequence = record.sequence, "update already stored");
            return Ok(());
        }
        debug!(sequence = record.sequence, epoch = record.epoch, "stored update");
        self.update_stream.publish(record);
        Ok(())
    }

    async fn read_epoch_info(&self, epoch: u64) -> Result<Option<EpochInfo>, StoreError> {
        self.ensure_connected()?;
        let key = epoch.to_be_bytes();
        let Some(bytes) = self.epochs.get(key.as_slice())? else {
            return Ok(None);
        };

        let info: EpochInfo = postcard::from_bytes(&bytes)?;
        if info.epoch != epoch {
            return Err(StoreError::Corrupt(format!(
                "epoch record {} stored under key {epoch}",
                info.epoch
            )));
        }
        Ok(Some(info))
    }

    async fn write_epoch_info(&self, epoch: u64, info: &EpochInfo) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if info.epoch != epoch {
            return Err(StoreError::Corrupt(format!(
                "epoch record {} written under key {epoch}",
                info.epoch
            )));
        }
        let value = postcard::to_allocvec(info)?;
        if !self.insert_once(&self.epochs, epoch, &value)? {
            debug!(epoch, "epoch already stored");
            return Ok(());
        }
        debug!(epoch, root = %info.root, "stored epoch");
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
