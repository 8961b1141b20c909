//! Core trait for write-path persistence.

use keyline_types::{EntryStorage, EpochInfo};

use crate::error::StoreError;
use crate::fanout::Subscription;

/// Durable persistence for admitted updates and sealed epochs, plus
/// notification channels for downstream consumers.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Every operation other than [`connect`](Self::connect) fails with
/// [`StoreError::Disconnected`] while the gateway is disconnected.
#[async_trait::async_trait]
pub trait StorageGateway: Send + Sync {
    /// Bring the gateway online. Idempotent.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Take the gateway offline and close every open subscription.
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Whether the gateway currently accepts operations.
    fn is_connected(&self) -> bool;

    /// Read the update stored under `sequence`. Returns `None` if absent.
    async fn read_update(&self, sequence: u64) -> Result<Option<EntryStorage>, StoreError>;

    /// Atomically store `record` under its sequence number and notify update
    /// subscribers.
    ///
    /// Each sequence is written once. Writing an identical record again
    /// succeeds without notifying; writing a different one fails with
    /// [`StoreError::Conflict`] and leaves the stored record in place.
    async fn write_update(&self, record: &EntryStorage) -> Result<(), StoreError>;

    /// Read the sealed epoch `epoch`. Returns `None` if absent.
    async fn read_epoch_info(&self, epoch: u64) -> Result<Option<EpochInfo>, StoreError>;

    /// Atomically store `info` under `epoch` and notify epoch subscribers.
    ///
    /// Write-once, like [`write_update`](Self::write_update).
    async fn write_epoch_info(&self, epoch: u64, info: &EpochInfo) -> Result<(), StoreError>;

    /// Receive every update persisted after this call.
    fn subscribe_updates(&self) -> Result<Subscription<EntryStorage>, StoreError>;

    /// Receive every epoch persisted after this call.
    fn subscribe_epoch_info(&self) -> Result<Subscription<EpochInfo>, StoreError>;
}
