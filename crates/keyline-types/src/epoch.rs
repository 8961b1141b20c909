//! Sealed epoch records.

use serde::{Deserialize, Serialize};

use crate::Digest;

/// Sequence number of the first epoch. Genesis holds the empty index.
pub const GENESIS_EPOCH: u64 = 0;

/// Domain tag mixed into every epoch digest.
const EPOCH_DIGEST_TAG: &[u8] = b"keyline/epoch/v1";

/// Immutable snapshot of the identity index at seal time.
///
/// Epochs are hash-chained: `previous` is the [`EpochInfo::digest`] of the
/// epoch immediately before this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    /// Epoch sequence number.
    pub epoch: u64,
    /// Root digest of the identity index at seal time.
    pub root: Digest,
    /// Digest of the preceding epoch ([`Digest::ZERO`] for genesis).
    pub previous: Digest,
    /// First update sequence included in this epoch.
    pub first_sequence: u64,
    /// Last update sequence included in this epoch (0 for genesis).
    pub last_sequence: u64,
    /// Number of updates admitted during this epoch.
    pub update_count: u64,
    /// Seal time in unix milliseconds.
    pub sealed_at: u64,
}

#[derive(Serialize)]
struct HashableEpoch<'a> {
    tag: &'a [u8],
    info: &'a EpochInfo,
}

impl EpochInfo {
    /// Build the genesis epoch for an index whose empty root is `empty_root`.
    pub fn genesis(empty_root: Digest) -> Self {
        Self {
            epoch: GENESIS_EPOCH,
            root: empty_root,
            previous: Digest::ZERO,
            first_sequence: 1,
            last_sequence: 0,
            update_count: 0,
            sealed_at: 0,
        }
    }

    /// Digest of this record, used as the next epoch's `previous` link.
    pub fn digest(&self) -> Digest {
        let content = HashableEpoch {
            tag: EPOCH_DIGEST_TAG,
            info: self,
        };
        let bytes = postcard::to_allocvec(&content).expect("serialization should not fail");
        Digest::from_data(&bytes)
    }

    /// Whether this record directly follows `prior` in the hash chain.
    pub fn follows(&self, prior: &EpochInfo) -> bool {
        self.epoch == prior.epoch + 1 && self.previous == prior.digest()
    }

    /// Same content apart from the seal timestamp.
    pub fn same_content(&self, other: &EpochInfo) -> bool {
        Self {
            sealed_at: 0,
            ..self.clone()
        } == Self {
            sealed_at: 0,
            ..other.clone()
        }
    }
}
