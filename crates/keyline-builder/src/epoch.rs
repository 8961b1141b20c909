//! Epoch lifecycle types.

use std::fmt;

use keyline_index::{IndexError, Lookup, Proof, SparseMerkleTree};
use keyline_types::{EpochInfo, IdentityKey};

/// Phase of the builder's epoch state machine.
///
/// ```text
/// Open ──seal()──► Sealing ──persisted──► Open (next epoch)
///                     │
///                     └── persist failed: stays Sealing until seal() succeeds
/// any ──close()──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochPhase {
    /// Admitting updates into the open epoch.
    Open,
    /// An `EpochInfo` has been computed and is being persisted. Updates
    /// are refused until it is durable.
    Sealing,
    /// The builder has been closed and holds no state.
    Closed,
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochPhase::Open => f.write_str("open"),
            EpochPhase::Sealing => f.write_str("sealing"),
            EpochPhase::Closed => f.write_str("closed"),
        }
    }
}

/// Point-in-time summary of an [`EpochBuilder`](crate::EpochBuilder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderStatus {
    /// Current phase.
    pub phase: EpochPhase,
    /// Epoch that admitted updates are assigned to.
    pub open_epoch: u64,
    /// Most recently sealed epoch number.
    pub last_sealed_epoch: u64,
    /// Sequence number the next admitted update will receive.
    pub next_sequence: u64,
    /// Updates admitted since the last seal.
    pub pending_updates: u64,
    /// Keys holding a value in the live index.
    pub index_len: usize,
}

/// A sealed epoch together with the frozen index it commits to.
pub struct SealedEpoch {
    info: EpochInfo,
    index: SparseMerkleTree,
}

impl SealedEpoch {
    pub(crate) fn new(info: EpochInfo, index: SparseMerkleTree) -> Self {
        Self { info, index }
    }

    /// The persisted epoch record.
    pub fn info(&self) -> &EpochInfo {
        &self.info
    }

    /// Value committed for `key` in this epoch.
    pub fn lookup(&self, key: &IdentityKey) -> Lookup<'_> {
        self.index.lookup(key)
    }

    /// Proof of presence or absence of `key` under this epoch's root.
    pub fn prove(&self, key: &IdentityKey) -> Proof {
        self.index.prove(key)
    }

    /// Proof that `key` is present in this epoch.
    pub fn prove_inclusion(&self, key: &IdentityKey) -> Result<Proof, IndexError> {
        self.index.prove_inclusion(key)
    }

    /// Proof that `key` is absent from this epoch.
    pub fn prove_exclusion(&self, key: &IdentityKey) -> Result<Proof, IndexError> {
        self.index.prove_exclusion(key)
    }

    /// Number of keys committed in this epoch.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether this epoch commits no keys.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl fmt::Debug for SealedEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedEpoch")
            .field("epoch", &self.info.epoch)
            .field("root", &self.info.root)
            .field("keys", &self.index.len())
            .finish()
    }
}
