//! Shared types and identifiers for Keyline.
//!
//! This crate defines the records that flow through the write path of the
//! key-transparency log: fixed-size identifiers ([`IdentityKey`], [`Digest`]),
//! the directory payload ([`Entry`]) and its signed wrapper
//! ([`SignedEntryUpdate`]), the durable log record ([`EntryStorage`]), and the
//! sealed epoch snapshot ([`EpochInfo`]).

use std::fmt;

use serde::{Deserialize, Serialize};

mod entry;
mod epoch;
mod error;

pub use entry::{ENTRY_FORMAT_VERSION, Entry, EntryStorage, SignedEntryUpdate, UpdateSignature};
pub use epoch::{EpochInfo, GENESIS_EPOCH};
pub use error::DecodeError;

/// Required length of an identity key in bytes.
pub const IDENTITY_KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; 32] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// A blake3 digest: node hashes, root digests, epoch digests.
    Digest
);

define_id!(
    /// Fixed-length identifier of a directory entry (e.g. a user identifier digest).
    ///
    /// Keys arrive on the wire as variable-length bytes inside an [`Entry`];
    /// they only become an `IdentityKey` once their length has been checked.
    IdentityKey
);

impl Digest {
    /// The all-zero digest, used as the `previous` link of the genesis epoch.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Hash arbitrary data with blake3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.into())
    }
}

impl IdentityKey {
    /// Return the bit at `index` (0 = most significant bit of byte 0).
    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }
}

impl TryFrom<&[u8]> for IdentityKey {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; IDENTITY_KEY_LEN] =
            bytes.try_into().map_err(|_| DecodeError::KeyLength {
                expected: IDENTITY_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
