//! Directory entries, signed updates, and their durable log record.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::{IDENTITY_KEY_LEN, IdentityKey};

/// Leading byte of every encoded [`Entry`].
pub const ENTRY_FORMAT_VERSION: u8 = 1;

/// The logical payload bound to an identity key.
///
/// Encoded as one format byte followed by the postcard body. The index
/// treats the encoded bytes as an opaque value; only the validator looks
/// inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Identity key bytes. Must be [`IDENTITY_KEY_LEN`] long to be admitted.
    pub index: Vec<u8>,
    /// Commitment to the user's public key material.
    pub commitment: Vec<u8>,
    /// ed25519 public keys allowed to sign the next update for this identity.
    pub authorized_keys: Vec<[u8; 32]>,
    /// Client-maintained update counter, carried opaquely.
    pub update_count: u64,
}

impl Entry {
    /// Create an entry for the given index with no commitment or keys.
    pub fn new(index: impl Into<Vec<u8>>) -> Self {
        Self {
            index: index.into(),
            ..Self::default()
        }
    }

    /// Encode as `ENTRY_FORMAT_VERSION ++ postcard(self)`.
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_extend(self, vec![ENTRY_FORMAT_VERSION])
            .expect("entry serialization should not fail")
    }

    /// Strictly decode an encoded entry.
    ///
    /// Fails on empty input, an unknown format byte, a malformed body, or
    /// trailing bytes after the body.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;

        if version != ENTRY_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let (entry, rest) = postcard::take_from_bytes::<Entry>(body)?;

        if !rest.is_empty() {
            return Err(DecodeError::TrailingBytes(rest.len()));
        }

        Ok(entry)
    }

    /// Interpret `index` as an [`IdentityKey`].
    pub fn identity_key(&self) -> Result<IdentityKey, DecodeError> {
        IdentityKey::try_from(self.index.as_slice())
    }

    /// Whether `index` has the required identity key length.
    pub fn has_valid_index(&self) -> bool {
        self.index.len() == IDENTITY_KEY_LEN
    }
}

/// A signature over the raw `new_entry` bytes of a [`SignedEntryUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSignature {
    /// ed25519 public key of the signer.
    pub public_key: [u8; 32],
    /// 64-byte ed25519 signature (kept as a `Vec` for serde).
    pub signature: Vec<u8>,
}

/// An encoded [`Entry`] plus the authentication material of its submitter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntryUpdate {
    /// Encoded [`Entry`] bytes, exactly as signed.
    pub new_entry: Vec<u8>,
    /// Signatures over `new_entry`.
    pub signatures: Vec<UpdateSignature>,
}

impl SignedEntryUpdate {
    /// Wrap encoded entry bytes with no signatures.
    pub fn unsigned(new_entry: Vec<u8>) -> Self {
        Self {
            new_entry,
            signatures: Vec::new(),
        }
    }

    /// Append a signature.
    pub fn with_signature(mut self, public_key: [u8; 32], signature: Vec<u8>) -> Self {
        self.signatures.push(UpdateSignature {
            public_key,
            signature,
        });
        self
    }
}

/// Durable log record wrapping an admitted [`SignedEntryUpdate`].
///
/// `sequence` is the primary storage key. Sequences start at 1 and are
/// assigned without gaps in admission order, which is also replay order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStorage {
    /// Primary key in the update log.
    pub sequence: u64,
    /// Epoch that was open when the update was written. One whose
    /// acknowledgement was lost may be sealed in a later epoch.
    pub epoch: u64,
    /// Admission time in unix milliseconds.
    pub admitted_at: u64,
    /// The admitted update.
    pub update: SignedEntryUpdate,
}
