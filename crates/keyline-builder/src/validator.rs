//! Structural validation of incoming updates.
//!
//! [`validate`] is pure: it performs no I/O and touches no builder state, so
//! a rejected update can never leave a trace in the index or the log.

use keyline_types::{DecodeError, Entry, IDENTITY_KEY_LEN, IdentityKey, SignedEntryUpdate};

/// Reasons an update is refused before admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// `new_entry` is not a well-formed encoded [`Entry`].
    #[error("entry does not decode: {0}")]
    Decode(#[from] DecodeError),

    /// The entry's index is not a valid identity key.
    #[error("identity key must be {expected} bytes, got {actual}")]
    IndexLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// The update lacks a valid signature from an authorized key.
    #[error("update not authorized: {0}")]
    Unauthorized(String),
}

/// An update that passed structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpdate {
    /// The decoded entry.
    pub entry: Entry,
    /// Identity key the entry is bound to.
    pub key: IdentityKey,
    /// Encoded entry bytes, committed as the index value.
    pub value: Vec<u8>,
}

/// Decode `update.new_entry` and check its identity key length.
pub fn validate(update: &SignedEntryUpdate) -> Result<ValidatedUpdate, ValidationError> {
    let entry = Entry::decode(&update.new_entry)?;

    if !entry.has_valid_index() {
        return Err(ValidationError::IndexLength {
            expected: IDENTITY_KEY_LEN,
            actual: entry.index.len(),
        });
    }
    let key = entry.identity_key()?;

    Ok(ValidatedUpdate {
        entry,
        key,
        value: update.new_entry.clone(),
    })
}
