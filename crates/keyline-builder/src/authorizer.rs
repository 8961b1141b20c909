//! Authorization of validated updates.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use keyline_types::{Entry, SignedEntryUpdate};
use tracing::debug;

use crate::validator::{ValidatedUpdate, ValidationError};

/// Decides whether a structurally valid update may be admitted.
///
/// `previous` is the entry currently committed for the update's identity
/// key, or `None` if the key is absent from the index.
pub trait UpdateAuthorizer: Send + Sync {
    /// Accept or refuse the update.
    fn authorize(
        &self,
        update: &ValidatedUpdate,
        previous: Option<&Entry>,
        signed: &SignedEntryUpdate,
    ) -> Result<(), ValidationError>;
}

/// Accepts every update. Signature checking happens upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl UpdateAuthorizer for AllowAll {
    fn authorize(
        &self,
        _update: &ValidatedUpdate,
        _previous: Option<&Entry>,
        _signed: &SignedEntryUpdate,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Requires an ed25519 signature over `new_entry` from an authorized key.
///
/// For an existing identity the signer must be listed in the committed
/// entry's `authorized_keys`. A new identity is self-certified: the signer
/// must be listed in the new entry's own `authorized_keys`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Authorizer;

impl UpdateAuthorizer for Ed25519Authorizer {
    fn authorize(
        &self,
        update: &ValidatedUpdate,
        previous: Option<&Entry>,
        signed: &SignedEntryUpdate,
    ) -> Result<(), ValidationError> {
        let allowed = match previous {
            Some(entry) => &entry.authorized_keys,
            None => &update.entry.authorized_keys,
        };

        if allowed.is_empty() {
            return Err(ValidationError::Unauthorized(
                "identity has no authorized keys".into(),
            ));
        }

        for candidate in &signed.signatures {
            if !allowed.contains(&candidate.public_key) {
                continue;
            }
            let Ok(verifying_key) = VerifyingKey::from_bytes(&candidate.public_key) else {
                continue;
            };
            let Ok(bytes) = <[u8; 64]>::try_from(candidate.signature.as_slice()) else {
                continue;
            };
            let signature = Signature::from_bytes(&bytes);
            if verifying_key.verify(&signed.new_entry, &signature).is_ok() {
                return Ok(());
            }
        }

        debug!(key = %update.key, signatures = signed.signatures.len(), "no valid authorized signature");
        Err(ValidationError::Unauthorized(format!(
            "no valid signature from {} authorized key(s)",
            allowed.len()
        )))
    }
}
