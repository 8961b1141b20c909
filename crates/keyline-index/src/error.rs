//! Error types for the identity index.

use keyline_types::{Digest, IdentityKey};

/// Errors returned by index queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// An inclusion proof was requested for an absent key.
    #[error("key not present: {0}")]
    NotPresent(IdentityKey),

    /// An exclusion proof was requested for a present key.
    #[error("key is present: {0}")]
    Present(IdentityKey),
}

/// Reasons a proof fails to verify.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    /// The proof is structurally inconsistent.
    #[error("malformed proof: {0}")]
    Malformed(&'static str),

    /// The terminal leaf does not lie on the queried key's path.
    #[error("terminal leaf is not on the key's path")]
    PathMismatch,

    /// Inclusion was checked against a different value.
    #[error("value digest does not match")]
    ValueMismatch,

    /// Inclusion was checked on a proof of absence.
    #[error("proof does not show inclusion")]
    NotInclusion,

    /// Exclusion was checked on a proof of presence.
    #[error("proof does not show exclusion")]
    NotExclusion,

    /// The recomputed root differs from the expected one.
    #[error("root mismatch: expected {expected}, computed {computed}")]
    RootMismatch {
        /// Root the caller trusts.
        expected: Digest,
        /// Root recomputed from the proof.
        computed: Digest,
    },
}
