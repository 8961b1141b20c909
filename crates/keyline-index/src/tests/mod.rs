//! Tests for the identity index.


use keyline_types::IdentityKey;

/// Key whose first byte is `first` and whose remaining bytes are zero.
fn key_with_prefix(first: u8) -> IdentityKey {
    let mut bytes = [0u8; 32];
    bytes[0] = first;
    IdentityKey::from(bytes)
}

/// Deterministic pseudo-random key from a seed.
fn test_key(seed: u64) -> IdentityKey {
    IdentityKey::from(*blake3::hash(&seed.to_le_bytes()).as_bytes())
}
