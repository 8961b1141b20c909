//! Domain-separated blake3 hashing and the empty-subtree sentinels.

use std::sync::OnceLock;

use keyline_types::{Digest, IdentityKey};

/// Number of levels below the root. A node at height `h` branches on key
/// bit `TREE_HEIGHT - h`; leaves sit at height 0.
pub const TREE_HEIGHT: usize = 256;

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;
const EMPTY_TAG: u8 = 0x02;

/// Digest of a committed value.
pub fn value_digest(value: &[u8]) -> Digest {
    Digest::from_data(value)
}

/// `H(0x00 || key || value_digest)`.
pub fn leaf_hash(key: &IdentityKey, value_digest: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_TAG]);
    hasher.update(key.as_bytes());
    hasher.update(value_digest.as_bytes());
    hasher.finalize().into()
}

/// `H(0x01 || left || right)`.
pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_TAG]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize().into()
}

/// Digests of all-empty subtrees, one per height.
///
/// `at(0)` is the empty leaf marker `H(0x02)`; `at(h)` is
/// `node_hash(at(h - 1), at(h - 1))`.
pub struct EmptyDigests([Digest; TREE_HEIGHT + 1]);

impl EmptyDigests {
    fn compute() -> Self {
        let mut digests = [Digest::ZERO; TREE_HEIGHT + 1];
        digests[0] = blake3::hash(&[EMPTY_TAG]).into();

        for h in 1..=TREE_HEIGHT {
            digests[h] = node_hash(&digests[h - 1], &digests[h - 1]);
        }

        Self(digests)
    }

    /// Digest of an empty subtree of the given height.
    pub fn at(&self, height: usize) -> Digest {
        self.0[height]
    }
}

/// Process-wide empty-subtree table, computed on first use.
pub fn empty_digests() -> &'static EmptyDigests {
    static EMPTY: OnceLock<EmptyDigests> = OnceLock::new();
    EMPTY.get_or_init(EmptyDigests::compute)
}

/// Root digest of an index with no keys.
pub fn empty_root() -> Digest {
    empty_digests().at(TREE_HEIGHT)
}

/// Digest of a subtree of `height` whose only key is `key`.
///
/// Folds the leaf hash upward, pairing it with an empty sibling at every
/// level.
pub(crate) fn lone_leaf_digest(key: &IdentityKey, value_digest: &Digest, height: usize) -> Digest {
    let empty = empty_digests();
    let mut current = leaf_hash(key, value_digest);

    for h in 1..=height {
        let sibling = empty.at(h - 1);
        current = if key.bit(TREE_HEIGHT - h) {
            node_hash(&sibling, &current)
        } else {
            node_hash(&current, &sibling)
        };
    }

    current
}

/// Index of the first bit at which two keys differ, or `None` if equal.
pub(crate) fn first_difference(a: &IdentityKey, b: &IdentityKey) -> Option<usize> {
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .enumerate()
        .find_map(|(i, (x, y))| {
            let diff = x ^ y;
            (diff != 0).then(|| i * 8 + diff.leading_zeros() as usize)
        })
}
