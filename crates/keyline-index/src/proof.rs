//! Inclusion and exclusion proofs.

use keyline_types::{Digest, IdentityKey};
use serde::{Deserialize, Serialize};

use crate::error::ProofError;
use crate::hasher::{TREE_HEIGHT, empty_digests, first_difference, lone_leaf_digest, node_hash, value_digest};

/// Where the path for a key ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    /// An empty subtree: the key is absent.
    Empty,
    /// A lone leaf. If its key is the queried key this proves inclusion;
    /// otherwise it proves the queried key is absent.
    Leaf {
        /// Key stored in the leaf.
        key: IdentityKey,
        /// Digest of the value stored in the leaf.
        value_digest: Digest,
    },
}

/// Compact authentication path from the root down to a key's terminal node.
///
/// Siblings equal to the empty sentinel for their height are omitted; the
/// `present` bitmap (one bit per level, MSB-first) marks the levels whose
/// sibling is carried in `siblings`, in root-to-leaf order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Queried key.
    pub key: IdentityKey,
    /// Number of levels between the root and the terminal node.
    pub depth: u16,
    /// Bitmap of levels with a non-empty sibling.
    pub present: [u8; 32],
    /// Non-empty sibling digests, root first.
    pub siblings: Vec<Digest>,
    /// Terminal node of the path.
    pub terminal: Terminal,
}

impl Proof {
    /// Whether the terminal is a leaf holding the queried key.
    pub fn is_inclusion(&self) -> bool {
        matches!(&self.terminal, Terminal::Leaf { key, .. } if *key == self.key)
    }

    fn sibling_present(&self, level: usize) -> bool {
        self.present[level / 8] & (0x80 >> (level % 8)) != 0
    }

    /// Recompute the root digest this proof commits to.
    pub fn compute_root(&self) -> Result<Digest, ProofError> {
        let depth = self.depth as usize;
        if depth > TREE_HEIGHT {
            return Err(ProofError::Malformed("depth exceeds tree height"));
        }

        let expected_siblings = (0..depth).filter(|&l| self.sibling_present(l)).count();
        if expected_siblings != self.siblings.len() {
            return Err(ProofError::Malformed("sibling count does not match bitmap"));
        }
        if (depth..TREE_HEIGHT).any(|l| self.sibling_present(l)) {
            return Err(ProofError::Malformed("bitmap marks levels below the terminal"));
        }

        let empty = empty_digests();
        let height = TREE_HEIGHT - depth;

        let mut current = match &self.terminal {
            Terminal::Empty => empty.at(height),
            Terminal::Leaf { key, value_digest } => {
                if let Some(bit) = first_difference(key, &self.key)
                    && bit < depth
                {
                    return Err(ProofError::PathMismatch);
                }
                lone_leaf_digest(key, value_digest, height)
            }
        };

        let mut siblings = self.siblings.iter().rev();

        for level in (0..depth).rev() {
            let child_height = TREE_HEIGHT - level - 1;
            let sibling = if self.sibling_present(level) {
                *siblings
                    .next()
                    .ok_or(ProofError::Malformed("missing sibling"))?
            } else {
                empty.at(child_height)
            };

            current = if self.key.bit(level) {
                node_hash(&sibling, &current)
            } else {
                node_hash(&current, &sibling)
            };
        }

        Ok(current)
    }

    /// Check that `value` is committed at `key` under `root`.
    pub fn verify_inclusion(&self, root: &Digest, value: &[u8]) -> Result<(), ProofError> {
        match &self.terminal {
            Terminal::Leaf {
                key,
                value_digest: committed,
            } if *key == self.key => {
                if *committed != value_digest(value) {
                    return Err(ProofError::ValueMismatch);
                }
            }
            _ => return Err(ProofError::NotInclusion),
        }

        self.check_root(root)
    }

    /// Check that `key` is absent under `root`.
    pub fn verify_exclusion(&self, root: &Digest) -> Result<(), ProofError> {
        if self.is_inclusion() {
            return Err(ProofError::NotExclusion);
        }

        self.check_root(root)
    }

    fn check_root(&self, root: &Digest) -> Result<(), ProofError> {
        let computed = self.compute_root()?;
        if computed != *root {
            return Err(ProofError::RootMismatch {
                expected: *root,
                computed,
            });
        }
        Ok(())
    }
}
