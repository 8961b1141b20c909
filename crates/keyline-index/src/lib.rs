//! Authenticated identity index: a sparse Merkle tree over 256-bit keys.
//!
//! Every possible [`IdentityKey`](keyline_types::IdentityKey) has a slot in a
//! 256-level binary tree. Absent keys hold a canonical empty marker, and an
//! empty subtree of height `h` has the precomputed digest
//! [`EmptyDigests::at(h)`](EmptyDigests::at), so the tree only materialises
//! the paths of keys that are actually present.
//!
//! A subtree holding a single key is stored as one leaf node whose cached
//! digest is what the full-depth tree would produce at that height. The root
//! digest is therefore a function of the key/value set alone, not of the
//! order of inserts or of how the tree happens to be compressed.
//!
//! Nodes are reference-counted and copy-on-write: cloning a
//! [`SparseMerkleTree`] is O(1) and yields an immutable snapshot.

mod error;
mod hasher;
mod proof;
mod tree;

#[cfg(test)]
mod tests;

pub use error::{IndexError, ProofError};
pub use hasher::{EmptyDigests, TREE_HEIGHT, empty_digests, empty_root, leaf_hash, node_hash, value_digest};
pub use proof::{Proof, Terminal};
pub use tree::{Iter, Lookup, SparseMerkleTree};
