//! Copy-on-write sparse Merkle tree.

use std::sync::Arc;

use keyline_types::{Digest, IdentityKey};

use crate::error::IndexError;
use crate::hasher::{
    TREE_HEIGHT, empty_digests, first_difference, lone_leaf_digest, node_hash, value_digest,
};
use crate::proof::{Proof, Terminal};

/// A subtree. `Empty` carries no data: its digest is the sentinel for the
/// height it sits at.
#[derive(Clone)]
enum Node {
    Empty,
    Leaf(Arc<Leaf>),
    Branch(Arc<Branch>),
}

/// The only key in its subtree.
struct Leaf {
    key: IdentityKey,
    value: Arc<[u8]>,
    value_digest: Digest,
    /// Digest of the subtree this leaf occupies, at the height it was placed.
    digest: Digest,
}

struct Branch {
    left: Node,
    right: Node,
    digest: Digest,
}

impl Node {
    fn leaf(key: IdentityKey, value: Arc<[u8]>, value_digest: Digest, height: usize) -> Self {
        let digest = lone_leaf_digest(&key, &value_digest, height);
        Node::Leaf(Arc::new(Leaf {
            key,
            value,
            value_digest,
            digest,
        }))
    }

    /// Re-place an existing leaf at a different height.
    fn relocate(leaf: &Leaf, height: usize) -> Self {
        Self::leaf(leaf.key, Arc::clone(&leaf.value), leaf.value_digest, height)
    }

    fn branch(left: Node, right: Node, height: usize) -> Self {
        let digest = node_hash(&left.digest(height - 1), &right.digest(height - 1));
        Node::Branch(Arc::new(Branch {
            left,
            right,
            digest,
        }))
    }

    fn digest(&self, height: usize) -> Digest {
        match self {
            Node::Empty => empty_digests().at(height),
            Node::Leaf(leaf) => leaf.digest,
            Node::Branch(branch) => branch.digest,
        }
    }
}

/// Result of a [`SparseMerkleTree::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The key holds this committed value.
    Present(&'a [u8]),
    /// The key holds the canonical empty marker.
    Empty,
}

impl<'a> Lookup<'a> {
    /// The committed value, if any.
    pub fn value(&self) -> Option<&'a [u8]> {
        match *self {
            Lookup::Present(v) => Some(v),
            Lookup::Empty => None,
        }
    }

    /// Whether the key is absent.
    pub fn is_empty(&self) -> bool {
        matches!(self, Lookup::Empty)
    }
}

/// Authenticated map from [`IdentityKey`] to opaque committed values.
///
/// Mutated through `&mut self` only; wrap it in a lock to share a writer.
/// Clones share structure and are unaffected by later inserts into the
/// original.
#[derive(Clone)]
pub struct SparseMerkleTree {
    root: Node,
    len: usize,
}

impl Default for SparseMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SparseMerkleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseMerkleTree")
            .field("len", &self.len)
            .field("root", &self.root())
            .finish()
    }
}

impl SparseMerkleTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            root: Node::Empty,
            len: 0,
        }
    }

    /// Write or overwrite the value at `key`. The most recent insert wins.
    pub fn insert(&mut self, key: IdentityKey, value: impl Into<Vec<u8>>) {
        let value: Arc<[u8]> = Arc::from(value.into());
        let digest = value_digest(&value);
        let (root, added) = insert_at(&self.root, TREE_HEIGHT, key, value, digest);
        self.root = root;

        if added {
            self.len += 1;
        }
    }

    /// Current value at `key`, or `None`.
    pub fn get(&self, key: &IdentityKey) -> Option<&[u8]> {
        let mut node = &self.root;
        let mut height = TREE_HEIGHT;

        loop {
            match node {
                Node::Empty => return None,
                Node::Leaf(leaf) => {
                    return (leaf.key == *key).then_some(&leaf.value[..]);
                }
                Node::Branch(branch) => {
                    node = if key.bit(TREE_HEIGHT - height) {
                        &branch.right
                    } else {
                        &branch.left
                    };
                    height -= 1;
                }
            }
        }
    }

    /// Current value at `key`, or the empty marker.
    pub fn lookup(&self, key: &IdentityKey) -> Lookup<'_> {
        match self.get(key) {
            Some(value) => Lookup::Present(value),
            None => Lookup::Empty,
        }
    }

    /// Whether `key` holds a value.
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.get(key).is_some()
    }

    /// Digest summarising the whole mapping.
    pub fn root(&self) -> Digest {
        self.root.digest(TREE_HEIGHT)
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no key holds a value.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over `(key, value)` pairs in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: vec![&self.root],
        }
    }

    /// Authentication path for `key`, proving either presence or absence.
    pub fn prove(&self, key: &IdentityKey) -> Proof {
        let mut node = &self.root;
        let mut height = TREE_HEIGHT;
        let mut present = [0u8; 32];
        let mut siblings = Vec::new();

        let terminal = loop {
            match node {
                Node::Empty => break Terminal::Empty,
                Node::Leaf(leaf) => {
                    break Terminal::Leaf {
                        key: leaf.key,
                        value_digest: leaf.value_digest,
                    };
                }
                Node::Branch(branch) => {
                    let level = TREE_HEIGHT - height;
                    let (next, sibling) = if key.bit(level) {
                        (&branch.right, &branch.left)
                    } else {
                        (&branch.left, &branch.right)
                    };

                    if !matches!(sibling, Node::Empty) {
                        present[level / 8] |= 0x80 >> (level % 8);
                        siblings.push(sibling.digest(height - 1));
                    }

                    node = next;
                    height -= 1;
                }
            }
        };

        Proof {
            key: *key,
            depth: (TREE_HEIGHT - height) as u16,
            present,
            siblings,
            terminal,
        }
    }

    /// Proof that `key` holds a value.
    pub fn prove_inclusion(&self, key: &IdentityKey) -> Result<Proof, IndexError> {
        let proof = self.prove(key);
        if proof.is_inclusion() {
            Ok(proof)
        } else {
            Err(IndexError::NotPresent(*key))
        }
    }

    /// Proof that `key` holds the empty marker.
    pub fn prove_exclusion(&self, key: &IdentityKey) -> Result<Proof, IndexError> {
        let proof = self.prove(key);
        if proof.is_inclusion() {
            Err(IndexError::Present(*key))
        } else {
            Ok(proof)
        }
    }
}

/// Returns the rebuilt subtree and whether `key` was newly added.
fn insert_at(
    node: &Node,
    height: usize,
    key: IdentityKey,
    value: Arc<[u8]>,
    digest: Digest,
) -> (Node, bool) {
    match node {
        Node::Empty => (Node::leaf(key, value, digest, height), true),
        Node::Leaf(existing) => match first_difference(&existing.key, &key) {
            None => (Node::leaf(key, value, digest, height), false),
            Some(bit) => (split(existing, height, bit, key, value, digest), true),
        },
        Node::Branch(branch) => {
            if key.bit(TREE_HEIGHT - height) {
                let (right, added) = insert_at(&branch.right, height - 1, key, value, digest);
                (Node::branch(branch.left.clone(), right, height), added)
            } else {
                let (left, added) = insert_at(&branch.left, height - 1, key, value, digest);
                (Node::branch(left, branch.right.clone(), height), added)
            }
        }
    }
}

/// Replace a lone leaf at `height` with a subtree holding it and `key`.
///
/// `bit` is the first bit where the keys differ; the branch that separates
/// them sits at height `TREE_HEIGHT - bit`, with single-child branches above
/// it up to `height`.
fn split(
    existing: &Leaf,
    height: usize,
    bit: usize,
    key: IdentityKey,
    value: Arc<[u8]>,
    digest: Digest,
) -> Node {
    let split_height = TREE_HEIGHT - bit;
    let old = Node::relocate(existing, split_height - 1);
    let new = Node::leaf(key, value, digest, split_height - 1);

    let mut node = if key.bit(bit) {
        Node::branch(old, new, split_height)
    } else {
        Node::branch(new, old, split_height)
    };

    for h in (split_height + 1)..=height {
        node = if key.bit(TREE_HEIGHT - h) {
            Node::branch(Node::Empty, node, h)
        } else {
            Node::branch(node, Node::Empty, h)
        };
    }

    node
}

/// In-order iterator over a [`SparseMerkleTree`].
pub struct Iter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (IdentityKey, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            match node {
                Node::Empty => {}
                Node::Leaf(leaf) => return Some((leaf.key, &leaf.value[..])),
                Node::Branch(branch) => {
                    self.stack.push(&branch.right);
                    self.stack.push(&branch.left);
                }
            }
        }
        None
    }
}
