//! Node model: inner nodes with sixteen hash-addressed branch slots and
//! leaves carrying keyed payloads.
//!
//! Nodes are shared by reference count and form a DAG: the store's
//! canonicalizer guarantees at most one resolved object per hash, so
//! identical subtrees are shared across sibling positions and map versions.
//! A branch slot only ever transitions `Hash -> Resolved`, keeping the
//! recorded hash, which is why a node's own hash can be memoized forever.

use crate::codec;
use crate::error::ShamapError;
use crate::hash::{Hash256, KEY_NIBBLES};
use crate::node_id::NodeId;
use parking_lot::RwLock;
use std::array;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Number of child slots per inner node.
pub const BRANCH_COUNT: usize = 16;

/// A leaf payload: a 256-bit key and opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Hash256,
    pub data: Vec<u8>,
}

impl Item {
    pub fn new(key: Hash256, data: Vec<u8>) -> Self {
        Self { key, data }
    }
}

/// One child slot of an inner node.
#[derive(Debug, Clone)]
pub enum Branch {
    /// No child behind this branch.
    Empty,
    /// Child known by hash only; not materialized locally.
    Hash(Hash256),
    /// Child materialized; the recorded hash is kept alongside.
    Resolved(Arc<Node>, Hash256),
}

impl Branch {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Branch::Empty)
    }

    #[inline]
    pub fn hash(&self) -> Option<Hash256> {
        match self {
            Branch::Empty => None,
            Branch::Hash(hash) | Branch::Resolved(_, hash) => Some(*hash),
        }
    }
}

/// Position attributes of a compressed inner node that skips nibbles.
///
/// When present, the node's identity during traversal is taken from these
/// rather than from the accumulated path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2Info {
    pub depth: u8,
    pub key: Hash256,
}

/// Node type tag reported to sync filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Inner,
    InnerV2,
    Leaf,
}

#[derive(Debug)]
pub struct InnerNode {
    branches: RwLock<[Branch; BRANCH_COUNT]>,
    v2: Option<V2Info>,
    hash: OnceLock<Hash256>,
    full_below_gen: AtomicU32,
}

impl InnerNode {
    /// An inner node with all branches empty. Used as the placeholder root
    /// of a map that has not synched yet; deserialization never produces one.
    pub fn empty() -> Self {
        Self::from_branches(array::from_fn(|_| Branch::Empty), None)
    }

    pub fn from_branches(branches: [Branch; BRANCH_COUNT], v2: Option<V2Info>) -> Self {
        Self {
            branches: RwLock::new(branches),
            v2,
            hash: OnceLock::new(),
            full_below_gen: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn v2_info(&self) -> Option<&V2Info> {
        self.v2.as_ref()
    }

    pub fn is_empty_branch(&self, branch: usize) -> bool {
        self.branches.read()[branch].is_empty()
    }

    /// Recorded hash of the child behind `branch`, resolved or not.
    pub fn child_hash(&self, branch: usize) -> Option<Hash256> {
        self.branches.read()[branch].hash()
    }

    /// The materialized child behind `branch`, if any.
    pub fn resolved_child(&self, branch: usize) -> Option<Arc<Node>> {
        match &self.branches.read()[branch] {
            Branch::Resolved(node, _) => Some(node.clone()),
            _ => None,
        }
    }

    pub fn branch_count(&self) -> usize {
        self.branches.read().iter().filter(|b| !b.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.read().iter().all(Branch::is_empty)
    }

    /// Installs `candidate` behind `branch` iff the slot still holds only a
    /// hash, returning the winning shared pointer. Concurrent installs of
    /// the same hash converge on one instance.
    pub fn canonicalize_child(&self, branch: usize, candidate: Arc<Node>) -> Arc<Node> {
        let mut slots = self.branches.write();
        match &slots[branch] {
            Branch::Resolved(existing, _) => existing.clone(),
            Branch::Hash(hash) => {
                let hash = *hash;
                debug_assert_eq!(candidate.hash(), hash);
                slots[branch] = Branch::Resolved(candidate.clone(), hash);
                candidate
            }
            Branch::Empty => {
                debug_assert!(false, "canonicalize_child on an empty branch");
                candidate
            }
        }
    }

    /// Snapshot of the branch slots, for serialization.
    pub(crate) fn branches_snapshot(&self) -> [Branch; BRANCH_COUNT] {
        self.branches.read().clone()
    }

    pub fn is_full_below(&self, generation: u32) -> bool {
        self.full_below_gen.load(Ordering::Relaxed) == generation
    }

    pub fn set_full_below(&self, generation: u32) {
        self.full_below_gen.store(generation, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct LeafNode {
    item: Item,
    hash: OnceLock<Hash256>,
}

impl LeafNode {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            hash: OnceLock::new(),
        }
    }

    #[inline]
    pub fn item(&self) -> &Item {
        &self.item
    }
}

/// A node of the trie.
#[derive(Debug)]
pub enum Node {
    Inner(InnerNode),
    Leaf(LeafNode),
}

impl Node {
    #[inline]
    pub fn is_inner(&self) -> bool {
        matches!(self, Node::Inner(_))
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn as_inner(&self) -> Option<&InnerNode> {
        match self {
            Node::Inner(inner) => Some(inner),
            Node::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Inner(_) => None,
            Node::Leaf(leaf) => Some(leaf),
        }
    }

    pub(crate) fn expect_inner(&self) -> Result<&InnerNode, ShamapError> {
        self.as_inner()
            .ok_or(ShamapError::Corrupt("inner node expected"))
    }

    pub fn v2_info(&self) -> Option<&V2Info> {
        match self {
            Node::Inner(inner) => inner.v2_info(),
            Node::Leaf(_) => None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Inner(inner) if inner.v2_info().is_some() => NodeKind::InnerV2,
            Node::Inner(_) => NodeKind::Inner,
            Node::Leaf(_) => NodeKind::Leaf,
        }
    }

    /// The node's content hash: SHA-512-half of its prefix-format bytes.
    /// An inner node with no occupied branch hashes to zero.
    pub fn hash(&self) -> Hash256 {
        match self {
            Node::Inner(inner) => *inner.hash.get_or_init(|| {
                if inner.is_empty() {
                    Hash256::ZERO
                } else {
                    Hash256::digest(&[&codec::encode_prefix_inner(inner)])
                }
            }),
            Node::Leaf(leaf) => *leaf
                .hash
                .get_or_init(|| Hash256::digest(&[&codec::encode_prefix_leaf(leaf)])),
        }
    }

    /// True if the node's own identity is consistent with the position `at`
    /// it was reached through.
    pub fn is_in_bounds(&self, at: &NodeId) -> bool {
        match self {
            Node::Leaf(leaf) => at.is_prefix_of(&leaf.item().key),
            Node::Inner(inner) => match inner.v2_info() {
                None => true,
                Some(v2) => {
                    let own = NodeId::new(v2.depth, v2.key);
                    (v2.depth as usize) <= KEY_NIBBLES
                        && at.depth() <= own.depth()
                        && own.has_common_prefix(at)
                }
            },
        }
    }
}
