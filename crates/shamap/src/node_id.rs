//! Logical position of a node inside the trie.

use crate::hash::{Hash256, KEY_NIBBLES};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's position: its depth and the key prefix leading to it.
///
/// Only the high `depth` nibbles of `key` are meaningful; constructors keep
/// the remainder zeroed so derived equality and hashing are positional.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    depth: u8,
    key: Hash256,
}

impl NodeId {
    /// The root position.
    pub const fn root() -> Self {
        Self {
            depth: 0,
            key: Hash256::ZERO,
        }
    }

    /// Position at `depth` along the path to `key`. Nibbles below `depth`
    /// are masked out.
    pub fn new(depth: u8, key: Hash256) -> Self {
        debug_assert!(depth as usize <= KEY_NIBBLES);
        let depth = depth.min(KEY_NIBBLES as u8);
        Self {
            depth,
            key: key.masked(depth),
        }
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub fn key(&self) -> &Hash256 {
        &self.key
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// The branch a descent toward `key` takes from this position.
    #[inline]
    pub fn select_branch(&self, key: &Hash256) -> usize {
        debug_assert!((self.depth as usize) < KEY_NIBBLES);
        key.nibble(self.depth as usize) as usize
    }

    /// The position of the child behind `branch`.
    pub fn child(&self, branch: u8) -> Self {
        debug_assert!(branch < 16);
        debug_assert!((self.depth as usize) < KEY_NIBBLES);
        Self {
            depth: self.depth + 1,
            key: self.key.with_nibble(self.depth as usize, branch),
        }
    }

    /// True if the two positions agree over the first
    /// `min(self.depth, other.depth)` nibbles.
    pub fn has_common_prefix(&self, other: &NodeId) -> bool {
        let shared = self.depth.min(other.depth);
        self.key.masked(shared) == other.key.masked(shared)
    }

    /// True if this position lies on the path to `key`.
    pub fn is_prefix_of(&self, key: &Hash256) -> bool {
        key.masked(self.depth) == self.key
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(depth={}, key={})", self.depth, self.key)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> Hash256 {
        Hash256::digest(&[&[seed]])
    }

    #[test]
    fn root_properties() {
        let root = NodeId::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert!(!root.child(3).is_root());
    }

    #[test]
    fn child_appends_branch_nibble() {
        let k = key(1);
        let mut id = NodeId::root();
        for depth in 0..8 {
            let branch = k.nibble(depth);
            id = id.child(branch);
            assert_eq!(id.depth() as usize, depth + 1);
            assert!(id.is_prefix_of(&k));
        }
    }

    #[test]
    fn select_branch_follows_key() {
        let k = key(7);
        let id = NodeId::root();
        assert_eq!(id.select_branch(&k), k.nibble(0) as usize);
        let id = id.child(k.nibble(0));
        assert_eq!(id.select_branch(&k), k.nibble(1) as usize);
    }

    #[test]
    fn new_masks_low_nibbles() {
        let k = key(9);
        let id = NodeId::new(3, k);
        assert_eq!(*id.key(), k.masked(3));
        // equal positions built from different full keys compare equal
        let noisy = k.with_nibble(10, 0xF);
        assert_eq!(id, NodeId::new(3, noisy));
    }

    #[test]
    fn common_prefix() {
        let k = key(4);
        let shallow = NodeId::new(2, k);
        let deep = NodeId::new(10, k);
        assert!(shallow.has_common_prefix(&deep));
        assert!(deep.has_common_prefix(&shallow));

        let divergent = NodeId::new(10, k.with_nibble(1, k.nibble(1) ^ 1));
        assert!(!deep.has_common_prefix(&divergent));
        // divergence below the shared depth is invisible
        assert!(shallow.has_common_prefix(&NodeId::new(1, k)));
    }
}
