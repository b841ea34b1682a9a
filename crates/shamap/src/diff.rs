//! Comparing map versions: the difference walk, the fetch-pack built from
//! it, and the point predicates peers' difference walks call back into.

use crate::codec::{self, SerialFormat};
use crate::error::ShamapError;
use crate::hash::Hash256;
use crate::map::SHAMap;
use crate::node::{Node, BRANCH_COUNT};
use crate::node_id::NodeId;
use std::sync::Arc;
use tracing::{info, warn};

impl SHAMap {
    /// Does this map contain an inner node at `target_id` with
    /// `target_hash`?
    pub fn has_inner_node(
        &self,
        target_id: &NodeId,
        target_hash: &Hash256,
    ) -> Result<bool, ShamapError> {
        let mut node = self.root();
        let mut id = NodeId::root();

        loop {
            let Some(inner) = node.as_inner() else {
                break;
            };
            if id.depth() >= target_id.depth() {
                break;
            }
            let branch = id.select_branch(target_id.key());
            if inner.is_empty_branch(branch) {
                return Ok(false);
            }
            let child = self.descend_throw(inner, branch)?;
            id = id.child(branch as u8);
            node = child;
        }
        Ok(node.is_inner() && node.hash() == *target_hash)
    }

    /// Does this map contain a leaf for `key` with `target_hash`?
    pub fn has_leaf_node(&self, key: &Hash256, target_hash: &Hash256) -> Result<bool, ShamapError> {
        let mut node = self.root();
        let mut id = NodeId::root();

        if node.is_leaf() {
            // the only leaf in the map
            return Ok(node.hash() == *target_hash);
        }
        loop {
            let Some(inner) = node.as_inner() else {
                break;
            };
            let branch = id.select_branch(key);
            if inner.is_empty_branch(branch) {
                return Ok(false);
            }
            if inner.child_hash(branch) == Some(*target_hash) {
                // matching child hash, no need to materialize it
                return Ok(true);
            }
            node = self.descend_throw(inner, branch)?;
            id = id.child(branch as u8);
        }
        Ok(false)
    }

    /// Visits every node of this map that `have` lacks, parents before
    /// descendants. The visitor returns `false` to stop the walk.
    pub fn visit_differences<F>(
        &self,
        have: Option<&SHAMap>,
        mut visit: F,
    ) -> Result<(), ShamapError>
    where
        F: FnMut(&Node) -> bool,
    {
        let root = self.root();
        if root.hash().is_zero() {
            return Ok(());
        }
        if let Some(have) = have {
            if root.hash() == have.root_hash() {
                return Ok(());
            }
        }
        if let Node::Leaf(leaf) = root.as_ref() {
            let held = match have {
                Some(have) => have.has_leaf_node(&leaf.item().key, &root.hash())?,
                None => false,
            };
            if !held {
                visit(root.as_ref());
            }
            return Ok(());
        }

        let mut stack: Vec<(Arc<Node>, NodeId)> = vec![(root, NodeId::root())];
        while let Some((node, id)) = stack.pop() {
            if !visit(node.as_ref()) {
                return Ok(());
            }
            let inner = node.expect_inner()?;
            for branch in 0..BRANCH_COUNT {
                if inner.is_empty_branch(branch) {
                    continue;
                }
                let Some(child_hash) = inner.child_hash(branch) else {
                    continue;
                };
                let child_id = id.child(branch as u8);
                let child = self.descend_throw(inner, branch)?;
                match child.as_ref() {
                    Node::Inner(_) => {
                        let held = match have {
                            Some(have) => have.has_inner_node(&child_id, &child_hash)?,
                            None => false,
                        };
                        if !held {
                            stack.push((child, child_id));
                        }
                    }
                    Node::Leaf(leaf) => {
                        let held = match have {
                            Some(have) => have.has_leaf_node(&leaf.item().key, &child_hash)?,
                            None => false,
                        };
                        if !held && !visit(child.as_ref()) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Emits up to `max` prefix-format nodes that close the gap between this
    /// map and the version a peer last held. Leaves are skipped unless
    /// `include_leaves` is set (there is no point shipping the leaves of a
    /// transaction tree).
    pub fn get_fetch_pack<F>(
        &self,
        have: Option<&SHAMap>,
        include_leaves: bool,
        max: usize,
        mut emit: F,
    ) -> Result<(), ShamapError>
    where
        F: FnMut(Hash256, Vec<u8>),
    {
        if let Some(have) = have {
            if have.is_v2() != self.is_v2() {
                info!("cannot build a fetch pack across trie versions");
                return Ok(());
            }
        }
        let mut remaining = max;
        self.visit_differences(have, |node| {
            if include_leaves || node.is_inner() {
                emit(node.hash(), codec::encode(node, SerialFormat::Prefix));
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    return false;
                }
            }
            true
        })
    }

    /// Walks both maps in lockstep and verifies they agree on every node
    /// hash, branch layout, and leaf item. Debug and test aid.
    pub fn deep_compare(&self, other: &SHAMap) -> Result<bool, ShamapError> {
        let mut stack: Vec<(Arc<Node>, Arc<Node>)> = vec![(self.root(), other.root())];

        while let Some((ours, theirs)) = stack.pop() {
            if ours.hash() != theirs.hash() {
                warn!("node hash mismatch");
                return Ok(false);
            }
            match (ours.as_ref(), theirs.as_ref()) {
                (Node::Leaf(a), Node::Leaf(b)) => {
                    if a.item() != b.item() {
                        return Ok(false);
                    }
                }
                (Node::Inner(a), Node::Inner(b)) => {
                    for branch in 0..BRANCH_COUNT {
                        if a.is_empty_branch(branch) {
                            if !b.is_empty_branch(branch) {
                                return Ok(false);
                            }
                        } else {
                            if b.is_empty_branch(branch) {
                                return Ok(false);
                            }
                            let ours_child = self.descend_throw(a, branch)?;
                            let theirs_child = other.descend_throw(b, branch)?;
                            stack.push((ours_child, theirs_child));
                        }
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
