//! Depth-first traversal over a fully resolvable map.
//!
//! The walker keeps an explicit stack of resume positions instead of
//! recursing, which is the shape every traversal in this crate shares.

use crate::error::ShamapError;
use crate::map::SHAMap;
use crate::node::{Item, Node, BRANCH_COUNT};
use std::sync::Arc;

impl SHAMap {
    /// Visits every node, parents before children. The visitor returns
    /// `true` to stop the walk.
    ///
    /// Children are resolved through the store as needed; a child that is
    /// referenced but unavailable is an `InconsistentTree` error, so this is
    /// for maps that are fully present locally.
    pub fn visit_nodes<F>(&self, mut visit: F) -> Result<(), ShamapError>
    where
        F: FnMut(&Node) -> bool,
    {
        let root = self.root();
        if root.hash().is_zero() {
            return Ok(());
        }
        if visit(root.as_ref()) || root.is_leaf() {
            return Ok(());
        }

        let mut stack: Vec<(Arc<Node>, usize)> = Vec::new();
        let mut node = root;
        let mut pos = 0usize;

        loop {
            while pos < BRANCH_COUNT {
                let inner = node.expect_inner()?;
                if inner.is_empty_branch(pos) {
                    pos += 1;
                    continue;
                }
                let child = self.descend_throw(inner, pos)?;
                if visit(child.as_ref()) {
                    return Ok(());
                }
                if child.is_leaf() {
                    pos += 1;
                    continue;
                }
                // skip trailing empty branches so we never push a frame
                // that has nothing left to do
                let mut resume = pos + 1;
                while resume < BRANCH_COUNT && inner.is_empty_branch(resume) {
                    resume += 1;
                }
                if resume < BRANCH_COUNT {
                    stack.push((node.clone(), resume));
                }
                node = child;
                pos = 0;
            }

            match stack.pop() {
                Some((parent, resume)) => {
                    node = parent;
                    pos = resume;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Visits every leaf item exactly once, in key order.
    pub fn visit_leaves<F>(&self, mut visit: F) -> Result<(), ShamapError>
    where
        F: FnMut(&Item),
    {
        self.visit_nodes(|node| {
            if let Node::Leaf(leaf) = node {
                visit(leaf.item());
            }
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FullBelowCache;
    use crate::hash::Hash256;
    use crate::store::InMemoryNodeStore;

    fn items(count: u8) -> Vec<Item> {
        (0..count)
            .map(|seed| Item::new(Hash256::digest(&[&[seed]]), vec![seed; 2]))
            .collect()
    }

    fn build(count: u8) -> SHAMap {
        SHAMap::from_items(
            1,
            items(count),
            Arc::new(InMemoryNodeStore::new()),
            Arc::new(FullBelowCache::new()),
        )
        .unwrap()
    }

    #[test]
    fn visit_leaves_yields_every_item_once_in_key_order() {
        let map = build(40);
        let mut expected = items(40);
        expected.sort_by(|a, b| a.key.cmp(&b.key));

        let mut seen = Vec::new();
        map.visit_leaves(|item| seen.push(item.clone())).unwrap();
        assert_eq!(seen, expected);
    }

    #[test]
    fn visit_leaves_is_stable_across_calls() {
        let map = build(25);
        let mut first = Vec::new();
        map.visit_leaves(|item| first.push(item.key)).unwrap();
        let mut second = Vec::new();
        map.visit_leaves(|item| second.push(item.key)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn visit_nodes_counts_parents_before_children() {
        let map = build(30);
        let mut inner_seen = 0usize;
        let mut leaves_seen = 0usize;
        map.visit_nodes(|node| {
            if node.is_inner() {
                inner_seen += 1;
            } else {
                // every leaf must arrive after at least the root
                assert!(inner_seen > 0);
                leaves_seen += 1;
            }
            false
        })
        .unwrap();
        assert_eq!(leaves_seen, 30);
        assert!(inner_seen >= 1);
    }

    #[test]
    fn visitor_can_stop_early() {
        let map = build(30);
        let mut visited = 0usize;
        map.visit_nodes(|_| {
            visited += 1;
            visited == 3
        })
        .unwrap();
        assert_eq!(visited, 3);
    }

    #[test]
    fn single_leaf_map_visits_the_root_only() {
        let map = build(1);
        let mut count = 0usize;
        map.visit_nodes(|node| {
            assert!(node.is_leaf());
            count += 1;
            false
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_map_visits_nothing() {
        let map = SHAMap::new(
            1,
            Arc::new(InMemoryNodeStore::new()),
            Arc::new(FullBelowCache::new()),
        );
        map.visit_nodes(|_| panic!("nothing to visit")).unwrap();
    }
}
