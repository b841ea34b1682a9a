//! The map handle: one version of the trie, with its root, sync state, and
//! handles to the node store and full-below cache.

use crate::cache::FullBelowCache;
use crate::codec::{self, SerialFormat};
use crate::error::ShamapError;
use crate::filter::SyncFilter;
use crate::hash::{Hash256, KEY_NIBBLES};
use crate::node::{Branch, InnerNode, Item, LeafNode, Node, BRANCH_COUNT};
use crate::node_id::NodeId;
use crate::store::{AsyncFetch, NodeStore};
use parking_lot::RwLock;
use std::array;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle state of a map.
///
/// `Invalid` is terminal: it records provable corruption and no transition
/// leads out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nodes are still being acquired from peers.
    Synching,
    /// Every referenced node is available locally.
    Valid,
    /// Provably corrupt; no further acceptance is permitted.
    Invalid,
    /// Frozen; shared read-only.
    Immutable,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SyncState::Synching,
            1 => SyncState::Valid,
            2 => SyncState::Invalid,
            _ => SyncState::Immutable,
        }
    }
}

/// One version of the radix-16 Merkle trie.
///
/// A map is mutated by a single logical owner, but its traversals may run
/// from several threads at once: branch slots resolve through
/// `canonicalize_child`, the sync state is atomic, and the root pointer sits
/// behind a lock that is only written when a root node is installed.
pub struct SHAMap {
    root: RwLock<Arc<Node>>,
    /// Root hash expected but not yet materialized locally.
    pending_root: RwLock<Option<Hash256>>,
    state: AtomicU8,
    seq: u64,
    backed: bool,
    v2: bool,
    store: Arc<dyn NodeStore>,
    full_below: Arc<FullBelowCache>,
}

impl SHAMap {
    /// An empty map in `Synching` state, ready to accept a root node.
    pub fn new(seq: u64, store: Arc<dyn NodeStore>, full_below: Arc<FullBelowCache>) -> Self {
        debug_assert!(seq >= 1);
        Self {
            root: RwLock::new(Arc::new(Node::Inner(InnerNode::empty()))),
            pending_root: RwLock::new(None),
            state: AtomicU8::new(SyncState::Synching as u8),
            seq,
            backed: true,
            v2: false,
            store,
            full_below,
        }
    }

    /// As `new`, but the map treats its inner nodes as the compressed
    /// variant that carries explicit position attributes.
    pub fn new_v2(seq: u64, store: Arc<dyn NodeStore>, full_below: Arc<FullBelowCache>) -> Self {
        Self {
            v2: true,
            ..Self::new(seq, store, full_below)
        }
    }

    /// A replica anchored at a known root hash. If the store already holds
    /// the root node it is resolved immediately; otherwise the first
    /// discovery pass will request it.
    pub fn open(
        seq: u64,
        root_hash: Hash256,
        store: Arc<dyn NodeStore>,
        full_below: Arc<FullBelowCache>,
    ) -> Result<Self, ShamapError> {
        let map = Self::new(seq, store, full_below);
        if !root_hash.is_zero() {
            match map.store.fetch(&root_hash)? {
                Some(node) => {
                    let complete = node.is_leaf();
                    map.install_root(node);
                    if complete {
                        map.clear_synching();
                    }
                }
                None => *map.pending_root.write() = Some(root_hash),
            }
        }
        Ok(map)
    }

    /// A map over an already materialized root, for serving and comparison.
    pub fn with_root(
        seq: u64,
        root: Arc<Node>,
        store: Arc<dyn NodeStore>,
        full_below: Arc<FullBelowCache>,
    ) -> Self {
        let map = Self::new(seq, store, full_below);
        map.install_root(root);
        map.state.store(SyncState::Valid as u8, Ordering::Relaxed);
        map
    }

    /// Builds a fully materialized map from leaf items, persisting every
    /// node to the store. Keys must be unique and non-zero, payloads
    /// non-empty.
    pub fn from_items(
        seq: u64,
        mut items: Vec<Item>,
        store: Arc<dyn NodeStore>,
        full_below: Arc<FullBelowCache>,
    ) -> Result<Self, ShamapError> {
        items.sort_by(|a, b| a.key.cmp(&b.key));
        for item in &items {
            if item.key.is_zero() {
                return Err(ShamapError::Malformed("leaf with a zero key"));
            }
            if item.data.is_empty() {
                return Err(ShamapError::Malformed("leaf with no payload"));
            }
        }
        for pair in items.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(ShamapError::Malformed("duplicate leaf key"));
            }
        }

        let map = Self::new(seq, store, full_below);
        if !items.is_empty() {
            let root = build_subtree(map.store.as_ref(), &items, 0)?;
            map.install_root(root);
        }
        map.state.store(SyncState::Valid as u8, Ordering::Relaxed);
        Ok(map)
    }

    /// Detaches the map from persistent storage: nodes resolve in memory
    /// only and the full-below cache is not consulted.
    pub fn unbacked(mut self) -> Self {
        self.backed = false;
        self
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn is_backed(&self) -> bool {
        self.backed
    }

    #[inline]
    pub fn is_v2(&self) -> bool {
        self.v2
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_synching(&self) -> bool {
        self.state() == SyncState::Synching
    }

    pub(crate) fn clear_synching(&self) {
        let _ = self.state.compare_exchange(
            SyncState::Synching as u8,
            SyncState::Valid as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn set_invalid(&self) {
        self.state.store(SyncState::Invalid as u8, Ordering::Relaxed);
    }

    pub fn set_immutable(&self) {
        if self.state() != SyncState::Invalid {
            self.state
                .store(SyncState::Immutable as u8, Ordering::Relaxed);
        }
    }

    pub(crate) fn store(&self) -> &dyn NodeStore {
        self.store.as_ref()
    }

    pub(crate) fn full_below(&self) -> &FullBelowCache {
        &self.full_below
    }

    /// The current root node. While a root is pending this is the empty
    /// placeholder.
    pub fn root(&self) -> Arc<Node> {
        self.root.read().clone()
    }

    pub(crate) fn pending_root(&self) -> Option<Hash256> {
        *self.pending_root.read()
    }

    /// The root hash this map is anchored at; zero for a map that has
    /// neither a root node nor a pending root hash.
    pub fn root_hash(&self) -> Hash256 {
        match self.pending_root() {
            Some(hash) => hash,
            None => self.root().hash(),
        }
    }

    /// Serializes the root node, or `None` if no root is materialized.
    pub fn get_root_node(&self, format: SerialFormat) -> Option<Vec<u8>> {
        let root = self.root();
        if self.pending_root().is_some() || root.hash().is_zero() {
            return None;
        }
        Some(codec::encode(&root, format))
    }

    pub(crate) fn install_root(&self, node: Arc<Node>) {
        *self.root.write() = node;
        *self.pending_root.write() = None;
    }

    /// The identity a child assumes during traversal: its own recorded
    /// position when it carries one, the accumulated path otherwise.
    pub(crate) fn effective_node_id(child: &Node, path_id: NodeId) -> NodeId {
        match child.v2_info() {
            Some(v2) => NodeId::new(v2.depth, v2.key),
            None => path_id,
        }
    }

    /// True if `node`'s shape contradicts this map's version.
    pub(crate) fn is_inconsistent_node(&self, node: &Node) -> bool {
        match node {
            Node::Inner(inner) => inner.v2_info().is_some() != self.v2,
            Node::Leaf(_) => false,
        }
    }

    /// Fetches a node from the store, falling back to the filter's cache of
    /// not-yet-persisted nodes. Missing is `None`, not an error.
    pub(crate) fn fetch_node_nt(
        &self,
        hash: &Hash256,
        filter: Option<&dyn SyncFilter>,
    ) -> Result<Option<Arc<Node>>, ShamapError> {
        if let Some(node) = self.store.fetch(hash)? {
            return Ok(Some(node));
        }
        if let Some(filter) = filter {
            if let Some(bytes) = filter.try_fetch(hash) {
                match codec::decode(&bytes, SerialFormat::Prefix, Some(hash)) {
                    Ok(node) => {
                        let mut node = Arc::new(node);
                        if self.backed {
                            node = self.store.canonicalize(hash, node);
                        }
                        return Ok(Some(node));
                    }
                    Err(err) => {
                        debug!(%hash, %err, "ignoring corrupt filter record");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolves the child behind `branch`, splicing it into `parent` so
    /// later descents share the instance. `None` if the child is not
    /// available locally.
    pub(crate) fn descend(
        &self,
        parent: &InnerNode,
        branch: usize,
        filter: Option<&dyn SyncFilter>,
    ) -> Result<Option<Arc<Node>>, ShamapError> {
        if let Some(child) = parent.resolved_child(branch) {
            return Ok(Some(child));
        }
        let Some(hash) = parent.child_hash(branch) else {
            return Ok(None);
        };
        match self.fetch_node_nt(&hash, filter)? {
            Some(node) => Ok(Some(parent.canonicalize_child(branch, node))),
            None => Ok(None),
        }
    }

    /// As `descend`, but a missing child is an invariant breach: only used
    /// where the trie guarantees the child is local.
    pub(crate) fn descend_throw(
        &self,
        parent: &InnerNode,
        branch: usize,
    ) -> Result<Arc<Node>, ShamapError> {
        let hash = parent
            .child_hash(branch)
            .ok_or(ShamapError::Corrupt("descend on an empty branch"))?;
        self.descend(parent, branch, None)?
            .ok_or(ShamapError::InconsistentTree(hash))
    }

    /// Non-blocking descent. Returns the resolved child, or whether a
    /// background read is now in flight for it.
    pub(crate) fn descend_async(
        &self,
        parent: &InnerNode,
        branch: usize,
        filter: Option<&dyn SyncFilter>,
    ) -> Result<(Option<Arc<Node>>, bool), ShamapError> {
        if let Some(child) = parent.resolved_child(branch) {
            return Ok((Some(child), false));
        }
        let Some(hash) = parent.child_hash(branch) else {
            return Ok((None, false));
        };
        if let Some(filter) = filter {
            if let Some(bytes) = filter.try_fetch(&hash) {
                if let Ok(node) = codec::decode(&bytes, SerialFormat::Prefix, Some(&hash)) {
                    let mut node = Arc::new(node);
                    if self.backed {
                        node = self.store.canonicalize(&hash, node);
                    }
                    return Ok((Some(parent.canonicalize_child(branch, node)), false));
                }
            }
        }
        match self.store.fetch_async(&hash)? {
            AsyncFetch::Found(node) => Ok((Some(parent.canonicalize_child(branch, node)), false)),
            AsyncFetch::Pending => Ok((None, true)),
            AsyncFetch::NotFound => Ok((None, false)),
        }
    }
}

/// Builds and persists the subtree covering `items`, which are sorted,
/// unique, and all share their first `depth` nibbles.
fn build_subtree(
    store: &dyn NodeStore,
    items: &[Item],
    depth: usize,
) -> Result<Arc<Node>, ShamapError> {
    if items.len() == 1 {
        return persist_node(store, Node::Leaf(LeafNode::new(items[0].clone())));
    }
    if depth >= KEY_NIBBLES {
        return Err(ShamapError::Malformed("key collision beyond maximum depth"));
    }
    let mut branches: [Branch; BRANCH_COUNT] = array::from_fn(|_| Branch::Empty);
    let mut start = 0;
    while start < items.len() {
        let nibble = items[start].key.nibble(depth);
        let mut end = start;
        while end < items.len() && items[end].key.nibble(depth) == nibble {
            end += 1;
        }
        let child = build_subtree(store, &items[start..end], depth + 1)?;
        let hash = child.hash();
        branches[nibble as usize] = Branch::Resolved(child, hash);
        start = end;
    }
    persist_node(store, Node::Inner(InnerNode::from_branches(branches, None)))
}

fn persist_node(store: &dyn NodeStore, node: Node) -> Result<Arc<Node>, ShamapError> {
    let node = Arc::new(node);
    let hash = node.hash();
    store.put(&hash, &codec::encode(&node, SerialFormat::Prefix))?;
    Ok(store.canonicalize(&hash, node))
}
