//! Acquiring a map from peers: discovering which nodes are missing,
//! validating and splicing nodes peers supply, and serving the mirror-image
//! requests.

use crate::codec::{self, SerialFormat};
use crate::error::ShamapError;
use crate::filter::SyncFilter;
use crate::hash::Hash256;
use crate::map::SHAMap;
use crate::node_id::NodeId;
use crate::node::{Node, BRANCH_COUNT};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Disposition of a peer-supplied node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeResult {
    /// Accepted and spliced in (or it advanced our knowledge of the map).
    Useful,
    /// Already present, or arrived when no longer needed.
    Duplicate,
    /// Malformed, mis-hashed, or answering a branch we do not reference.
    Invalid,
}

/// Resume record for one suspended inner node during discovery.
struct Frame {
    node: Arc<Node>,
    id: NodeId,
    first_child: u8,
    current_child: u8,
    full_below: bool,
}

impl SHAMap {
    /// Enumerates up to `max` nodes that this map references but that are
    /// not available locally, as `(position, hash)` request pairs.
    ///
    /// The traversal starts each inner node at a randomized branch so that
    /// concurrent callers over the same map produce mostly disjoint request
    /// sets. Reads the store can satisfy asynchronously are deferred and
    /// drained in batches through `wait_reads`; subtrees proven complete are
    /// memoized in the full-below cache so the next pass prunes them.
    ///
    /// Returns an empty list once everything is present, transitioning the
    /// map from `Synching` to `Valid`.
    pub fn get_missing_nodes(
        &self,
        max: usize,
        filter: Option<&dyn SyncFilter>,
    ) -> Result<Vec<(NodeId, Hash256)>, ShamapError> {
        let generation = self.full_below().generation();

        // A replica anchored at a hash it has not materialized yet needs the
        // root before anything else.
        if let Some(root_hash) = self.pending_root() {
            match self.fetch_node_nt(&root_hash, filter)? {
                Some(node) => {
                    if node.is_leaf() {
                        self.install_root(node);
                        self.clear_synching();
                        return Ok(Vec::new());
                    }
                    self.install_root(node);
                }
                None => return Ok(vec![(NodeId::root(), root_hash)]),
            }
        }

        let root = self.root();
        debug_assert!(!root.hash().is_zero());
        if root.hash().is_zero() {
            warn!("missing-node discovery on an empty map");
            return Ok(Vec::new());
        }
        if root.is_leaf() {
            if generation == 0 {
                self.clear_synching();
            } else {
                warn!("synching a map that is already complete");
            }
            return Ok(Vec::new());
        }
        if root
            .as_inner()
            .map_or(false, |inner| inner.is_full_below(generation))
        {
            self.clear_synching();
            return Ok(Vec::new());
        }

        let max_defer = self.store().desired_async_read_count();
        let mut missing: FxHashSet<Hash256> = FxHashSet::default();
        let mut result: Vec<(NodeId, Hash256)> = Vec::new();
        let mut remaining = max;

        loop {
            let mut deferred: Vec<(Arc<Node>, usize, NodeId)> = Vec::new();
            let mut stack: Vec<Frame> = Vec::new();

            let mut node = root.clone();
            let mut id = NodeId::root();
            let mut first_child = rand::random::<u8>();
            let mut current_child: u8 = 0;
            let mut full_below = true;

            'traverse: loop {
                while (current_child as usize) < BRANCH_COUNT {
                    let branch =
                        (first_child as usize + current_child as usize) % BRANCH_COUNT;
                    current_child += 1;

                    let inner = node.expect_inner()?;
                    let Some(child_hash) = inner.child_hash(branch) else {
                        continue;
                    };
                    if missing.contains(&child_hash) {
                        full_below = false;
                        continue;
                    }
                    if self.is_backed() && self.full_below().touch_if_exists(&child_hash) {
                        continue;
                    }

                    let child_id = id.child(branch as u8);
                    let (resolved, pending) = self.descend_async(inner, branch, filter)?;
                    match resolved {
                        None if pending => {
                            deferred.push((node.clone(), branch, child_id));
                            full_below = false;
                        }
                        None => {
                            // definitively absent: this is a request to make
                            missing.insert(child_hash);
                            result.push((child_id, child_hash));
                            remaining = remaining.saturating_sub(1);
                            if remaining == 0 {
                                return Ok(result);
                            }
                            full_below = false;
                        }
                        Some(child) => {
                            let explore = child
                                .as_inner()
                                .map_or(false, |inner| !inner.is_full_below(generation));
                            if explore {
                                stack.push(Frame {
                                    node: node.clone(),
                                    id,
                                    first_child,
                                    current_child,
                                    full_below,
                                });
                                id = Self::effective_node_id(&child, child_id);
                                node = child;
                                first_child = rand::random::<u8>();
                                current_child = 0;
                                full_below = true;
                            }
                        }
                    }
                }

                // every branch of this inner node has been examined
                if full_below {
                    let inner = node.expect_inner()?;
                    inner.set_full_below(generation);
                    if self.is_backed() {
                        self.full_below().insert(node.hash());
                    }
                }

                match stack.pop() {
                    Some(frame) => {
                        node = frame.node;
                        id = frame.id;
                        first_child = frame.first_child;
                        current_child = frame.current_child;
                        // was full below, and still is
                        full_below = frame.full_below && full_below;
                    }
                    None => break 'traverse,
                }
                if deferred.len() > max_defer {
                    break 'traverse;
                }
            }

            if deferred.is_empty() {
                break;
            }

            let started = Instant::now();
            self.store().wait_reads()?;
            let waited = started.elapsed();
            let reads = deferred.len();
            let mut hits = 0usize;

            for (parent, branch, child_id) in deferred {
                let inner = parent.expect_inner()?;
                let Some(child_hash) = inner.child_hash(branch) else {
                    continue;
                };
                match self.fetch_node_nt(&child_hash, filter)? {
                    Some(child) => {
                        hits += 1;
                        let child = if self.is_backed() {
                            self.store().canonicalize(&child_hash, child)
                        } else {
                            child
                        };
                        inner.canonicalize_child(branch, child);
                    }
                    None => {
                        if remaining > 0 && missing.insert(child_hash) {
                            result.push((child_id, child_hash));
                            remaining -= 1;
                        }
                    }
                }
            }

            if reads > 50 || waited.as_millis() > 50 {
                debug!(
                    reads,
                    hits,
                    waited_ms = waited.as_millis() as u64,
                    "drained deferred node reads"
                );
            }
            if remaining == 0 {
                return Ok(result);
            }
        }

        if result.is_empty() {
            self.clear_synching();
        }
        Ok(result)
    }

    /// `get_missing_nodes`, projected to just the hashes.
    pub fn get_needed_hashes(
        &self,
        max: usize,
        filter: Option<&dyn SyncFilter>,
    ) -> Result<Vec<Hash256>, ShamapError> {
        Ok(self
            .get_missing_nodes(max, filter)?
            .into_iter()
            .map(|(_, hash)| hash)
            .collect())
    }

    /// Validates and installs a peer-supplied root node.
    pub fn add_root_node(
        &self,
        expected: &Hash256,
        bytes: &[u8],
        format: SerialFormat,
        filter: Option<&dyn SyncFilter>,
    ) -> AddNodeResult {
        let current = self.root();
        if !current.hash().is_zero() {
            trace!("got root node, already have one");
            if current.hash() != *expected {
                warn!(installed = %current.hash(), claimed = %expected,
                    "root node claim disagrees with the installed root");
                debug_assert!(false, "root node claim disagrees with the installed root");
            }
            return AddNodeResult::Duplicate;
        }
        if let Some(pending) = self.pending_root() {
            if pending != *expected {
                warn!(anchored = %pending, claimed = %expected,
                    "root node does not match the anchored root hash");
                return AddNodeResult::Invalid;
            }
        }

        let node = match codec::decode(bytes, format, Some(expected)) {
            Ok(node) => Arc::new(node),
            Err(err) => {
                debug!(%err, "rejecting malformed root node");
                return AddNodeResult::Invalid;
            }
        };
        let node = if self.is_backed() {
            self.store().canonicalize(expected, node)
        } else {
            node
        };
        self.install_root(node.clone());
        if node.is_leaf() {
            self.clear_synching();
        }

        if let Some(filter) = filter {
            let prefix = codec::encode(&node, SerialFormat::Prefix);
            filter.got_node(false, expected, prefix, node.kind());
        }
        AddNodeResult::Useful
    }

    /// Validates a peer-supplied non-root node and splices it in at the
    /// position it was requested for.
    pub fn add_known_node(
        &self,
        claimed: &NodeId,
        bytes: &[u8],
        filter: Option<&dyn SyncFilter>,
    ) -> AddNodeResult {
        debug_assert!(!claimed.is_root(), "root nodes go through add_root_node");
        if claimed.is_root() {
            return AddNodeResult::Invalid;
        }
        if !self.is_synching() {
            trace!("add_known_node while not synching");
            return AddNodeResult::Duplicate;
        }

        let generation = self.full_below().generation();
        let new_node = codec::decode(bytes, SerialFormat::Wire, None)
            .ok()
            .map(Arc::new);

        let mut node = self.root();
        let mut id = NodeId::root();

        loop {
            let Some(inner) = node.as_inner() else {
                break;
            };
            if inner.is_full_below(generation) || id.depth() >= claimed.depth() {
                break;
            }

            let branch = id.select_branch(claimed.key());
            let Some(child_hash) = inner.child_hash(branch) else {
                warn!(%claimed, "peer answered a branch this map does not reference");
                return AddNodeResult::Invalid;
            };
            if self.full_below().touch_if_exists(&child_hash) {
                return AddNodeResult::Duplicate;
            }

            let child = match self.descend(inner, branch, filter) {
                Ok(child) => child,
                Err(err) => {
                    debug!(%err, "descend failed during node acceptance");
                    None
                }
            };

            match child {
                Some(child) => {
                    id = Self::effective_node_id(&child, id.child(branch as u8));
                    node = child;
                }
                None => {
                    // this branch is the splice point
                    let Some(new_node) = new_node.as_ref() else {
                        warn!(%claimed, "corrupt node received");
                        return AddNodeResult::Invalid;
                    };
                    if new_node.hash() != child_hash {
                        warn!(%claimed, "corrupt node received");
                        return AddNodeResult::Invalid;
                    }

                    let path_id = id.child(branch as u8);
                    if !new_node.is_in_bounds(&path_id) {
                        // the map is provably broken
                        self.set_invalid();
                        return AddNodeResult::Useful;
                    }
                    if self.is_inconsistent_node(new_node) {
                        self.set_invalid();
                        return AddNodeResult::Useful;
                    }

                    let hooks = match new_node.v2_info() {
                        Some(_) => path_id.has_common_prefix(claimed),
                        None => path_id == *claimed,
                    };
                    if !hooks {
                        // valid-looking node that does not fit where claimed
                        warn!(%claimed, walked = %path_id, "unable to hook node");
                        return AddNodeResult::Useful;
                    }

                    let mut accepted = new_node.clone();
                    if self.is_backed() {
                        accepted = self.store().canonicalize(&child_hash, accepted);
                    }
                    let accepted = inner.canonicalize_child(branch, accepted);

                    if let Some(filter) = filter {
                        let prefix = codec::encode(&accepted, SerialFormat::Prefix);
                        filter.got_node(false, &child_hash, prefix, accepted.kind());
                    }
                    return AddNodeResult::Useful;
                }
            }
        }

        trace!("got node, already had it (late)");
        AddNodeResult::Duplicate
    }

    /// Serves a node together with a bounded neighborhood of descendants,
    /// all in wire format.
    ///
    /// `depth` is the fan-out budget; chains of single-child inner nodes are
    /// followed without spending it. Leaves at the frontier are included
    /// only when `fat_leaves` is set. Returns `None` when `wanted` does not
    /// name a node of this map.
    pub fn get_node_fat(
        &self,
        wanted: &NodeId,
        fat_leaves: bool,
        depth: u32,
    ) -> Result<Option<Vec<(NodeId, Vec<u8>)>>, ShamapError> {
        let mut node = self.root();
        let mut id = NodeId::root();

        loop {
            let Some(inner) = node.as_inner() else {
                break;
            };
            if id.depth() >= wanted.depth() {
                break;
            }
            let branch = id.select_branch(wanted.key());
            if inner.is_empty_branch(branch) {
                return Ok(None);
            }
            let child = self.descend_throw(inner, branch)?;
            id = Self::effective_node_id(&child, id.child(branch as u8));
            node = child;
        }

        let reachable = match node.v2_info() {
            Some(_) => wanted.has_common_prefix(&id),
            None => *wanted == id,
        };
        if !reachable {
            warn!(%wanted, found = %id, "peer requested a node that is not in the map");
            return Ok(None);
        }
        if node.as_inner().map_or(false, |inner| inner.is_empty()) {
            warn!("peer requested an empty node");
            return Ok(None);
        }

        let mut out: Vec<(NodeId, Vec<u8>)> = Vec::new();
        let mut stack: Vec<(Arc<Node>, NodeId, u32)> = vec![(node, id, depth)];

        while let Some((node, id, depth)) = stack.pop() {
            out.push((id, codec::encode(&node, SerialFormat::Wire)));

            let Some(inner) = node.as_inner() else {
                continue;
            };
            let branch_count = inner.branch_count();
            // single-child chains are followed without spending the budget
            if depth == 0 && branch_count != 1 {
                continue;
            }
            for branch in 0..BRANCH_COUNT {
                if inner.is_empty_branch(branch) {
                    continue;
                }
                let child = self.descend_throw(inner, branch)?;
                let child_id = Self::effective_node_id(&child, id.child(branch as u8));
                if child.is_inner() && (depth > 1 || branch_count == 1) {
                    let child_depth = if branch_count > 1 { depth - 1 } else { depth };
                    stack.push((child, child_id, child_depth));
                } else if child.is_inner() || fat_leaves {
                    out.push((child_id, codec::encode(&child, SerialFormat::Wire)));
                }
            }
        }
        Ok(Some(out))
    }
}
