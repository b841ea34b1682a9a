//! Node store contract and the in-memory reference backend.
//!
//! The store is an opaque, internally synchronized key-value collaborator:
//! hashes in, nodes out. It also hosts the canonicalizer that enforces the
//! single-resolved-instance-per-hash invariant, so sibling positions that
//! share a subtree share memory.

use crate::codec::{self, SerialFormat};
use crate::error::ShamapError;
use crate::hash::Hash256;
use crate::node::Node;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Outcome of a non-blocking fetch.
pub enum AsyncFetch {
    /// The node was already available.
    Found(Arc<Node>),
    /// A read is in flight; the node may appear after `wait_reads`.
    Pending,
    /// The node is definitively not present.
    NotFound,
}

pub trait NodeStore: Send + Sync {
    /// Blocking fetch. Returns the canonical instance for `hash`, or `None`
    /// if the store has no such record.
    fn fetch(&self, hash: &Hash256) -> Result<Option<Arc<Node>>, ShamapError>;

    /// Non-blocking fetch that may schedule a background read instead of
    /// resolving immediately.
    fn fetch_async(&self, hash: &Hash256) -> Result<AsyncFetch, ShamapError>;

    /// Blocks until every read scheduled by `fetch_async` has completed.
    fn wait_reads(&self) -> Result<(), ShamapError>;

    /// How many reads the store wants in flight before the caller should
    /// drain with `wait_reads`.
    fn desired_async_read_count(&self) -> usize;

    /// Install-or-adopt under hash identity: returns the previously
    /// canonical instance for `hash` if one exists, otherwise installs
    /// `node` and returns it.
    fn canonicalize(&self, hash: &Hash256, node: Arc<Node>) -> Arc<Node>;

    /// Persists a prefix-format record.
    fn put(&self, hash: &Hash256, bytes: &[u8]) -> Result<(), ShamapError>;
}

/// In-memory store. Records are prefix-format bytes; resolved nodes are
/// cached so repeated fetches return the same shared instance.
///
/// With async reads enabled, `fetch_async` on a present-but-unresolved
/// record parks the request until `wait_reads`, which is how the production
/// backend's background read pool behaves.
pub struct InMemoryNodeStore {
    records: RwLock<FxHashMap<Hash256, Vec<u8>>>,
    resolved: RwLock<FxHashMap<Hash256, Arc<Node>>>,
    pending: Mutex<Vec<Hash256>>,
    async_reads: bool,
    read_target: usize,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(FxHashMap::default()),
            resolved: RwLock::new(FxHashMap::default()),
            pending: Mutex::new(Vec::new()),
            async_reads: false,
            read_target: 0,
        }
    }

    /// A store whose reads park until `wait_reads`, keeping up to
    /// `read_target` of them in flight.
    pub fn with_async_reads(read_target: usize) -> Self {
        Self {
            async_reads: true,
            read_target,
            ..Self::new()
        }
    }

    /// A cold reopen: same records, empty resolved cache. Models a process
    /// restart over the same backing data.
    pub fn reopen(&self) -> Self {
        Self {
            records: RwLock::new(self.records.read().clone()),
            resolved: RwLock::new(FxHashMap::default()),
            pending: Mutex::new(Vec::new()),
            async_reads: self.async_reads,
            read_target: self.read_target,
        }
    }

    /// A cold reopen with async reads enabled.
    pub fn reopen_with_async_reads(&self, read_target: usize) -> Self {
        Self {
            async_reads: true,
            read_target,
            ..self.reopen()
        }
    }

    /// Drops a record, evicting any resolved instance with it.
    pub fn remove(&self, hash: &Hash256) {
        self.records.write().remove(hash);
        self.resolved.write().remove(hash);
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.records.read().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn resolve_record(&self, hash: &Hash256, bytes: &[u8]) -> Result<Arc<Node>, ShamapError> {
        let node = Arc::new(codec::decode(bytes, SerialFormat::Prefix, Some(hash))?);
        Ok(self.canonicalize(hash, node))
    }
}

impl Default for InMemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for InMemoryNodeStore {
    fn fetch(&self, hash: &Hash256) -> Result<Option<Arc<Node>>, ShamapError> {
        if let Some(node) = self.resolved.read().get(hash) {
            return Ok(Some(node.clone()));
        }
        let Some(bytes) = self.records.read().get(hash).cloned() else {
            return Ok(None);
        };
        self.resolve_record(hash, &bytes).map(Some)
    }

    fn fetch_async(&self, hash: &Hash256) -> Result<AsyncFetch, ShamapError> {
        if let Some(node) = self.resolved.read().get(hash) {
            return Ok(AsyncFetch::Found(node.clone()));
        }
        if !self.records.read().contains_key(hash) {
            return Ok(AsyncFetch::NotFound);
        }
        if !self.async_reads {
            return match self.fetch(hash)? {
                Some(node) => Ok(AsyncFetch::Found(node)),
                None => Ok(AsyncFetch::NotFound),
            };
        }
        let mut pending = self.pending.lock();
        if !pending.contains(hash) {
            pending.push(*hash);
        }
        Ok(AsyncFetch::Pending)
    }

    fn wait_reads(&self) -> Result<(), ShamapError> {
        let queued = std::mem::take(&mut *self.pending.lock());
        for hash in queued {
            if self.resolved.read().contains_key(&hash) {
                continue;
            }
            let Some(bytes) = self.records.read().get(&hash).cloned() else {
                continue;
            };
            self.resolve_record(&hash, &bytes)?;
        }
        Ok(())
    }

    fn desired_async_read_count(&self) -> usize {
        self.read_target
    }

    fn canonicalize(&self, hash: &Hash256, node: Arc<Node>) -> Arc<Node> {
        self.resolved.write().entry(*hash).or_insert(node).clone()
    }

    fn put(&self, hash: &Hash256, bytes: &[u8]) -> Result<(), ShamapError> {
        self.records.write().insert(*hash, bytes.to_vec());
        Ok(())
    }
}
