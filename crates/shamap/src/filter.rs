//! Sync filters: an auxiliary cache and sink through which peer-supplied
//! node streams are surfaced to upper layers during acceptance.

use crate::hash::Hash256;
use crate::node::NodeKind;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub trait SyncFilter: Send + Sync {
    /// An alternate in-memory source for nodes that are not permanently
    /// stored yet. Returns prefix-format bytes.
    fn try_fetch(&self, hash: &Hash256) -> Option<Vec<u8>>;

    /// Called when a node has been accepted. `from_database` distinguishes
    /// nodes re-read from local storage from nodes supplied by a peer.
    fn got_node(&self, from_database: bool, hash: &Hash256, bytes: Vec<u8>, kind: NodeKind);
}

/// A filter backed by a plain map of prefix-format records. Everything it is
/// told about becomes fetchable, which is what acceptance pipelines use to
/// hold nodes that have not reached the persistent store yet.
#[derive(Default)]
pub struct MemorySyncFilter {
    records: RwLock<FxHashMap<Hash256, Vec<u8>>>,
}

impl MemorySyncFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl SyncFilter for MemorySyncFilter {
    fn try_fetch(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.records.read().get(hash).cloned()
    }

    fn got_node(&self, _from_database: bool, hash: &Hash256, bytes: Vec<u8>, _kind: NodeKind) {
        self.records.write().insert(*hash, bytes);
    }
}
