//! Process-wide memoization of "this subtree is fully present locally".
//!
//! The cache holds hashes only, never nodes. Entries are implicitly tagged
//! by the generation counter: bumping the generation is a global
//! invalidation barrier, so a node's locally cached `full_below` claim is
//! only trusted while its recorded generation equals the current one.

use crate::hash::Hash256;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default capacity for the hash LRU.
const DEFAULT_CAPACITY: usize = 100_000;

pub struct FullBelowCache {
    /// Current generation. Starts at 1 so that a node's zero-initialized
    /// `full_below_gen` never matches by accident.
    generation: AtomicU32,
    entries: RwLock<LruCache<Hash256, ()>>,
}

impl FullBelowCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            generation: AtomicU32::new(1),
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Invalidates every full-below claim made so far.
    pub fn bump_generation(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn insert(&self, hash: Hash256) {
        self.entries.write().put(hash, ());
    }

    /// True if `hash` is cached; a hit refreshes its LRU position.
    pub fn touch_if_exists(&self, hash: &Hash256) -> bool {
        self.entries.write().get(hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for FullBelowCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: u8) -> Hash256 {
        Hash256::digest(&[&[seed]])
    }

    #[test]
    fn empty_cache_misses() {
        let cache = FullBelowCache::new();
        assert!(!cache.touch_if_exists(&hash(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_then_touch() {
        let cache = FullBelowCache::new();
        cache.insert(hash(2));
        assert!(cache.touch_if_exists(&hash(2)));
        assert!(!cache.touch_if_exists(&hash(3)));
    }

    #[test]
    fn generation_starts_above_node_default() {
        // fresh inner nodes record generation zero; the cache must never
        // report that as current
        let cache = FullBelowCache::new();
        assert!(cache.generation() > 0);
    }

    #[test]
    fn bump_invalidates_everything() {
        let cache = FullBelowCache::new();
        let before = cache.generation();
        for seed in 0..8 {
            cache.insert(hash(seed));
        }
        cache.bump_generation();
        assert_eq!(cache.generation(), before + 1);
        for seed in 0..8 {
            assert!(!cache.touch_if_exists(&hash(seed)));
        }
    }

    #[test]
    fn touch_refreshes_recency() {
        let cache = FullBelowCache::with_capacity(2);
        cache.insert(hash(1));
        cache.insert(hash(2));
        assert!(cache.touch_if_exists(&hash(1)));
        cache.insert(hash(3)); // evicts 2, the least recently used
        assert!(cache.touch_if_exists(&hash(1)));
        assert!(!cache.touch_if_exists(&hash(2)));
        assert!(cache.touch_if_exists(&hash(3)));
    }
}
