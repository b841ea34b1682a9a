//! Synchronization core of a radix-16 Merkle trie ("SHAMap"), the
//! authenticated state store of a distributed ledger.
//!
//! A local replica discovers which nodes it is missing
//! ([`SHAMap::get_missing_nodes`]), validates and grafts nodes peers supply
//! ([`SHAMap::add_root_node`], [`SHAMap::add_known_node`]), and serves the
//! mirror-image requests ([`SHAMap::get_node_fat`],
//! [`SHAMap::get_fetch_pack`]). Every accepted node is authenticated
//! against the hash the trie already references; sync may stall against a
//! hostile peer, but it never installs unverified data.
//!
//! Network I/O, peer scheduling, and persistence live elsewhere: the core
//! consumes a [`NodeStore`] and an optional [`SyncFilter`] and exposes the
//! operations above.

pub mod cache;
pub mod codec;
mod diff;
pub mod error;
pub mod filter;
mod hash;
mod map;
mod node;
mod node_id;
pub mod store;
mod sync;
mod visit;

pub use self::cache::FullBelowCache;
pub use self::codec::SerialFormat;
pub use self::error::ShamapError;
pub use self::filter::{MemorySyncFilter, SyncFilter};
pub use self::hash::{Hash256, HASH_SIZE, KEY_NIBBLES};
pub use self::map::{SHAMap, SyncState};
pub use self::node::{Branch, InnerNode, Item, LeafNode, Node, NodeKind, V2Info, BRANCH_COUNT};
pub use self::node_id::NodeId;
pub use self::store::{AsyncFetch, InMemoryNodeStore, NodeStore};
pub use self::sync::AddNodeResult;
