use crate::hash::Hash256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShamapError {
    #[error("malformed node: {0}")]
    Malformed(&'static str),
    #[error("node hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: Hash256,
        computed: Hash256,
    },
    #[error("inconsistent trie: node {0} referenced by a resolved parent is missing from the store")]
    InconsistentTree(Hash256),
    #[error("corrupt map structure: {0}")]
    Corrupt(&'static str),
    #[error("database error: {0}")]
    Db(anyhow::Error),
}
