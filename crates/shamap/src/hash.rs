//! 256-bit content digest used for both node hashes and leaf keys.
//!
//! The digest is the first half of SHA-512 over the node's prefix-format
//! serialization. The all-zero value is reserved as the "empty/unknown"
//! sentinel and is never a valid content hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// Size of a digest in bytes.
pub const HASH_SIZE: usize = 32;

/// Number of 4-bit branch selectors in a 256-bit key.
pub const KEY_NIBBLES: usize = HASH_SIZE * 2;

/// An opaque 256-bit digest.
///
/// Totally ordered and hashable so it can key sets and caches. Keys that
/// index leaves are the same width and reuse this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash256([u8; HASH_SIZE]);

impl Hash256 {
    /// The zero sentinel: "empty branch" or "hash not known".
    pub const ZERO: Self = Self([0u8; HASH_SIZE]);

    #[inline]
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a digest from a slice; `None` if the length is not 32.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; HASH_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// SHA-512-half over the concatenation of `parts`.
    pub fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        let out = hasher.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&out[..HASH_SIZE]);
        Self(bytes)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// The `index`-th 4-bit branch selector, index 0 being the most
    /// significant nibble.
    #[inline]
    pub fn nibble(&self, index: usize) -> u8 {
        let byte = self.0[index / 2];
        if index % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    /// Returns a copy with the nibble at `index` replaced by `value`.
    #[inline]
    pub(crate) fn with_nibble(&self, index: usize, value: u8) -> Self {
        let mut bytes = self.0;
        let slot = &mut bytes[index / 2];
        if index % 2 == 0 {
            *slot = (*slot & 0x0F) | ((value & 0x0F) << 4);
        } else {
            *slot = (*slot & 0xF0) | (value & 0x0F);
        }
        Self(bytes)
    }

    /// Keeps the high `depth` nibbles and zeroes the rest.
    pub(crate) fn masked(&self, depth: u8) -> Self {
        let depth = depth as usize;
        let mut bytes = [0u8; HASH_SIZE];
        bytes[..depth / 2].copy_from_slice(&self.0[..depth / 2]);
        if depth % 2 == 1 {
            bytes[depth / 2] = self.0[depth / 2] & 0xF0;
        }
        Self(bytes)
    }
}

impl From<[u8; HASH_SIZE]> for Hash256 {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_sha512_half() {
        // First 32 bytes of SHA-512("")
        assert_eq!(
            Hash256::digest(&[]).to_string(),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce",
        );
    }

    #[test]
    fn digest_is_concatenation_invariant() {
        let split = Hash256::digest(&[b"hello ", b"world"]);
        let whole = Hash256::digest(&[b"hello world"]);
        assert_eq!(split, whole);
    }

    #[test]
    fn nibble_extraction() {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = 0xAB;
        bytes[31] = 0xCD;
        let hash = Hash256::new(bytes);
        assert_eq!(hash.nibble(0), 0xA);
        assert_eq!(hash.nibble(1), 0xB);
        assert_eq!(hash.nibble(62), 0xC);
        assert_eq!(hash.nibble(63), 0xD);
    }

    #[test]
    fn with_nibble_roundtrip() {
        let base = Hash256::ZERO;
        for i in 0..KEY_NIBBLES {
            let set = base.with_nibble(i, 0xF);
            assert_eq!(set.nibble(i), 0xF);
            assert_eq!(set.with_nibble(i, 0), base);
        }
    }

    #[test]
    fn masked_keeps_high_nibbles() {
        let full = Hash256::digest(&[b"key"]);
        assert_eq!(full.masked(0), Hash256::ZERO);
        assert_eq!(full.masked(64), full);
        let odd = full.masked(3);
        assert_eq!(odd.nibble(0), full.nibble(0));
        assert_eq!(odd.nibble(2), full.nibble(2));
        assert_eq!(odd.nibble(3), 0);
    }

    #[test]
    fn zero_sentinel() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256::digest(&[b"x"]).is_zero());
    }
}
