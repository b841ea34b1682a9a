//! Node serialization.
//!
//! Two content-addressed encodings exist: the prefix format used inside the
//! node store (a 4-byte type tag followed by the node body) and the wire
//! format exchanged with peers (the node body followed by a 1-byte type
//! tag). A node's hash is always computed over its prefix-format bytes, so
//! both encodings authenticate the same content.

use crate::error::ShamapError;
use crate::hash::{Hash256, HASH_SIZE, KEY_NIBBLES};
use crate::node::{Branch, InnerNode, Item, LeafNode, Node, V2Info, BRANCH_COUNT};
use std::array;

/// Serialization format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFormat {
    /// Store-local: leading 4-byte tag. Hashes are computed over this form.
    Prefix,
    /// Network: trailing 1-byte type tag, compressed inner nodes allowed.
    Wire,
}

const PREFIX_INNER: &[u8; 4] = b"SINR";
const PREFIX_INNER_V2: &[u8; 4] = b"SIN2";
const PREFIX_LEAF: &[u8; 4] = b"SLFN";

const WIRE_INNER: u8 = 0;
const WIRE_INNER_COMPRESSED: u8 = 1;
const WIRE_LEAF: u8 = 2;
const WIRE_INNER_V2: u8 = 3;
const WIRE_INNER_V2_COMPRESSED: u8 = 4;

/// Inner nodes with fewer occupied branches than this go compressed on the
/// wire.
const COMPRESSED_BRANCH_THRESHOLD: usize = 12;

pub(crate) fn encode_prefix_inner(inner: &InnerNode) -> Vec<u8> {
    let branches = inner.branches_snapshot();
    let v2 = inner.v2_info();
    let mut out = Vec::with_capacity(4 + BRANCH_COUNT * HASH_SIZE + if v2.is_some() { 33 } else { 0 });
    out.extend_from_slice(if v2.is_some() {
        PREFIX_INNER_V2
    } else {
        PREFIX_INNER
    });
    for branch in &branches {
        out.extend_from_slice(branch.hash().unwrap_or(Hash256::ZERO).as_bytes());
    }
    if let Some(v2) = v2 {
        out.push(v2.depth);
        out.extend_from_slice(v2.key.as_bytes());
    }
    out
}

pub(crate) fn encode_prefix_leaf(leaf: &LeafNode) -> Vec<u8> {
    let item = leaf.item();
    let mut out = Vec::with_capacity(4 + item.data.len() + HASH_SIZE);
    out.extend_from_slice(PREFIX_LEAF);
    out.extend_from_slice(&item.data);
    out.extend_from_slice(item.key.as_bytes());
    out
}

fn encode_wire_inner(inner: &InnerNode) -> Vec<u8> {
    let branches = inner.branches_snapshot();
    let v2 = inner.v2_info();
    let occupied = branches.iter().filter(|b| !b.is_empty()).count();
    let compressed = occupied < COMPRESSED_BRANCH_THRESHOLD;

    let mut out = Vec::with_capacity(BRANCH_COUNT * HASH_SIZE + 2);
    if compressed {
        for (branch, slot) in branches.iter().enumerate() {
            if let Some(hash) = slot.hash() {
                out.extend_from_slice(hash.as_bytes());
                out.push(branch as u8);
            }
        }
    } else {
        for slot in &branches {
            out.extend_from_slice(slot.hash().unwrap_or(Hash256::ZERO).as_bytes());
        }
    }
    if let Some(v2) = v2 {
        out.push(v2.depth);
        out.extend_from_slice(v2.key.as_bytes());
    }
    out.push(match (compressed, v2.is_some()) {
        (false, false) => WIRE_INNER,
        (true, false) => WIRE_INNER_COMPRESSED,
        (false, true) => WIRE_INNER_V2,
        (true, true) => WIRE_INNER_V2_COMPRESSED,
    });
    out
}

fn encode_wire_leaf(leaf: &LeafNode) -> Vec<u8> {
    let item = leaf.item();
    let mut out = Vec::with_capacity(item.data.len() + HASH_SIZE + 1);
    out.extend_from_slice(&item.data);
    out.extend_from_slice(item.key.as_bytes());
    out.push(WIRE_LEAF);
    out
}

/// Serializes `node` in the requested format.
pub fn encode(node: &Node, format: SerialFormat) -> Vec<u8> {
    match (node, format) {
        (Node::Inner(inner), SerialFormat::Prefix) => encode_prefix_inner(inner),
        (Node::Inner(inner), SerialFormat::Wire) => encode_wire_inner(inner),
        (Node::Leaf(leaf), SerialFormat::Prefix) => encode_prefix_leaf(leaf),
        (Node::Leaf(leaf), SerialFormat::Wire) => encode_wire_leaf(leaf),
    }
}

/// Deserializes a node, validating structure and, when `expected` is given,
/// that the content hash matches. Peer-supplied bytes flow through here;
/// every malformation is an `Err`, never a panic.
pub fn decode(
    bytes: &[u8],
    format: SerialFormat,
    expected: Option<&Hash256>,
) -> Result<Node, ShamapError> {
    let node = match format {
        SerialFormat::Prefix => decode_prefix(bytes)?,
        SerialFormat::Wire => decode_wire(bytes)?,
    };
    if let Some(expected) = expected {
        let computed = node.hash();
        if computed != *expected {
            return Err(ShamapError::HashMismatch {
                expected: *expected,
                computed,
            });
        }
    }
    Ok(node)
}

fn decode_prefix(bytes: &[u8]) -> Result<Node, ShamapError> {
    if bytes.len() < 4 {
        return Err(ShamapError::Malformed("node shorter than its type tag"));
    }
    let (tag, body) = bytes.split_at(4);
    match tag {
        _ if tag == PREFIX_INNER => decode_inner(body, false),
        _ if tag == PREFIX_INNER_V2 => decode_inner(body, true),
        _ if tag == PREFIX_LEAF => decode_leaf(body),
        _ => Err(ShamapError::Malformed("unknown node type tag")),
    }
}

fn decode_wire(bytes: &[u8]) -> Result<Node, ShamapError> {
    let (&tag, body) = bytes
        .split_last()
        .ok_or(ShamapError::Malformed("empty wire node"))?;
    match tag {
        WIRE_INNER => decode_inner(body, false),
        WIRE_INNER_V2 => decode_inner(body, true),
        WIRE_INNER_COMPRESSED => decode_inner_compressed(body, false),
        WIRE_INNER_V2_COMPRESSED => decode_inner_compressed(body, true),
        WIRE_LEAF => decode_leaf(body),
        _ => Err(ShamapError::Malformed("unknown node type tag")),
    }
}

/// Splits the trailing `(depth, key)` attributes off a v2 inner body.
fn split_v2(body: &[u8]) -> Result<(&[u8], V2Info), ShamapError> {
    if body.len() < 1 + HASH_SIZE {
        return Err(ShamapError::Malformed("truncated v2 attributes"));
    }
    let (body, trailer) = body.split_at(body.len() - 1 - HASH_SIZE);
    let depth = trailer[0];
    if depth as usize > KEY_NIBBLES {
        return Err(ShamapError::Malformed("v2 depth beyond key width"));
    }
    let key = Hash256::from_slice(&trailer[1..])
        .ok_or(ShamapError::Malformed("truncated v2 attributes"))?;
    Ok((body, V2Info { depth, key }))
}

fn decode_inner(body: &[u8], v2: bool) -> Result<Node, ShamapError> {
    let (body, v2_info) = if v2 {
        let (body, info) = split_v2(body)?;
        (body, Some(info))
    } else {
        (body, None)
    };
    if body.len() != BRANCH_COUNT * HASH_SIZE {
        return Err(ShamapError::Malformed("full inner node has a bad length"));
    }
    let mut occupied = 0usize;
    let branches: [Branch; BRANCH_COUNT] = array::from_fn(|i| {
        let start = i * HASH_SIZE;
        // the length was checked above, so the slice is always 32 bytes
        match Hash256::from_slice(&body[start..start + HASH_SIZE]) {
            Some(hash) if !hash.is_zero() => {
                occupied += 1;
                Branch::Hash(hash)
            }
            _ => Branch::Empty,
        }
    });
    if occupied == 0 {
        return Err(ShamapError::Malformed("inner node with no branches"));
    }
    Ok(Node::Inner(InnerNode::from_branches(branches, v2_info)))
}

fn decode_inner_compressed(body: &[u8], v2: bool) -> Result<Node, ShamapError> {
    let (body, v2_info) = if v2 {
        let (body, info) = split_v2(body)?;
        (body, Some(info))
    } else {
        (body, None)
    };
    if body.is_empty() || body.len() % (HASH_SIZE + 1) != 0 {
        return Err(ShamapError::Malformed(
            "compressed inner node has a bad length",
        ));
    }
    let mut branches: [Branch; BRANCH_COUNT] = array::from_fn(|_| Branch::Empty);
    for entry in body.chunks_exact(HASH_SIZE + 1) {
        let hash = Hash256::from_slice(&entry[..HASH_SIZE])
            .ok_or(ShamapError::Malformed("truncated branch entry"))?;
        let branch = entry[HASH_SIZE] as usize;
        if branch >= BRANCH_COUNT {
            return Err(ShamapError::Malformed("branch number out of range"));
        }
        if hash.is_zero() {
            return Err(ShamapError::Malformed("zero hash in compressed inner"));
        }
        if !branches[branch].is_empty() {
            return Err(ShamapError::Malformed("duplicate branch entry"));
        }
        branches[branch] = Branch::Hash(hash);
    }
    Ok(Node::Inner(InnerNode::from_branches(branches, v2_info)))
}

fn decode_leaf(body: &[u8]) -> Result<Node, ShamapError> {
    if body.len() <= HASH_SIZE {
        return Err(ShamapError::Malformed("leaf with no payload"));
    }
    let (data, key) = body.split_at(body.len() - HASH_SIZE);
    let key = Hash256::from_slice(key).ok_or(ShamapError::Malformed("truncated leaf key"))?;
    if key.is_zero() {
        return Err(ShamapError::Malformed("leaf with a zero key"));
    }
    Ok(Node::Leaf(LeafNode::new(Item::new(key, data.to_vec()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn leaf(seed: u8) -> Node {
        let key = Hash256::digest(&[&[seed]]);
        Node::Leaf(LeafNode::new(Item::new(key, vec![seed, seed + 1])))
    }

    fn inner_with(branch_seeds: &[(usize, u8)]) -> Node {
        let mut branches: [Branch; BRANCH_COUNT] = array::from_fn(|_| Branch::Empty);
        for &(branch, seed) in branch_seeds {
            let child = Arc::new(leaf(seed));
            let hash = child.hash();
            branches[branch] = Branch::Resolved(child, hash);
        }
        Node::Inner(InnerNode::from_branches(branches, None))
    }

    fn roundtrip(node: &Node, format: SerialFormat) -> Node {
        let bytes = encode(node, format);
        decode(&bytes, format, Some(&node.hash())).expect("roundtrip")
    }

    #[test]
    fn leaf_roundtrips_both_formats() {
        let node = leaf(1);
        for format in [SerialFormat::Prefix, SerialFormat::Wire] {
            let back = roundtrip(&node, format);
            assert_eq!(back.hash(), node.hash());
            assert_eq!(back.as_leaf().unwrap().item(), node.as_leaf().unwrap().item());
        }
    }

    #[test]
    fn sparse_inner_goes_compressed_on_the_wire() {
        let node = inner_with(&[(0, 1), (7, 2), (15, 3)]);
        let bytes = encode(&node, SerialFormat::Wire);
        assert_eq!(bytes.len(), 3 * (HASH_SIZE + 1) + 1);
        assert_eq!(*bytes.last().unwrap(), WIRE_INNER_COMPRESSED);
        let back = decode(&bytes, SerialFormat::Wire, Some(&node.hash())).unwrap();
        assert_eq!(back.hash(), node.hash());
    }

    #[test]
    fn dense_inner_goes_full_on_the_wire() {
        let seeds: Vec<(usize, u8)> = (0..12).map(|b| (b, b as u8 + 1)).collect();
        let node = inner_with(&seeds);
        let bytes = encode(&node, SerialFormat::Wire);
        assert_eq!(bytes.len(), BRANCH_COUNT * HASH_SIZE + 1);
        assert_eq!(*bytes.last().unwrap(), WIRE_INNER);
        assert_eq!(roundtrip(&node, SerialFormat::Wire).hash(), node.hash());
    }

    #[test]
    fn v2_inner_carries_its_position() {
        let key = Hash256::digest(&[b"position"]);
        let mut branches: [Branch; BRANCH_COUNT] = array::from_fn(|_| Branch::Empty);
        branches[4] = Branch::Hash(Hash256::digest(&[b"child"]));
        let node = Node::Inner(InnerNode::from_branches(
            branches,
            Some(V2Info { depth: 9, key }),
        ));
        for format in [SerialFormat::Prefix, SerialFormat::Wire] {
            let back = roundtrip(&node, format);
            let v2 = back.v2_info().expect("v2 attributes survive");
            assert_eq!(v2.depth, 9);
            assert_eq!(v2.key, key);
        }
    }

    #[test]
    fn rejects_empty_inner() {
        let body = vec![0u8; BRANCH_COUNT * HASH_SIZE];
        let mut wire = body.clone();
        wire.push(WIRE_INNER);
        assert!(decode(&wire, SerialFormat::Wire, None).is_err());

        let mut prefix = PREFIX_INNER.to_vec();
        prefix.extend_from_slice(&body);
        assert!(decode(&prefix, SerialFormat::Prefix, None).is_err());
    }

    #[test]
    fn rejects_duplicate_compressed_branch() {
        let hash = Hash256::digest(&[b"dup"]);
        let mut wire = Vec::new();
        for _ in 0..2 {
            wire.extend_from_slice(hash.as_bytes());
            wire.push(3);
        }
        wire.push(WIRE_INNER_COMPRESSED);
        assert!(decode(&wire, SerialFormat::Wire, None).is_err());
    }

    #[test]
    fn rejects_branch_out_of_range() {
        let mut wire = Vec::new();
        wire.extend_from_slice(Hash256::digest(&[b"x"]).as_bytes());
        wire.push(16);
        wire.push(WIRE_INNER_COMPRESSED);
        assert!(decode(&wire, SerialFormat::Wire, None).is_err());
    }

    #[test]
    fn rejects_zero_leaf_key_and_empty_payload() {
        let mut no_payload = Hash256::digest(&[b"k"]).as_bytes().to_vec();
        no_payload.push(WIRE_LEAF);
        assert!(decode(&no_payload, SerialFormat::Wire, None).is_err());

        let mut zero_key = vec![1u8, 2, 3];
        zero_key.extend_from_slice(Hash256::ZERO.as_bytes());
        zero_key.push(WIRE_LEAF);
        assert!(decode(&zero_key, SerialFormat::Wire, None).is_err());
    }

    #[test]
    fn rejects_wrong_expected_hash() {
        let node = leaf(9);
        let bytes = encode(&node, SerialFormat::Wire);
        let wrong = Hash256::digest(&[b"not it"]);
        match decode(&bytes, SerialFormat::Wire, Some(&wrong)) {
            Err(ShamapError::HashMismatch { expected, computed }) => {
                assert_eq!(expected, wrong);
                assert_eq!(computed, node.hash());
            }
            other => panic!("expected a hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_v2_depth() {
        let mut branches = vec![];
        branches.extend_from_slice(Hash256::digest(&[b"c"]).as_bytes());
        branches.push(0);
        branches.push(65); // depth
        branches.extend_from_slice(Hash256::digest(&[b"k"]).as_bytes());
        branches.push(WIRE_INNER_V2_COMPRESSED);
        assert!(decode(&branches, SerialFormat::Wire, None).is_err());
    }

    #[test]
    fn wire_and_prefix_hash_identically() {
        let node = inner_with(&[(2, 5), (9, 6)]);
        let from_wire = decode(&encode(&node, SerialFormat::Wire), SerialFormat::Wire, None).unwrap();
        let from_prefix = decode(
            &encode(&node, SerialFormat::Prefix),
            SerialFormat::Prefix,
            None,
        )
        .unwrap();
        assert_eq!(from_wire.hash(), from_prefix.hash());
        assert_eq!(from_wire.hash(), node.hash());
    }
}
