//! The fixed-depth merkle tree indexing a bucket's keyspace.
//!
//! Every user key maps to one leaf; a leaf's hash is the XOR of the object hashes of all keys
//! mapped to it, and every interior node's hash is the XOR of its children. XOR makes updates
//! incremental: applying the delta between a key's old and new object hash to its leaf and
//! the leaf's ancestors is all that is needed to keep the whole tree consistent.

use crate::error::AppError;

/// The minimum allowed merkle tree depth.
pub const MERKLE_MIN_DEPTH: u8 = 1;
/// The maximum allowed merkle tree depth.
pub const MERKLE_MAX_DEPTH: u8 = 19;
/// The default merkle tree depth.
pub const MERKLE_DEFAULT_DEPTH: u8 = 19;

/// A 128-bit node hash.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MerkleHash(pub u128);

impl MerkleHash {
    /// Hash the given bytes.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Self(u128::from_be_bytes(bytes))
    }

    /// Combine with another hash.
    pub fn xor(self, other: MerkleHash) -> Self {
        Self(self.0 ^ other.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        if bytes.len() != 16 {
            return Err(AppError::InvalidInput(format!("invalid merkle hash length {}", bytes.len())));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Ok(Self(u128::from_be_bytes(buf)))
    }
}

/// A fixed-depth merkle tree over a bucket's keyspace.
///
/// Nodes are held in a 1-indexed heap layout: node 1 is the root, node `n` has children `2n`
/// and `2n + 1`, and the leaf layer occupies `[leaf_count, 2 * leaf_count)`. Leaves are
/// addressed externally by their 0-based leaf index.
pub struct MerkleTree {
    depth: u8,
    nodes: Vec<MerkleHash>,
}

impl MerkleTree {
    /// Create a new tree of the given depth with all hashes zeroed.
    pub fn new(depth: u8) -> Result<Self, AppError> {
        if depth < MERKLE_MIN_DEPTH || depth > MERKLE_MAX_DEPTH {
            return Err(AppError::InvalidInput(format!(
                "invalid merkle depth {}, valid range is {} to {} inclusive",
                depth, MERKLE_MIN_DEPTH, MERKLE_MAX_DEPTH
            )));
        }
        let leaf_count = 1usize << depth;
        Ok(Self { depth, nodes: vec![MerkleHash::default(); leaf_count * 2] })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The number of leaves in the tree.
    pub fn leaf_count(&self) -> u32 {
        1u32 << self.depth
    }

    /// One past the highest valid heap node ID.
    pub fn node_limit(&self) -> u32 {
        self.leaf_count() * 2
    }

    /// Check whether the given 0-based leaf index is valid for this tree.
    pub fn is_leaf(&self, leaf: u32) -> bool {
        leaf < self.leaf_count()
    }

    /// The leaf index the given user key maps to.
    pub fn leaf_for_key(&self, key: &[u8]) -> u32 {
        let digest = blake3::hash(key);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_be_bytes(bytes) % self.leaf_count() as u64) as u32
    }

    /// The hash of the tree's root.
    pub fn root_hash(&self) -> MerkleHash {
        self.nodes[1]
    }

    /// The hash of the given heap node.
    pub fn node_hash(&self, node: u32) -> Result<MerkleHash, AppError> {
        if node == 0 || node >= self.node_limit() {
            return Err(AppError::MerkleRange);
        }
        Ok(self.nodes[node as usize])
    }

    /// The current hash of the given leaf.
    pub fn leaf_hash(&self, leaf: u32) -> Result<MerkleHash, AppError> {
        if !self.is_leaf(leaf) {
            return Err(AppError::MerkleRange);
        }
        Ok(self.nodes[(self.leaf_count() + leaf) as usize])
    }

    /// XOR the given delta into a leaf and all of its ancestors.
    pub fn apply_leaf_delta(&mut self, leaf: u32, delta: MerkleHash) -> Result<(), AppError> {
        if !self.is_leaf(leaf) {
            return Err(AppError::MerkleRange);
        }
        let mut node = (self.leaf_count() + leaf) as usize;
        while node >= 1 {
            self.nodes[node] = self.nodes[node].xor(delta);
            node /= 2;
        }
        Ok(())
    }

    /// Overwrite a leaf's hash, updating ancestors accordingly.
    ///
    /// Used when restoring leaf hashes from disk.
    pub fn set_leaf_hash(&mut self, leaf: u32, hash: MerkleHash) -> Result<(), AppError> {
        let current = self.leaf_hash(leaf)?;
        self.apply_leaf_delta(leaf, current.xor(hash))
    }

    /// The inclusive range of leaf indices under the given heap node.
    ///
    /// Used to iterate all keys beneath one merkle node during anti-entropy sync.
    pub fn leaf_range(&self, node: u32) -> Result<(u32, u32), AppError> {
        if node == 0 || node >= self.node_limit() {
            return Err(AppError::MerkleRange);
        }
        let leaf_count = self.leaf_count();
        let mut min = node;
        while min < leaf_count {
            min *= 2;
        }
        let mut max = node;
        while max < leaf_count {
            max = max * 2 + 1;
        }
        Ok((min - leaf_count, max - leaf_count))
    }
}
