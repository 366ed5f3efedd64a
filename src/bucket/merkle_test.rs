use crate::bucket::merkle::{MerkleHash, MerkleTree, MERKLE_MAX_DEPTH, MERKLE_MIN_DEPTH};
use crate::error::AppError;

#[test]
fn new_rejects_out_of_range_depths() {
    assert!(MerkleTree::new(MERKLE_MIN_DEPTH - 1).is_err());
    assert!(MerkleTree::new(MERKLE_MAX_DEPTH + 1).is_err());
    assert!(MerkleTree::new(MERKLE_MIN_DEPTH).is_ok());
    assert!(MerkleTree::new(MERKLE_MAX_DEPTH).is_ok());
}

#[test]
fn leaf_mapping_is_stable_and_in_range() {
    let tree = MerkleTree::new(8).unwrap();
    for i in 0..1000u32 {
        let key = format!("key-{}", i);
        let leaf = tree.leaf_for_key(key.as_bytes());
        assert!(tree.is_leaf(leaf), "leaf {} out of range", leaf);
        assert_eq!(leaf, tree.leaf_for_key(key.as_bytes()), "leaf mapping must be deterministic");
    }
}

#[test]
fn apply_leaf_delta_propagates_to_the_root() {
    let mut tree = MerkleTree::new(4).unwrap();
    assert!(tree.root_hash().is_zero());

    let delta = MerkleHash::of(b"object");
    tree.apply_leaf_delta(3, delta).unwrap();

    assert_eq!(tree.leaf_hash(3).unwrap(), delta);
    assert_eq!(tree.root_hash(), delta);

    // Applying the same delta again cancels it out along the whole path.
    tree.apply_leaf_delta(3, delta).unwrap();
    assert!(tree.leaf_hash(3).unwrap().is_zero());
    assert!(tree.root_hash().is_zero());
}

#[test]
fn interior_nodes_combine_their_children() {
    let mut tree = MerkleTree::new(2).unwrap();
    let a = MerkleHash::of(b"a");
    let b = MerkleHash::of(b"b");
    tree.apply_leaf_delta(0, a).unwrap();
    tree.apply_leaf_delta(1, b).unwrap();

    // Leaves 0 and 1 share the parent heap node 2 in a depth-2 tree.
    assert_eq!(tree.node_hash(2).unwrap(), a.xor(b));
    assert_eq!(tree.root_hash(), a.xor(b));
}

#[test]
fn set_leaf_hash_overwrites_and_keeps_ancestors_consistent() {
    let mut tree = MerkleTree::new(3).unwrap();
    let first = MerkleHash::of(b"first");
    let second = MerkleHash::of(b"second");

    tree.set_leaf_hash(5, first).unwrap();
    assert_eq!(tree.leaf_hash(5).unwrap(), first);
    assert_eq!(tree.root_hash(), first);

    tree.set_leaf_hash(5, second).unwrap();
    assert_eq!(tree.leaf_hash(5).unwrap(), second);
    assert_eq!(tree.root_hash(), second);
}

#[test]
fn leaf_range_covers_the_subtree() {
    let tree = MerkleTree::new(3).unwrap();

    // The root covers every leaf.
    assert_eq!(tree.leaf_range(1).unwrap(), (0, 7));
    // Heap node 2 covers the left half, node 3 the right half.
    assert_eq!(tree.leaf_range(2).unwrap(), (0, 3));
    assert_eq!(tree.leaf_range(3).unwrap(), (4, 7));
    // A leaf-layer node covers just itself.
    assert_eq!(tree.leaf_range(8).unwrap(), (0, 0));
    assert_eq!(tree.leaf_range(15).unwrap(), (7, 7));
}

#[test]
fn out_of_range_nodes_are_rejected() {
    let tree = MerkleTree::new(3).unwrap();
    assert_eq!(tree.node_hash(0), Err(AppError::MerkleRange));
    assert_eq!(tree.node_hash(16), Err(AppError::MerkleRange));
    assert_eq!(tree.leaf_range(16), Err(AppError::MerkleRange));
    assert_eq!(tree.leaf_hash(8), Err(AppError::MerkleRange));
}

#[test]
fn hash_bytes_roundtrip() {
    let hash = MerkleHash::of(b"roundtrip");
    let bytes = hash.to_bytes();
    assert_eq!(MerkleHash::from_bytes(&bytes).unwrap(), hash);
    assert!(MerkleHash::from_bytes(&bytes[..8]).is_err());
}
