use std::collections::BTreeMap;

use anyhow::Result;

use crate::bucket::siblings::{CausalContext, ConflictResolution, SiblingSet, UpdateBatch};
use crate::bucket::store::BucketStore;
use crate::config::Config;
use crate::database::Database;
use crate::error::{AppError, MAX_KEY_LENGTH};

async fn setup_store(site_id: &str) -> Result<(BucketStore, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_bucket_tree("default").await?;
    let store = BucketStore::new(site_id, tree, config.merkle_depth, ConflictResolution::MergeSiblings).await?;
    Ok((store, db, tmpdir))
}

fn put_batch(pairs: &[(&str, &str)]) -> Result<UpdateBatch> {
    let mut batch = UpdateBatch::new();
    for (key, value) in pairs.iter() {
        batch.put(key.as_bytes(), value.as_bytes().to_vec(), CausalContext::new())?;
    }
    Ok(batch)
}

#[tokio::test]
async fn batch_put_then_get_returns_the_value() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;

    store.batch(put_batch(&[("sensors.lights.hue", "on")])?).await?;

    let sets = store.get(&[b"sensors.lights.hue".to_vec()]).await?;
    let set = sets[0].as_ref().expect("expected a sibling set for the written key");
    assert_eq!(set.len(), 1);
    assert_eq!(set.iter().next().unwrap().value.as_deref(), Some(b"on".as_ref()));
    Ok(())
}

#[tokio::test]
async fn get_returns_none_for_unknown_keys() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;

    let sets = store.get(&[b"missing".to_vec()]).await?;

    assert!(sets[0].is_none());
    Ok(())
}

#[tokio::test]
async fn sequential_writes_supersede_rather_than_fork() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;

    store.batch(put_batch(&[("key", "v1")])?).await?;
    store.batch(put_batch(&[("key", "v2")])?).await?;

    let sets = store.get(&[b"key".to_vec()]).await?;
    let set = sets[0].as_ref().unwrap();
    assert_eq!(set.len(), 1, "a write with a fresh read context must supersede the prior value");
    assert_eq!(set.iter().next().unwrap().value.as_deref(), Some(b"v2".as_ref()));
    Ok(())
}

#[tokio::test]
async fn delete_leaves_a_tombstone_and_preserves_its_age() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;
    store.batch(put_batch(&[("key", "v1")])?).await?;

    let mut delete = UpdateBatch::new();
    delete.delete(b"key", CausalContext::new())?;
    store.batch(delete).await?;

    let sets = store.get(&[b"key".to_vec()]).await?;
    let set = sets[0].as_ref().unwrap();
    assert!(set.is_tombstone_set(), "expected a tombstone set after delete");
    let first_ts = set.oldest_tombstone().unwrap().timestamp;

    // A re-deletion carries the original tombstone's timestamp forward.
    let mut redelete = UpdateBatch::new();
    redelete.delete(b"key", CausalContext::new())?;
    store.batch(redelete).await?;
    let sets = store.get(&[b"key".to_vec()]).await?;
    assert_eq!(sets[0].as_ref().unwrap().oldest_tombstone().unwrap().timestamp, first_ts);
    Ok(())
}

#[tokio::test]
async fn delete_of_an_unknown_key_is_a_no_op() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;

    let mut batch = UpdateBatch::new();
    batch.delete(b"never-written", CausalContext::new())?;
    let results = store.batch(batch).await?;

    assert!(results.is_empty(), "deleting an unknown key must produce no update");
    assert!(store.get(&[b"never-written".to_vec()]).await?[0].is_none());
    Ok(())
}

#[tokio::test]
async fn batch_validation_rejects_bad_input() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;

    let mut batch = UpdateBatch::new();
    assert_eq!(batch.put(b"", b"v".to_vec(), CausalContext::new()).unwrap_err(), AppError::Empty);
    let long_key = vec![b'k'; MAX_KEY_LENGTH + 1];
    assert_eq!(batch.put(&long_key, b"v".to_vec(), CausalContext::new()).unwrap_err(), AppError::Length);

    let res = store.batch(UpdateBatch::new()).await;
    assert!(res.is_err(), "an empty batch must be rejected");
    Ok(())
}

#[tokio::test]
async fn merkle_root_tracks_writes_and_deletions() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;
    assert!(store.merkle_root().is_zero());

    store.batch(put_batch(&[("key", "v1")])?).await?;
    let root_after_write = store.merkle_root();
    assert!(!root_after_write.is_zero(), "a write must change the merkle root");

    // Tombstones contribute nothing to leaf hashes, so a deletion returns the root to its
    // pre-write value.
    let mut delete = UpdateBatch::new();
    delete.delete(b"key", CausalContext::new())?;
    store.batch(delete).await?;
    assert!(store.merkle_root().is_zero());
    Ok(())
}

#[tokio::test]
async fn merkle_state_survives_restart() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_bucket_tree("default").await?;
    let store = BucketStore::new("site-a", tree, config.merkle_depth, ConflictResolution::MergeSiblings).await?;
    store.batch(put_batch(&[("key-1", "v1"), ("key-2", "v2")])?).await?;
    let root = store.merkle_root();
    drop(store);

    let tree = db.get_bucket_tree("default").await?;
    let reopened = BucketStore::new("site-a", tree, config.merkle_depth, ConflictResolution::MergeSiblings).await?;

    assert_eq!(reopened.merkle_root(), root, "expected merkle state to be restored from disk");
    Ok(())
}

#[tokio::test]
async fn get_matches_filters_by_prefix() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;
    store
        .batch(put_batch(&[("sensors.temp", "20"), ("sensors.humidity", "40"), ("config.mode", "auto")])?)
        .await?;

    let mut matches = store.get_matches(b"sensors.").await?;
    matches.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].0, b"sensors.humidity".to_vec());
    assert_eq!(matches[1].0, b"sensors.temp".to_vec());
    Ok(())
}

#[tokio::test]
async fn get_sync_children_returns_keys_under_the_root() -> Result<()> {
    let (store, _db, _tmpdir) = setup_store("site-a").await?;
    store.batch(put_batch(&[("key-1", "v1"), ("key-2", "v2")])?).await?;

    let mut children = store.get_sync_children(1).await?;
    children.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(children.len(), 2);
    assert_eq!(children[0].0, b"key-1".to_vec());
    assert_eq!(children[1].0, b"key-2".to_vec());

    let res = store.get_sync_children(1 << 20).await;
    assert!(res.is_err(), "expected out of range merkle node to be rejected");
    Ok(())
}

#[tokio::test]
async fn merge_converges_replicas() -> Result<()> {
    let (store_a, _db_a, _tmpdir_a) = setup_store("site-a").await?;
    let (store_b, _db_b, _tmpdir_b) = setup_store("site-b").await?;
    store_a.batch(put_batch(&[("key-1", "v1"), ("key-2", "v2")])?).await?;

    let transferred: BTreeMap<Vec<u8>, SiblingSet> = store_a.get_sync_children(1).await?.into_iter().collect();
    store_b.merge(transferred.clone()).await?;

    assert_eq!(store_a.merkle_root(), store_b.merkle_root(), "expected replicas to converge after merge");

    // Merge is idempotent: replaying the same transfer changes nothing.
    let root = store_b.merkle_root();
    store_b.merge(transferred).await?;
    assert_eq!(store_b.merkle_root(), root);
    Ok(())
}

#[tokio::test]
async fn merkle_node_hashes_locate_the_divergent_subtree() -> Result<()> {
    let (store_a, _db_a, _tmpdir_a) = setup_store("site-a").await?;
    let (store_b, _db_b, _tmpdir_b) = setup_store("site-b").await?;
    store_a.batch(put_batch(&[("key-1", "v1")])?).await?;

    assert_ne!(store_a.merkle_node_hash(1)?, store_b.merkle_node_hash(1)?);

    // Walk the tree the way a sync session does: compare the children of the root and
    // recurse into whichever subtree disagrees.
    let mut node = 1u32;
    let leaf_count = 1u32 << store_a.merkle_depth();
    while node < leaf_count {
        let (left, right) = (node * 2, node * 2 + 1);
        node = if store_a.merkle_node_hash(left)? != store_b.merkle_node_hash(left)? {
            assert_eq!(store_a.merkle_node_hash(right)?, store_b.merkle_node_hash(right)?);
            left
        } else {
            assert_ne!(store_a.merkle_node_hash(right)?, store_b.merkle_node_hash(right)?);
            right
        };
    }

    // Transferring just the located subtree converges the replicas.
    let transferred: BTreeMap<Vec<u8>, SiblingSet> = store_a.get_sync_children(node).await?.into_iter().collect();
    assert_eq!(transferred.len(), 1, "expected the divergent leaf to hold exactly the written key");
    store_b.merge(transferred).await?;
    assert_eq!(store_a.merkle_node_hash(node)?, store_b.merkle_node_hash(node)?);
    assert_eq!(store_a.merkle_root(), store_b.merkle_root());

    assert_eq!(store_a.merkle_node_hash(1 << 20).unwrap_err(), AppError::MerkleRange);
    Ok(())
}

#[tokio::test]
async fn merge_keeps_concurrent_writes_as_siblings() -> Result<()> {
    let (store_a, _db_a, _tmpdir_a) = setup_store("site-a").await?;
    let (store_b, _db_b, _tmpdir_b) = setup_store("site-b").await?;

    // Both sites write the same key concurrently, neither having seen the other.
    store_a.batch(put_batch(&[("key", "from-a")])?).await?;
    store_b.batch(put_batch(&[("key", "from-b")])?).await?;

    let from_a: BTreeMap<Vec<u8>, SiblingSet> = store_a.get_sync_children(1).await?.into_iter().collect();
    store_b.merge(from_a).await?;

    let sets = store_b.get(&[b"key".to_vec()]).await?;
    let set = sets[0].as_ref().unwrap();
    assert_eq!(set.len(), 2, "concurrent writes must be kept as siblings");
    Ok(())
}

#[tokio::test]
async fn last_writer_wins_buckets_resolve_conflicts() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_bucket_tree("lww").await?;
    let store = BucketStore::new("site-a", tree, config.merkle_depth, ConflictResolution::LastWriterWins).await?;

    store.batch(put_batch(&[("key", "v1")])?).await?;
    store.batch(put_batch(&[("key", "v2")])?).await?;

    let sets = store.get(&[b"key".to_vec()]).await?;
    assert_eq!(sets[0].as_ref().unwrap().len(), 1);
    Ok(())
}
