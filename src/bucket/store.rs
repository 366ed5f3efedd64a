//! The bucket store engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::bucket::merkle::{MerkleHash, MerkleTree};
use crate::bucket::multilock::MultiLock;
use crate::bucket::siblings::{BatchOp, ConflictResolution, Sibling, SiblingSet, UpdateBatch};
use crate::database::{Database, Tree};
use crate::error::{AppError, ERR_DB_FLUSH, ERR_ITER_FAILURE, MAX_KEY_LENGTH};
use crate::utils;

/// The key prefix under which merkle leaf hashes are kept: `0x00 || leaf(4B BE)`.
pub const PREFIX_MERKLE_LEAF: [u8; 1] = [0x00];
/// The key prefix under which per-leaf key markers are kept: `0x01 || leaf(4B BE) || key`.
///
/// A marker records that the user key contributes to the leaf, which is what allows a sync
/// session to enumerate the keys beneath one merkle node with a single range scan.
pub const PREFIX_LEAF_KEYS: [u8; 1] = [0x01];
/// The key prefix under which sibling sets are kept: `0x02 || key`.
pub const PREFIX_DATA: [u8; 1] = [0x02];

const ERR_DECODE_SIBLINGS: &str = "error decoding sibling set from storage";

/// Build the data key for the given user key.
fn data_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(PREFIX_DATA[0]);
    out.extend_from_slice(key);
    out
}

/// Build the leaf marker key for the given leaf and user key.
fn leaf_marker_key(leaf: u32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + key.len());
    out.extend_from_slice(&utils::encode_byte_prefix_u32(&PREFIX_LEAF_KEYS, leaf));
    out.extend_from_slice(key);
    out
}

/// The XOR-combined object hash a key contributes to its merkle leaf.
///
/// Tombstones contribute nothing, so replicas converge on leaf hashes once deletions are
/// purged on both sides.
fn object_hash(key: &[u8], set: &SiblingSet) -> Result<MerkleHash> {
    let mut hash = MerkleHash::default();
    for sibling in set.iter() {
        if sibling.is_tombstone() {
            continue;
        }
        let encoded = utils::bin_encode(&(key, &sibling.clock, &sibling.value))?;
        hash = hash.xor(MerkleHash::of(&encoded));
    }
    Ok(hash)
}

/// A staged change to one key, carrying its old and new sibling sets.
struct Diff {
    key: Vec<u8>,
    leaf: u32,
    old: SiblingSet,
    new: SiblingSet,
}

/// A per-bucket versioned key-value store with a merkle index for anti-entropy.
pub struct BucketStore {
    /// The site ID stamped into the causal clocks of writes accepted by this store.
    site_id: String,
    /// The DB tree backing this bucket.
    tree: Tree,
    /// The merkle tree indexing this bucket's keyspace.
    merkle: Arc<Mutex<MerkleTree>>,
    /// Per-key write locks.
    key_locks: MultiLock,
    /// Per-leaf write locks.
    leaf_locks: MultiLock,
    /// This bucket's conflict resolution mode.
    resolve: ConflictResolution,
}

impl BucketStore {
    /// Create a new instance, restoring merkle leaf hashes from disk.
    pub async fn new(site_id: &str, tree: Tree, merkle_depth: u8, resolve: ConflictResolution) -> Result<Self> {
        let mut merkle = MerkleTree::new(merkle_depth)?;
        let restore_tree = tree.clone();
        let leaves = Database::spawn_blocking(move || -> Result<Vec<(u32, MerkleHash)>> {
            let mut leaves = Vec::new();
            for kv_res in restore_tree.scan_prefix(&PREFIX_MERKLE_LEAF) {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                let leaf = utils::decode_u32(&key[1..]).context("error decoding merkle leaf key")?;
                let hash = MerkleHash::from_bytes(&val).map_err(anyhow::Error::from)?;
                leaves.push((leaf, hash));
            }
            Ok(leaves)
        })
        .await??;
        for (leaf, hash) in leaves {
            if !merkle.is_leaf(leaf) {
                anyhow::bail!("invalid leaf node {} in merkle keys", leaf);
            }
            merkle.set_leaf_hash(leaf, hash).map_err(anyhow::Error::from)?;
        }

        Ok(Self {
            site_id: site_id.to_string(),
            tree,
            merkle: Arc::new(Mutex::new(merkle)),
            key_locks: MultiLock::new(),
            leaf_locks: MultiLock::new(),
            resolve,
        })
    }

    /// The site ID of this store.
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// The hash of the merkle tree's root.
    pub fn merkle_root(&self) -> MerkleHash {
        self.lock_merkle().root_hash()
    }

    /// The hash of the given merkle heap node.
    pub fn merkle_node_hash(&self, node: u32) -> Result<MerkleHash, AppError> {
        self.lock_merkle().node_hash(node)
    }

    /// The depth of this bucket's merkle tree.
    pub fn merkle_depth(&self) -> u8 {
        self.lock_merkle().depth()
    }

    /// Fetch the sibling sets for the given keys.
    ///
    /// The result holds one entry per requested key, `None` where the key is unknown.
    #[tracing::instrument(level = "trace", skip(self, keys), err)]
    pub async fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<SiblingSet>>> {
        validate_keys(keys)?;
        let tree = self.tree.clone();
        let data_keys: Vec<Vec<u8>> = keys.iter().map(|key| data_key(key)).collect();
        let sets = Database::spawn_blocking(move || -> Result<Vec<Option<SiblingSet>>> {
            let mut sets = Vec::with_capacity(data_keys.len());
            for key in data_keys.iter() {
                let set = tree
                    .get(key)
                    .context("error reading sibling set from storage")?
                    .map(|raw| utils::bin_decode::<SiblingSet>(&raw).context(ERR_DECODE_SIBLINGS))
                    .transpose()?;
                sets.push(set);
            }
            Ok(sets)
        })
        .await??;
        Ok(sets)
    }

    /// Fetch all keys beginning with the given prefix, along with their sibling sets.
    #[tracing::instrument(level = "trace", skip(self, prefix), err)]
    pub async fn get_matches(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, SiblingSet)>> {
        if prefix.is_empty() {
            anyhow::bail!(AppError::Empty);
        }
        if prefix.len() > MAX_KEY_LENGTH {
            anyhow::bail!(AppError::Length);
        }
        let tree = self.tree.clone();
        let scan_prefix = data_key(prefix);
        let matches = Database::spawn_blocking(move || -> Result<Vec<(Vec<u8>, SiblingSet)>> {
            let mut matches = Vec::new();
            for kv_res in tree.scan_prefix(&scan_prefix) {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                let set: SiblingSet = utils::bin_decode(&val).context(ERR_DECODE_SIBLINGS)?;
                matches.push((key[1..].to_vec(), set));
            }
            Ok(matches)
        })
        .await??;
        Ok(matches)
    }

    /// Fetch every key stored beneath the given merkle node, along with its sibling set.
    ///
    /// This is the range transfer primitive used by anti-entropy sync sessions once a
    /// divergent subtree has been located.
    #[tracing::instrument(level = "trace", skip(self, node), err)]
    pub async fn get_sync_children(&self, node: u32) -> Result<Vec<(Vec<u8>, SiblingSet)>> {
        let (min_leaf, max_leaf) = self.lock_merkle().leaf_range(node).map_err(anyhow::Error::from)?;
        let tree = self.tree.clone();
        let start = utils::encode_byte_prefix_u32(&PREFIX_LEAF_KEYS, min_leaf);
        let stop = utils::encode_byte_prefix_u32(&PREFIX_LEAF_KEYS, max_leaf + 1);
        let children = Database::spawn_blocking(move || -> Result<Vec<(Vec<u8>, SiblingSet)>> {
            let mut children = Vec::new();
            for kv_res in tree.range(start.to_vec()..stop.to_vec()) {
                let (marker, _) = kv_res.context(ERR_ITER_FAILURE)?;
                let key = marker[5..].to_vec();
                let set = tree
                    .get(&data_key(&key))
                    .context("error reading sibling set from storage")?
                    .map(|raw| utils::bin_decode::<SiblingSet>(&raw).context(ERR_DECODE_SIBLINGS))
                    .transpose()?;
                if let Some(set) = set {
                    children.push((key, set));
                }
            }
            Ok(children)
        })
        .await??;
        Ok(children)
    }

    /// Apply a batch of client write operations.
    ///
    /// Each operation derives a new causal clock from its submitted context and the key's
    /// current sibling set, discards whatever that clock supersedes, and unions in the new
    /// sibling. All affected keys, leaf markers and leaf hashes are committed in one atomic
    /// storage batch. Returns the updated sibling sets.
    #[tracing::instrument(level = "trace", skip(self, batch), err)]
    pub async fn batch(&self, batch: UpdateBatch) -> Result<BTreeMap<Vec<u8>, SiblingSet>> {
        if batch.is_empty() {
            anyhow::bail!(AppError::Empty);
        }
        let keys = batch.keys();
        let (_key_guards, _leaf_guards) = self.lock_keys(&keys).await;
        let current = self.read_sets(&keys).await?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u64;
        let mut results = BTreeMap::new();
        let mut diffs = Vec::new();
        for (key, op) in batch.ops().iter() {
            let set = current.get(key).cloned().unwrap_or_default();
            if set.is_empty() {
                if let BatchOp::Delete = op {
                    continue;
                }
            }
            let mut context = batch.context(key);
            if context.is_empty() {
                context = set.join();
            }
            let clock = set.event(context, &self.site_id);
            let sibling = match op {
                BatchOp::Put(value) => Sibling::new(clock.clone(), value.clone(), now),
                BatchOp::Delete => {
                    let timestamp = set.oldest_tombstone().map(|t| t.timestamp).unwrap_or(now);
                    Sibling::tombstone(clock.clone(), timestamp)
                }
            };
            let updated = set.discard(&clock).sync(&SiblingSet::from_siblings(vec![sibling]));
            let resolved = self.resolve.resolve(updated);
            results.insert(key.clone(), resolved.clone());
            let leaf = self.lock_merkle().leaf_for_key(key);
            diffs.push(Diff { key: key.clone(), leaf, old: set, new: resolved });
        }

        self.commit_diffs(diffs).await?;
        Ok(results)
    }

    /// Merge sibling sets received from a peer during anti-entropy sync.
    ///
    /// Symmetric to `batch`, but incoming sets are unioned as-is rather than deriving new
    /// clocks, and the tree and storage are only touched when a merge actually adds state.
    #[tracing::instrument(level = "trace", skip(self, siblings), err)]
    pub async fn merge(&self, siblings: BTreeMap<Vec<u8>, SiblingSet>) -> Result<()> {
        if siblings.is_empty() {
            return Ok(());
        }
        let keys: Vec<Vec<u8>> = siblings.keys().cloned().collect();
        validate_keys(&keys)?;
        let (_key_guards, _leaf_guards) = self.lock_keys(&keys).await;
        let current = self.read_sets(&keys).await?;

        let mut diffs = Vec::new();
        for (key, incoming) in siblings.iter() {
            let mine = current.get(key).cloned().unwrap_or_default();
            let updated = incoming.sync(&mine);
            if updated == mine {
                continue;
            }
            let resolved = self.resolve.resolve(updated);
            let leaf = self.lock_merkle().leaf_for_key(key);
            diffs.push(Diff { key: key.clone(), leaf, old: mine, new: resolved });
        }
        if diffs.is_empty() {
            return Ok(());
        }
        self.commit_diffs(diffs).await
    }

    /// Acquire the key and leaf locks for the given keys, in sorted order.
    async fn lock_keys(&self, keys: &[Vec<u8>]) -> (Vec<crate::bucket::multilock::MultiLockGuard<'_>>, Vec<crate::bucket::multilock::MultiLockGuard<'_>>) {
        let mut sorted: Vec<&Vec<u8>> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut key_guards = Vec::with_capacity(sorted.len());
        for key in sorted.iter() {
            key_guards.push(self.key_locks.lock(key).await);
        }

        let mut leaves: Vec<u32> = {
            let merkle = self.lock_merkle();
            keys.iter().map(|key| merkle.leaf_for_key(key)).collect()
        };
        leaves.sort_unstable();
        leaves.dedup();
        let mut leaf_guards = Vec::with_capacity(leaves.len());
        for leaf in leaves.iter() {
            leaf_guards.push(self.leaf_locks.lock(&leaf.to_be_bytes()).await);
        }
        (key_guards, leaf_guards)
    }

    /// Read the current sibling sets of the given keys.
    async fn read_sets(&self, keys: &[Vec<u8>]) -> Result<BTreeMap<Vec<u8>, SiblingSet>> {
        let tree = self.tree.clone();
        let keys = keys.to_vec();
        let sets = Database::spawn_blocking(move || -> Result<BTreeMap<Vec<u8>, SiblingSet>> {
            let mut sets = BTreeMap::new();
            for key in keys.iter() {
                if let Some(raw) = tree.get(&data_key(key)).context("error reading sibling set from storage")? {
                    sets.insert(key.clone(), utils::bin_decode::<SiblingSet>(&raw).context(ERR_DECODE_SIBLINGS)?);
                }
            }
            Ok(sets)
        })
        .await??;
        Ok(sets)
    }

    /// Apply staged diffs to the merkle tree in memory, then commit all three key families in
    /// one atomic storage batch. On a storage failure the merkle deltas are reverted, which
    /// is a second XOR of the same values.
    async fn commit_diffs(&self, diffs: Vec<Diff>) -> Result<()> {
        if diffs.is_empty() {
            return Ok(());
        }

        // Stage merkle updates in memory, collecting the per-leaf deltas applied.
        let mut leaf_deltas: BTreeMap<u32, MerkleHash> = BTreeMap::new();
        for diff in diffs.iter() {
            let delta = object_hash(&diff.key, &diff.old)?.xor(object_hash(&diff.key, &diff.new)?);
            let entry = leaf_deltas.entry(diff.leaf).or_default();
            *entry = entry.xor(delta);
        }
        let leaf_hashes: Vec<(u32, MerkleHash)> = {
            let mut merkle = self.lock_merkle();
            for (leaf, delta) in leaf_deltas.iter() {
                merkle.apply_leaf_delta(*leaf, *delta).map_err(anyhow::Error::from)?;
            }
            leaf_deltas
                .keys()
                .map(|leaf| merkle.leaf_hash(*leaf).map(|hash| (*leaf, hash)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::from)?
        };

        // Stage all three key families into one batch.
        let mut batch = sled::Batch::default();
        for (leaf, hash) in leaf_hashes.iter() {
            batch.insert(
                utils::encode_byte_prefix_u32(&PREFIX_MERKLE_LEAF, *leaf).as_ref(),
                hash.to_bytes().as_ref(),
            );
        }
        let mut encode_failure = None;
        for diff in diffs.iter() {
            batch.insert(leaf_marker_key(diff.leaf, &diff.key), &[][..]);
            match utils::bin_encode(&diff.new) {
                Ok(encoded) => batch.insert(data_key(&diff.key), encoded),
                Err(err) => {
                    encode_failure = Some(err);
                    break;
                }
            }
        }

        let commit_res = match encode_failure {
            Some(err) => Err(err),
            None => {
                let tree = self.tree.clone();
                Database::spawn_blocking(move || -> Result<()> {
                    tree.apply_batch(batch).context("error applying bucket update batch")?;
                    tree.flush().context(ERR_DB_FLUSH)?;
                    Ok(())
                })
                .await
                .map_err(anyhow::Error::from)
                .and_then(|res| res)
            }
        };
        if let Err(err) = commit_res {
            let mut merkle = self.lock_merkle();
            for (leaf, delta) in leaf_deltas.iter() {
                let _ = merkle.apply_leaf_delta(*leaf, *delta);
            }
            return Err(err);
        }
        Ok(())
    }

    fn lock_merkle(&self) -> std::sync::MutexGuard<'_, MerkleTree> {
        self.merkle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Validate a set of user keys for emptiness and length.
fn validate_keys(keys: &[Vec<u8>]) -> Result<()> {
    if keys.is_empty() {
        anyhow::bail!(AppError::Empty);
    }
    for key in keys.iter() {
        if key.is_empty() {
            anyhow::bail!(AppError::Empty);
        }
        if key.len() > MAX_KEY_LENGTH {
            anyhow::bail!(AppError::Length);
        }
    }
    Ok(())
}
