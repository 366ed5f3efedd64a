//! Versioned values and their causal clocks.
//!
//! A key's value is a `SiblingSet`: the set of concurrently written versions which have not
//! yet been superseded. Each `Sibling` carries a dotted version vector recording the write
//! event it was born from and the causal context observed at that time. Merging two sets
//! keeps every sibling which is not strictly dominated by another, so merge is commutative,
//! associative and idempotent, and replicas converge regardless of delivery order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, MAX_KEY_LENGTH};

/// The causal context observed by a writer: for each site, the highest write counter seen.
pub type CausalContext = BTreeMap<String, u64>;

/// A single write event at one site.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Dot {
    /// The site at which the write happened.
    pub site_id: String,
    /// The site-local sequence number of the write.
    pub counter: u64,
}

/// A dotted version vector: one write event plus the causal context it happened in.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DottedVersion {
    /// The write event this clock identifies.
    pub dot: Dot,
    /// The causal context observed when the write happened.
    pub context: CausalContext,
}

impl DottedVersion {
    /// Check whether this clock's write event is contained in `other`'s causal history.
    ///
    /// Two clocks with distinct dots are concurrent when neither dominates the other.
    pub fn dominated_by(&self, other: &DottedVersion) -> bool {
        if self == other {
            return false;
        }
        if other.dot.site_id == self.dot.site_id && other.dot.counter >= self.dot.counter {
            return true;
        }
        other.context.get(&self.dot.site_id).copied().unwrap_or(0) >= self.dot.counter
    }
}

/// One version of a key's value.
///
/// A sibling with no value is a tombstone. Tombstones keep the timestamp of the oldest
/// deletion they supersede, which is how the garbage collector proves a deletion's age.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Sibling {
    /// The clock of the write which produced this sibling.
    pub clock: DottedVersion,
    /// The written value, or `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// The seconds timestamp of the write.
    pub timestamp: u64,
}

impl Sibling {
    /// Create a new value sibling.
    pub fn new(clock: DottedVersion, value: Vec<u8>, timestamp: u64) -> Self {
        Self { clock, value: Some(value), timestamp }
    }

    /// Create a new tombstone sibling.
    pub fn tombstone(clock: DottedVersion, timestamp: u64) -> Self {
        Self { clock, value: None, timestamp }
    }

    /// Check if this sibling is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// The set of concurrent versions currently held for one key.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SiblingSet {
    siblings: BTreeMap<DottedVersion, Sibling>,
}

impl SiblingSet {
    /// Create a set holding the given siblings.
    pub fn from_siblings(siblings: impl IntoIterator<Item = Sibling>) -> Self {
        Self {
            siblings: siblings.into_iter().map(|sibling| (sibling.clock.clone(), sibling)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sibling> {
        self.siblings.values()
    }

    /// Check if the set holds a sibling with the given clock.
    pub fn has(&self, clock: &DottedVersion) -> bool {
        self.siblings.contains_key(clock)
    }

    /// Check if every sibling in the set is a tombstone.
    ///
    /// Such a set represents a deleted key awaiting garbage collection.
    pub fn is_tombstone_set(&self) -> bool {
        !self.siblings.is_empty() && self.siblings.values().all(Sibling::is_tombstone)
    }

    /// The tombstone with the lowest timestamp, if any.
    pub fn oldest_tombstone(&self) -> Option<&Sibling> {
        self.siblings.values().filter(|s| s.is_tombstone()).min_by_key(|s| s.timestamp)
    }

    /// Compute the causal context covering every event recorded in the set.
    pub fn join(&self) -> CausalContext {
        let mut context = CausalContext::new();
        for sibling in self.siblings.values() {
            let dot = &sibling.clock.dot;
            let seen = context.entry(dot.site_id.clone()).or_insert(0);
            *seen = (*seen).max(dot.counter);
            for (site, counter) in sibling.clock.context.iter() {
                let seen = context.entry(site.clone()).or_insert(0);
                *seen = (*seen).max(*counter);
            }
        }
        context
    }

    /// Derive the clock for a new write at `site_id` on top of the given causal context.
    ///
    /// The new dot's counter exceeds both the submitted context and every event for the site
    /// already present in the set, so the new sibling is never dominated by existing state.
    pub fn event(&self, context: CausalContext, site_id: &str) -> DottedVersion {
        let mut counter = context.get(site_id).copied().unwrap_or(0);
        for sibling in self.siblings.values() {
            if sibling.clock.dot.site_id == site_id {
                counter = counter.max(sibling.clock.dot.counter);
            }
            counter = counter.max(sibling.clock.context.get(site_id).copied().unwrap_or(0));
        }
        DottedVersion {
            dot: Dot { site_id: site_id.to_string(), counter: counter + 1 },
            context,
        }
    }

    /// Drop every sibling whose clock is dominated by the given clock.
    pub fn discard(&self, clock: &DottedVersion) -> SiblingSet {
        Self {
            siblings: self
                .siblings
                .iter()
                .filter(|(_, sibling)| !sibling.clock.dominated_by(clock))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Merge two sets, keeping every sibling not strictly dominated by another.
    pub fn sync(&self, other: &SiblingSet) -> SiblingSet {
        let mut merged: BTreeMap<DottedVersion, Sibling> = BTreeMap::new();
        for sibling in self.siblings.values().chain(other.siblings.values()) {
            let dominated = self
                .siblings
                .values()
                .chain(other.siblings.values())
                .any(|candidate| sibling.clock.dominated_by(&candidate.clock));
            if !dominated {
                merged.insert(sibling.clock.clone(), sibling.clone());
            }
        }
        Self { siblings: merged }
    }
}

/// How a bucket resolves concurrent writes to the same key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConflictResolution {
    /// Keep all concurrent siblings and let readers resolve them.
    MergeSiblings,
    /// Keep only the sibling with the newest timestamp.
    LastWriterWins,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self::MergeSiblings
    }
}

impl ConflictResolution {
    /// Apply this policy to the given set.
    pub fn resolve(&self, set: SiblingSet) -> SiblingSet {
        match self {
            Self::MergeSiblings => set,
            Self::LastWriterWins => {
                let newest = set
                    .siblings
                    .values()
                    .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.clock.cmp(&b.clock)))
                    .cloned();
                match newest {
                    Some(newest) => SiblingSet::from_siblings(vec![newest]),
                    None => set,
                }
            }
        }
    }
}

/// A single operation within an update batch.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum BatchOp {
    /// Write the given value.
    Put(Vec<u8>),
    /// Delete the key, leaving a tombstone.
    Delete,
}

/// A batch of client write operations with their causal contexts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateBatch {
    ops: BTreeMap<Vec<u8>, BatchOp>,
    contexts: BTreeMap<Vec<u8>, CausalContext>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>, context: CausalContext) -> Result<&mut Self, AppError> {
        Self::validate_key(key)?;
        self.ops.insert(key.to_vec(), BatchOp::Put(value));
        self.contexts.insert(key.to_vec(), context);
        Ok(self)
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, key: &[u8], context: CausalContext) -> Result<&mut Self, AppError> {
        Self::validate_key(key)?;
        self.ops.insert(key.to_vec(), BatchOp::Delete);
        self.contexts.insert(key.to_vec(), context);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &BTreeMap<Vec<u8>, BatchOp> {
        &self.ops
    }

    pub fn context(&self, key: &[u8]) -> CausalContext {
        self.contexts.get(key).cloned().unwrap_or_default()
    }

    /// The sorted, de-duplicated keys touched by this batch.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let keys: BTreeSet<Vec<u8>> = self.ops.keys().cloned().collect();
        keys.into_iter().collect()
    }

    fn validate_key(key: &[u8]) -> Result<(), AppError> {
        if key.is_empty() {
            return Err(AppError::Empty);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(AppError::Length);
        }
        Ok(())
    }
}
