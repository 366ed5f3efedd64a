//! Durable Raft log storage.
//!
//! `RaftStorage` is a crash-safe adaptor between an in-memory Raft log structure and an
//! ordered key-value store. All reads served to the consensus library come from memory; every
//! mutation is mirrored to disk in exactly one atomic batch, and on any disk failure the
//! in-memory state is rolled back to its pre-operation snapshot so that memory and disk never
//! diverge.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, StorageError};
use sled::Batch;

use crate::database::Tree;
use crate::error::ERR_ITER_FAILURE;
use crate::utils;

/// The key under which the latest snapshot is kept.
pub const KEY_SNAPSHOT: [u8; 1] = [0x00];
/// The key under which the latest hard state is kept.
pub const KEY_HARD_STATE: [u8; 1] = [0x01];
/// The key prefix under which log entries are kept, suffixed with the entry index in
/// big-endian form to preserve log order in the tree.
pub const PREFIX_ENTRY: [u8; 1] = [0x02];

const ERR_ENCODE_ENTRY: &str = "error encoding raft log entry";
const ERR_DECODE_ENTRY: &str = "error decoding raft log entry";
const ERR_APPLY_BATCH: &str = "error applying batch to raft storage tree";
const ERR_FLUSH: &str = "error flushing raft storage tree";

/// Build the storage key for the log entry at the given index.
fn entry_key(index: u64) -> [u8; 9] {
    utils::encode_byte_prefix(&PREFIX_ENTRY, index)
}

/// Decode the entry index carried in the given storage key.
fn entry_index(key: &[u8]) -> Result<u64> {
    if key.len() != 9 || key[0] != PREFIX_ENTRY[0] {
        bail!("unable to decode entry key");
    }
    utils::decode_u64(&key[1..])
}

//////////////////////////////////////////////////////////////////////////////////////////////
// MemoryLog /////////////////////////////////////////////////////////////////////////////////

/// The in-memory Raft log, snapshot and hard state.
///
/// The entries vector always holds a sentinel entry at position 0 carrying the index and term
/// at which the log was last truncated, so `entries[0].index + 1` is the first live index.
/// The structure is cheaply cloneable, which is what makes the rollback discipline of
/// `RaftStorage` possible.
#[derive(Clone)]
pub(super) struct MemoryLog {
    hard_state: HardState,
    snapshot: Snapshot,
    entries: Vec<Entry>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        }
    }
}

impl MemoryLog {
    fn first_index(&self) -> u64 {
        self.entries[0].index + 1
    }

    fn last_index(&self) -> u64 {
        self.entries[0].index + self.entries.len() as u64 - 1
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let offset = self.entries[0].index;
        if idx < offset {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > self.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(self.entries[(idx - offset) as usize].term)
    }

    fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> raft::Result<Vec<Entry>> {
        if low <= self.entries[0].index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let offset = self.entries[0].index;
        let mut ents: Vec<Entry> = self.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        raft::util::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Append the given entries, overwriting any overlapping suffix of the log.
    ///
    /// Entries whose index precedes the first live index have already been compacted and are
    /// silently dropped. A gap between the log and the incoming entries is an error.
    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let first = self.first_index();
        let incoming_last = entries[0].index + entries.len() as u64 - 1;
        if incoming_last < first {
            return Ok(());
        }
        let entries = if first > entries[0].index {
            &entries[(first - entries[0].index) as usize..]
        } else {
            entries
        };
        let offset = entries[0].index - self.entries[0].index;
        if (self.entries.len() as u64) < offset {
            bail!(
                "log gap between last index {} and appended index {}",
                self.last_index(),
                entries[0].index
            );
        }
        self.entries.truncate(offset as usize);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Drop all entries up to and including the given index.
    fn compact(&mut self, compact_index: u64) -> Result<()> {
        let offset = self.entries[0].index;
        if compact_index <= offset {
            return Ok(());
        }
        if compact_index > self.last_index() {
            bail!("compaction index {} is beyond last index {}", compact_index, self.last_index());
        }
        // The entry at the compaction point becomes the new sentinel, preserving its term.
        self.entries.drain(..(compact_index - offset) as usize);
        Ok(())
    }

    /// Build a snapshot at the given index without touching the log.
    fn create_snapshot(&mut self, index: u64, conf_state: Option<ConfState>, data: Vec<u8>) -> Result<Snapshot> {
        if index <= self.snapshot.get_metadata().index {
            bail!("snapshot at index {} is out of date", index);
        }
        if index > self.last_index() {
            bail!("snapshot index {} is beyond last index {}", index, self.last_index());
        }
        let term = self.term(index).context("error resolving term for snapshot index")?;
        let meta = self.snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        if let Some(conf_state) = conf_state {
            meta.set_conf_state(conf_state);
        }
        self.snapshot.data = data;
        Ok(self.snapshot.clone())
    }

    /// Overwrite the log with the given snapshot.
    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        if index <= self.snapshot.get_metadata().index {
            bail!("snapshot at index {} is out of date", index);
        }
        let mut sentinel = Entry::default();
        sentinel.index = index;
        sentinel.term = snapshot.get_metadata().term;
        self.entries = vec![sentinel];
        self.snapshot = snapshot;
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////
// RaftStorage ///////////////////////////////////////////////////////////////////////////////

struct StorageCore {
    log: MemoryLog,
    is_open: bool,
    is_empty: bool,
}

/// The durable mirror of a Raft instance's log, hard state and snapshot.
#[derive(Clone)]
pub struct RaftStorage {
    inner: Arc<RaftStorageInner>,
}

struct RaftStorageInner {
    /// The DB tree holding this Raft's persisted state.
    tree: Tree,
    /// All in-memory state, serialized by a single mutex.
    core: Mutex<StorageCore>,
}

impl RaftStorage {
    /// Create a new instance over the given tree.
    ///
    /// The instance starts closed: until `open` is called it behaves as a purely in-memory
    /// storage, which is what the tests of higher layers rely on.
    pub fn new(tree: Tree) -> Self {
        Self {
            inner: Arc::new(RaftStorageInner {
                tree,
                core: Mutex::new(StorageCore { log: MemoryLog::default(), is_open: false, is_empty: true }),
            }),
        }
    }

    /// Load all persisted state from disk into memory.
    ///
    /// Entry keys are verified while loading: indices must be contiguous and each entry's
    /// decoded index must equal the index carried in its key.
    #[tracing::instrument(level = "trace", skip(self), err)]
    pub fn open(&self) -> Result<()> {
        let mut core = self.core();
        core.log = MemoryLog::default();
        core.is_empty = true;

        if let Some(raw) = self.inner.tree.get(KEY_SNAPSHOT).context("error reading snapshot from storage")? {
            let snapshot: Snapshot = utils::decode_proto(&raw).context("error decoding snapshot from storage")?;
            core.log.apply_snapshot(snapshot).context("error restoring snapshot")?;
            core.is_empty = false;
        }

        if let Some(raw) = self.inner.tree.get(KEY_HARD_STATE).context("error reading hard state from storage")? {
            core.log.hard_state = utils::decode_proto(&raw).context("error decoding hard state from storage")?;
            core.is_empty = false;
        }

        let mut entries = Vec::new();
        let mut last_index: Option<u64> = None;
        for kv_res in self.inner.tree.scan_prefix(&PREFIX_ENTRY) {
            let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
            let expected_index = entry_index(&key)?;
            if let Some(last) = last_index {
                if last + 1 != expected_index {
                    bail!("entry indices are not monotonically increasing");
                }
            }
            last_index = Some(expected_index);
            let entry: Entry = utils::decode_proto(&val).context(ERR_DECODE_ENTRY)?;
            if entry.index != expected_index {
                bail!("encoded entry index does not match the index in its key");
            }
            entries.push(entry);
            core.is_empty = false;
        }
        core.log.append(&entries).context("error restoring log entries")?;

        core.is_open = true;
        Ok(())
    }

    /// Check if any persisted state was found when this storage was opened.
    pub fn is_empty(&self) -> bool {
        self.core().is_empty
    }

    /// The index of the latest snapshot, or 0 if no snapshot has been taken.
    pub fn snapshot_index(&self) -> u64 {
        self.core().log.snapshot.get_metadata().index
    }

    /// The latest snapshot, if one has been taken or installed.
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        let core = self.core();
        if core.log.snapshot.get_metadata().index == 0 {
            return None;
        }
        Some(core.log.snapshot.clone())
    }

    /// Seed the in-memory conf state for a node bootstrapping a brand new cluster.
    ///
    /// Only valid on an empty storage. The conf state reaches disk with the first snapshot;
    /// until then a restart reconstructs it by replaying conf change entries.
    pub fn bootstrap_conf_state(&self, voters: Vec<u64>) -> Result<()> {
        let mut core = self.core();
        if core.log.last_index() != 0 || core.log.snapshot.get_metadata().index != 0 {
            bail!("refusing to bootstrap conf state over existing raft state");
        }
        core.log.snapshot.mut_metadata().mut_conf_state().voters = voters;
        Ok(())
    }

    /// Update the hard state, then atomically persist it.
    #[tracing::instrument(level = "trace", skip(self, hard_state), err)]
    pub fn set_hard_state(&self, hard_state: HardState) -> Result<()> {
        let mut core = self.core();
        let rollback = core.log.clone();
        core.log.hard_state = hard_state;
        if !core.is_open {
            return Ok(());
        }
        let encoded = utils::encode_proto(&core.log.hard_state).context("error encoding hard state")?;
        let mut batch = Batch::default();
        batch.insert(&KEY_HARD_STATE, encoded);
        if let Err(err) = self.commit_batch(batch) {
            core.log = rollback;
            return Err(err);
        }
        Ok(())
    }

    /// Update the commit index of the hard state, then atomically persist it.
    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let hard_state = {
            let mut hs = self.core().log.hard_state.clone();
            hs.commit = commit;
            hs
        };
        self.set_hard_state(hard_state)
    }

    /// Append the given entries to the log, then atomically persist the change.
    ///
    /// Entries overlapping existing indices replace the old entries, both in memory and on
    /// disk. Entries whose index precedes the current first index have already been compacted
    /// and are silently dropped.
    #[tracing::instrument(level = "trace", skip(self, entries), err)]
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // Encode up front so the in-memory log is never mutated when encoding fails.
        let mut encoded_entries = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            encoded_entries.push((entry.index, utils::encode_proto(entry).context(ERR_ENCODE_ENTRY)?));
        }

        let mut core = self.core();
        let rollback = core.log.clone();
        let original_first = core.log.first_index();
        let original_last = core.log.last_index();
        if let Err(err) = core.log.append(entries) {
            core.log = rollback;
            return Err(err);
        }
        if !core.is_open {
            return Ok(());
        }

        // Purge all old entries whose index >= the first incoming index, then write the new
        // entries, all in one batch. Entries already behind the compaction horizon are
        // skipped, mirroring what the in-memory append just did.
        let mut batch = Batch::default();
        let first_incoming = entries[0].index.max(original_first);
        let mut index = first_incoming;
        while index <= original_last {
            batch.remove(&entry_key(index));
            index += 1;
        }
        for (index, encoded) in encoded_entries.into_iter() {
            if index < first_incoming {
                continue;
            }
            batch.insert(&entry_key(index), encoded);
        }
        if let Err(err) = self.commit_batch(batch) {
            core.log = rollback;
            return Err(err);
        }
        Ok(())
    }

    /// Overwrite the log with the given snapshot, then atomically persist the change.
    #[tracing::instrument(level = "trace", skip(self, snapshot), err)]
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut core = self.core();
        let rollback = core.log.clone();
        let (purge_first, purge_last) = (rollback.first_index(), rollback.last_index());
        core.log.apply_snapshot(snapshot.clone())?;
        if !core.is_open {
            return Ok(());
        }
        let encoded = match utils::encode_proto(&snapshot).context("error encoding snapshot") {
            Ok(encoded) => encoded,
            Err(err) => {
                core.log = rollback;
                return Err(err);
            }
        };
        let mut batch = Batch::default();
        let mut index = purge_first;
        while index <= purge_last {
            batch.remove(&entry_key(index));
            index += 1;
        }
        batch.insert(&KEY_SNAPSHOT, encoded);
        if let Err(err) = self.commit_batch(batch) {
            core.log = rollback;
            return Err(err);
        }
        Ok(())
    }

    /// Atomically take a snapshot of the current state and compact the entries up to the
    /// point that the snapshot was taken.
    #[tracing::instrument(level = "trace", skip(self, conf_state, data), err)]
    pub fn create_snapshot(&self, index: u64, conf_state: Option<ConfState>, data: Vec<u8>) -> Result<Snapshot> {
        let mut core = self.core();
        let rollback = core.log.clone();
        let original_first = core.log.first_index();
        let snapshot = core.log.create_snapshot(index, conf_state, data)?;
        if let Err(err) = core.log.compact(index) {
            core.log = rollback;
            return Err(err);
        }
        if !core.is_open {
            return Ok(snapshot);
        }
        let encoded = match utils::encode_proto(&snapshot).context("error encoding snapshot") {
            Ok(encoded) => encoded,
            Err(err) => {
                core.log = rollback;
                return Err(err);
            }
        };
        let mut batch = Batch::default();
        let new_first = core.log.first_index();
        let mut purge = original_first;
        while purge < new_first {
            batch.remove(&entry_key(purge));
            purge += 1;
        }
        batch.insert(&KEY_SNAPSHOT, encoded);
        if let Err(err) = self.commit_batch(batch) {
            core.log = rollback;
            return Err(err);
        }
        Ok(snapshot)
    }

    fn commit_batch(&self, batch: Batch) -> Result<()> {
        self.inner.tree.apply_batch(batch).context(ERR_APPLY_BATCH)?;
        self.inner.tree.flush().context(ERR_FLUSH)?;
        Ok(())
    }

    fn core(&self) -> std::sync::MutexGuard<'_, StorageCore> {
        self.inner.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl raft::Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core();
        Ok(RaftState::new(
            core.log.hard_state.clone(),
            core.log.snapshot.get_metadata().get_conf_state().clone(),
        ))
    }

    fn entries(&self, low: u64, high: u64, max_size: impl Into<Option<u64>>, _context: GetEntriesContext) -> raft::Result<Vec<Entry>> {
        self.core().log.entries(low, high, max_size.into())
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.core();
        if idx == core.log.snapshot.get_metadata().index {
            return Ok(core.log.snapshot.get_metadata().term);
        }
        core.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.core().log.first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.core().log.last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.core();
        if core.log.snapshot.get_metadata().index < request_index {
            return Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(core.log.snapshot.clone())
    }
}

impl std::fmt::Debug for RaftStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("RaftStorage")
            .field("is_open", &core.is_open)
            .field("is_empty", &core.is_empty)
            .field("first_index", &core.log.first_index())
            .field("last_index", &core.log.last_index())
            .finish()
    }
}
