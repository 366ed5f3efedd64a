//! The Raft node wrapper.
//!
//! `RaftNode` drives the consensus state machine: on a fixed tick cadence it advances the
//! `raft` library, persists ready state through `RaftStorage`, and emits outbound messages,
//! newly committed entries (in log order) and newly restored snapshots on its output
//! channels. Peer transport is not handled here; the owner of the node routes outbound
//! messages to peers and feeds received messages back in through the handle.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use raft::prelude::{ConfChange, ConfChangeType, Config as RaftConfig, Entry, EntryType, Message, RawNode, Snapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::consensus::storage::RaftStorage;
use crate::database::Database;
use crate::utils;
use crate::NodeId;

/// The number of committed entries which may accumulate past the last snapshot before the
/// node takes a new snapshot and compacts its log.
pub const LOG_COMPACTION_SIZE: u64 = 1000;

/// The default interval at which the consensus state machine is ticked.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
/// The number of ticks without leader contact after which an election is started.
const ELECTION_TICKS: usize = 10;
/// The number of ticks between leader heartbeats.
const HEARTBEAT_TICKS: usize = 3;

/// A function supplied by the application which produces a snapshot of its state machine,
/// used when the node compacts its log.
pub type GetSnapshot = Box<dyn Fn() -> Result<Vec<u8>> + Send>;

/// Runtime configuration for a Raft node.
pub struct RaftNodeConfig {
    /// The ID of this node.
    pub id: NodeId,
    /// Bootstrap a brand new single-node cluster if no state exists on disk.
    ///
    /// Exactly one node of a new cluster starts with this set; all others join via
    /// conf changes proposed through an existing member.
    pub create_cluster_if_not_exist: bool,
    /// The durable storage backing this node.
    pub storage: RaftStorage,
    /// The application snapshot function used for log compaction.
    pub get_snapshot: Option<GetSnapshot>,
    /// The tick cadence driving elections and heartbeats.
    pub tick_interval: Duration,
    /// The number of applied entries beyond the last snapshot which triggers compaction.
    pub log_compaction_size: u64,
}

impl RaftNodeConfig {
    /// Build a config with default cadence and compaction settings.
    pub fn new(id: NodeId, create_cluster_if_not_exist: bool, storage: RaftStorage) -> Self {
        Self {
            id,
            create_cluster_if_not_exist,
            storage,
            get_snapshot: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            log_compaction_size: LOG_COMPACTION_SIZE,
        }
    }
}

/// A control message bound for the Raft node's driver loop.
enum RaftCtlMsg {
    /// Propose a new entry payload.
    Propose { data: Vec<u8>, tx: oneshot::Sender<Result<()>> },
    /// Propose the addition of a new cluster member.
    AddNode { id: NodeId, tx: oneshot::Sender<Result<()>> },
    /// Propose the removal of a cluster member.
    RemoveNode { id: NodeId, tx: oneshot::Sender<Result<()>> },
    /// Feed in a Raft message received from a peer.
    Receive { msg: Message, tx: oneshot::Sender<Result<()>> },
}

/// A cloneable handle used to drive a running Raft node.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftCtlMsg>,
    storage: RaftStorage,
}

impl RaftHandle {
    /// Propose a new entry payload.
    ///
    /// Resolves once the proposal has been accepted into the local log; it does not wait for
    /// commit. Callers which require commit must observe the entries stream, and callers
    /// which need to bound their waiting should wrap this future in a timeout.
    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        self.send(|tx| RaftCtlMsg::Propose { data, tx }).await
    }

    /// Propose the addition of a new cluster member.
    pub async fn add_node(&self, id: NodeId) -> Result<()> {
        self.send(|tx| RaftCtlMsg::AddNode { id, tx }).await
    }

    /// Propose the removal of a cluster member.
    pub async fn remove_node(&self, id: NodeId) -> Result<()> {
        self.send(|tx| RaftCtlMsg::RemoveNode { id, tx }).await
    }

    /// Feed in a Raft message received from a peer.
    pub async fn receive(&self, msg: Message) -> Result<()> {
        self.send(|tx| RaftCtlMsg::Receive { msg, tx }).await
    }

    /// The node's latest snapshot, if one has been taken or installed.
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.storage.last_snapshot()
    }

    async fn send<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> RaftCtlMsg,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(f(tx)).map_err(|_| anyhow!("raft node has shut down"))?;
        rx.await.context("raft node dropped the response channel")?
    }
}

/// The output channels of a running Raft node.
pub struct RaftOutputs {
    /// Outbound messages which must be routed to their target peers.
    pub messages: mpsc::UnboundedReceiver<Message>,
    /// Committed entries, delivered in strict log order.
    pub entries: mpsc::UnboundedReceiver<Entry>,
    /// Snapshots restored from a leader-initiated snapshot transfer.
    pub snapshots: mpsc::UnboundedReceiver<Snapshot>,
}

/// The driver of one Raft consensus instance.
pub struct RaftNode {
    /// The ID of this node.
    id: NodeId,
    /// The raw consensus state machine.
    raw: RawNode<RaftStorage>,
    /// The durable storage backing `raw`.
    storage: RaftStorage,
    /// The application snapshot function used for log compaction.
    get_snapshot: Option<GetSnapshot>,
    /// The tick cadence driving elections and heartbeats.
    tick_interval: Duration,
    /// The number of applied entries beyond the last snapshot which triggers compaction.
    log_compaction_size: u64,

    /// The channel of inbound control messages.
    ctl_rx: mpsc::UnboundedReceiver<RaftCtlMsg>,
    /// Outbound message channel.
    messages_tx: mpsc::UnboundedSender<Message>,
    /// Committed entries channel.
    entries_tx: mpsc::UnboundedSender<Entry>,
    /// Restored snapshots channel.
    snapshots_tx: mpsc::UnboundedSender<Snapshot>,
    /// Application shutdown channel.
    shutdown: watch::Receiver<bool>,

    /// The index of the last entry applied by the application.
    applied_index: u64,
    /// Whether this node should campaign for leadership at startup.
    campaign_on_start: bool,
}

impl RaftNode {
    /// Create a new instance, restoring any previous state from disk.
    pub fn new(config: RaftNodeConfig, shutdown: watch::Receiver<bool>) -> Result<(Self, RaftHandle, RaftOutputs)> {
        let storage = config.storage;
        storage.open().context("error opening raft storage")?;
        let was_empty = storage.is_empty();
        if was_empty && config.create_cluster_if_not_exist {
            storage
                .bootstrap_conf_state(vec![config.id])
                .context("error bootstrapping new cluster conf state")?;
        }

        let applied_index = storage.snapshot_index();
        let raft_config = RaftConfig {
            id: config.id,
            election_tick: ELECTION_TICKS,
            heartbeat_tick: HEARTBEAT_TICKS,
            max_inflight_msgs: 256,
            applied: applied_index,
            ..Default::default()
        };
        // The raft library requires an slog logger; application logging runs through tracing,
        // so the library's own output is discarded.
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&raft_config, storage.clone(), &logger).context("error building raft state machine")?;

        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (entries_tx, entries_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();

        let node = Self {
            id: config.id,
            raw,
            storage,
            get_snapshot: config.get_snapshot,
            tick_interval: config.tick_interval,
            log_compaction_size: config.log_compaction_size,
            ctl_rx,
            messages_tx,
            entries_tx,
            snapshots_tx,
            shutdown,
            applied_index,
            campaign_on_start: was_empty && config.create_cluster_if_not_exist,
        };
        let handle = RaftHandle { tx: ctl_tx, storage: node.storage.clone() };
        let outputs = RaftOutputs { messages: messages_rx, entries: entries_rx, snapshots: snapshots_rx };
        Ok((node, handle, outputs))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(id = self.id, "raft node has started");
        if self.campaign_on_start {
            if let Err(err) = self.raw.campaign() {
                tracing::error!(error = ?err, "error campaigning for initial leadership");
            }
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.raw.tick();
                }
                Some(msg) = self.ctl_rx.recv() => self.handle_ctl_msg(msg),
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(err) = self.on_ready().await {
                tracing::error!(error = ?err, "fatal error processing raft ready state");
                return Err(err);
            }
        }

        tracing::debug!(id = self.id, "raft node has shutdown");
        Ok(())
    }

    /// Handle a control message from the node's handle.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn handle_ctl_msg(&mut self, msg: RaftCtlMsg) {
        match msg {
            RaftCtlMsg::Propose { data, tx } => {
                let res = self.raw.propose(vec![], data).context("error proposing entry to raft");
                let _ = tx.send(res);
            }
            RaftCtlMsg::AddNode { id, tx } => {
                let res = self.propose_conf_change(id, ConfChangeType::AddNode);
                let _ = tx.send(res);
            }
            RaftCtlMsg::RemoveNode { id, tx } => {
                let res = self.propose_conf_change(id, ConfChangeType::RemoveNode);
                let _ = tx.send(res);
            }
            RaftCtlMsg::Receive { msg, tx } => {
                let res = self.raw.step(msg).context("error stepping raft message");
                let _ = tx.send(res);
            }
        }
    }

    fn propose_conf_change(&mut self, id: NodeId, change_type: ConfChangeType) -> Result<()> {
        let mut change = ConfChange::default();
        change.set_change_type(change_type);
        change.node_id = id;
        self.raw
            .propose_conf_change(vec![], change)
            .context("error proposing conf change to raft")
    }

    /// Process any pending ready state from the consensus module.
    ///
    /// Ready processing follows the library's two-phase protocol: persist hard state, new
    /// entries and any received snapshot first, then advance and handle the follow-up
    /// commit-index update. Committed entries are emitted between the two phases in strict
    /// log order.
    async fn on_ready(&mut self) -> Result<()> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw.ready();

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let storage = self.storage.clone();
            let snap = snapshot.clone();
            Database::spawn_blocking(move || storage.apply_snapshot(snap))
                .await
                .context("error spawning snapshot persistence task")?
                .context("error persisting received snapshot")?;
            self.applied_index = snapshot.get_metadata().index;
            let _ = self.snapshots_tx.send(snapshot);
        }

        if !ready.entries().is_empty() {
            let storage = self.storage.clone();
            let entries = ready.entries().to_vec();
            Database::spawn_blocking(move || storage.append(&entries))
                .await
                .context("error spawning entry persistence task")?
                .context("error persisting raft log entries")?;
        }

        if let Some(hard_state) = ready.hs() {
            let storage = self.storage.clone();
            let hs = hard_state.clone();
            Database::spawn_blocking(move || storage.set_hard_state(hs))
                .await
                .context("error spawning hard state persistence task")?
                .context("error persisting raft hard state")?;
        }

        for msg in ready.take_messages().into_iter().chain(ready.take_persisted_messages()) {
            let _ = self.messages_tx.send(msg);
        }

        let committed = ready.take_committed_entries();
        self.apply_committed_entries(committed)?;

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            let storage = self.storage.clone();
            Database::spawn_blocking(move || storage.set_commit(commit))
                .await
                .context("error spawning commit persistence task")?
                .context("error persisting raft commit index")?;
        }
        for msg in light_ready.take_messages() {
            let _ = self.messages_tx.send(msg);
        }
        self.apply_committed_entries(light_ready.take_committed_entries())?;
        self.raw.advance_apply();

        self.maybe_compact_log().await
    }

    /// Emit committed entries to the application and apply any conf changes they carry.
    fn apply_committed_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            self.applied_index = entry.index;
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    if entry.data.is_empty() {
                        continue;
                    }
                    let _ = self.entries_tx.send(entry);
                }
                EntryType::EntryConfChange => {
                    let change: ConfChange = utils::decode_proto(&entry.data).context("error decoding conf change entry")?;
                    self.raw
                        .apply_conf_change(&change)
                        .context("error applying conf change to raft state machine")?;
                    let _ = self.entries_tx.send(entry);
                }
                EntryType::EntryConfChangeV2 => {
                    tracing::warn!("ignoring unsupported conf change v2 entry");
                }
            }
        }
        Ok(())
    }

    /// Take a new application snapshot and compact the log once enough entries have been
    /// applied past the last snapshot.
    async fn maybe_compact_log(&mut self) -> Result<()> {
        let get_snapshot = match self.get_snapshot.as_ref() {
            Some(get_snapshot) => get_snapshot,
            None => return Ok(()),
        };
        let snapshot_index = self.storage.snapshot_index();
        if self.applied_index < snapshot_index + self.log_compaction_size {
            return Ok(());
        }
        tracing::debug!(
            id = self.id,
            applied = self.applied_index,
            snapshot = snapshot_index,
            "compacting raft log"
        );
        let data = (get_snapshot)().context("error obtaining application snapshot for log compaction")?;
        let conf_state = self.raw.raft.prs().conf().to_conf_state();
        let (storage, applied) = (self.storage.clone(), self.applied_index);
        Database::spawn_blocking(move || storage.create_snapshot(applied, Some(conf_state), data))
            .await
            .context("error spawning snapshot creation task")?
            .context("error creating snapshot for log compaction")?;
        Ok(())
    }
}
