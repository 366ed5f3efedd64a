use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use raft::prelude::{Entry, EntryType, Snapshot};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

use crate::bucket::{BucketStore, ConflictResolution};
use crate::cluster::{ClusterCommand, ClusterController, ClusterState, ClusterStateDelta, SimplePartitioningStrategy};
use crate::config::Config;
use crate::consensus::{RaftHandle, RaftNode, RaftNodeConfig, RaftStorage};
use crate::database::Database;
use crate::utils;
use crate::NodeId;

/// The buckets every node serves, along with their conflict resolution modes.
const BUCKETS: [(&str, ConflictResolution); 4] = [
    ("default", ConflictResolution::MergeSiblings),
    ("cloud", ConflictResolution::MergeSiblings),
    ("lww", ConflictResolution::LastWriterWins),
    ("local", ConflictResolution::MergeSiblings),
];

/// The application object for when RelayDB is running as a server.
pub struct App {
    /// The ID of this node in the cluster.
    node_id: NodeId,
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// The handle used to submit proposals to the cluster Raft.
    raft_handle: RaftHandle,
    /// A read path over the controller's cluster state.
    cluster_state: watch::Receiver<ClusterState>,
    /// The bucket stores served by this node.
    buckets: HashMap<String, Arc<BucketStore>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: watch::Sender<bool>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: watch::Receiver<bool>,

    /// The join handle of the Raft node driver.
    raft_node: JoinHandle<Result<()>>,
    /// The join handle of the controller apply loop.
    apply_loop: JoinHandle<()>,
    /// The join handle of the local updates drain.
    updates_drain: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let node_id = db.get_node_id().await?;
        tracing::info!(node_id);

        // Initialize the cluster Raft's storage and restore any snapshotted cluster state.
        let raft_tree = db.get_cluster_raft_tree().await?;
        let storage = RaftStorage::new(raft_tree);

        // Open this node's bucket stores.
        let mut buckets = HashMap::new();
        for (name, resolve) in BUCKETS.iter() {
            let tree = db.get_bucket_tree(name).await?;
            let store = BucketStore::new(&node_id.to_string(), tree, config.merkle_depth, *resolve)
                .await
                .with_context(|| format!("error opening bucket {}", name))?;
            buckets.insert(name.to_string(), Arc::new(store));
        }

        // Load persisted Raft state and restore the controller's state from the latest
        // snapshot, if one exists.
        let open_storage = storage.clone();
        Database::spawn_blocking(move || open_storage.open())
            .await
            .context("error spawning raft storage open task")?
            .context("error opening raft storage")?;
        let mut initial_state = ClusterState::default();
        if let Some(snapshot) = storage.last_snapshot() {
            if !snapshot.data.is_empty() {
                initial_state = utils::bin_decode(&snapshot.data).context("error decoding snapshotted cluster state")?;
                initial_state.rebuild_token_inverse();
            }
        }

        // The controller's state read path, which also feeds log compaction snapshots.
        let (state_tx, state_rx) = watch::channel(initial_state.clone());
        let snapshot_state = state_rx.clone();
        let get_snapshot: crate::consensus::node::GetSnapshot = Box::new(move || utils::bin_encode(&*snapshot_state.borrow()));

        // Spawn the Raft node. A node with no configured peers bootstraps a new single-node
        // cluster on first start; nodes with peers join an existing cluster via conf change.
        let mut raft_config = RaftNodeConfig::new(node_id, config.peers.is_empty(), storage.clone());
        raft_config.get_snapshot = Some(get_snapshot);
        let node_shutdown = shutdown_rx.clone();
        let (raft_node, raft_handle, outputs) = Database::spawn_blocking(move || RaftNode::new(raft_config, node_shutdown))
            .await
            .context("error spawning raft node setup task")??;
        let raft_node = raft_node.spawn();

        // Spawn the controller apply loop and the local updates drain.
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let controller = ClusterController::new(
            node_id,
            initial_state,
            Box::new(SimplePartitioningStrategy::default()),
            Some(updates_tx),
        );
        let apply_loop = ClusterApplyLoop {
            controller,
            entries: outputs.entries,
            snapshots: outputs.snapshots,
            state_tx,
            shutdown: shutdown_rx.clone(),
        }
        .spawn();
        let updates_drain = spawn_updates_drain(updates_rx);

        // NOTE: outputs.messages carries outbound Raft messages for the peer transport, which
        // is handled by the server collaborator; it is drained here until that layer is wired
        // up so the channel never backs up.
        let mut messages = outputs.messages;
        tokio::spawn(async move { while messages.recv().await.is_some() {} });

        Ok(Self {
            node_id,
            _config: config,
            _db: db,
            raft_handle,
            cluster_state: state_rx,
            buckets,
            shutdown_tx,
            shutdown_rx,
            raft_node,
            apply_loop,
            updates_drain,
        })
    }

    /// Get a handle to the named bucket store.
    pub fn bucket(&self, name: &str) -> Option<Arc<BucketStore>> {
        self.buckets.get(name).cloned()
    }

    /// The ID of this node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The handle used to submit cluster commands through the Raft log.
    pub fn raft_handle(&self) -> RaftHandle {
        self.raft_handle.clone()
    }

    /// Propose a cluster command through the Raft log.
    ///
    /// Resolves once the command is accepted into the local log; the effect of the command
    /// is observed via `cluster_state`.
    pub async fn propose_command(&self, command: ClusterCommand) -> Result<()> {
        let data = utils::bin_encode(&command)?;
        self.raft_handle.propose(data).await
    }

    /// A read path over the controller's cluster state.
    pub fn cluster_state(&self) -> watch::Receiver<ClusterState> {
        self.cluster_state.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::warn!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(true);
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Begin shutdown routine.
        tracing::debug!("relaydb is shutting down");
        if let Err(err) = self.raft_node.await.context("error joining raft node handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down raft node");
        }
        if let Err(err) = self.apply_loop.await {
            tracing::error!(error = ?err, "error shutting down controller apply loop");
        }
        if let Err(err) = self.updates_drain.await {
            tracing::error!(error = ?err, "error shutting down local updates drain");
        }
        tracing::debug!("relaydb shutdown complete");
        Ok(())
    }
}

/// The loop which applies committed cluster commands to the cluster controller.
///
/// Committed entries arrive in strict log order and this loop is the single writer over
/// cluster state, which together give every node an identical state and delta sequence.
struct ClusterApplyLoop {
    controller: ClusterController,
    entries: mpsc::UnboundedReceiver<Entry>,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    state_tx: watch::Sender<ClusterState>,
    shutdown: watch::Receiver<bool>,
}

impl ClusterApplyLoop {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!("cluster controller apply loop is online");
        loop {
            tokio::select! {
                Some(entry) = self.entries.recv() => self.handle_entry(entry),
                Some(snapshot) = self.snapshots.recv() => self.handle_snapshot(snapshot),
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("cluster controller apply loop has shutdown");
    }

    /// Apply one committed log entry.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    fn handle_entry(&mut self, entry: Entry) {
        // Raft membership changes carry no cluster command payload.
        if entry.entry_type() != EntryType::EntryNormal || entry.data.is_empty() {
            return;
        }
        let command: ClusterCommand = match utils::bin_decode(&entry.data) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = ?err, index = entry.index, "skipping undecodable cluster command");
                return;
            }
        };
        self.controller.apply(command);
        let _ = self.state_tx.send(self.controller.state.clone());
    }

    /// Replace controller state from a snapshot installed by the cluster leader.
    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    fn handle_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.data.is_empty() {
            return;
        }
        let mut state: ClusterState = match utils::bin_decode(&snapshot.data) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = ?err, "error decoding cluster state snapshot");
                return;
            }
        };
        state.rebuild_token_inverse();
        self.controller.state = state;
        let _ = self.state_tx.send(self.controller.state.clone());
    }
}

/// Drain local update deltas.
///
/// Data-plane subsystems subscribe here to learn which tokens and partition replicas this
/// node has gained or lost; until those collaborators are wired in, deltas are logged so the
/// channel never backs up.
fn spawn_updates_drain(mut updates: mpsc::UnboundedReceiver<ClusterStateDelta>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delta) = updates.recv().await {
            tracing::debug!(delta = ?delta, "local cluster update");
        }
    })
}
