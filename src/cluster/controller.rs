//! The cluster controller.
//!
//! The controller is a deterministic state machine driven by the ordered stream of committed
//! cluster commands. Applying the same command sequence to a fresh controller yields the same
//! cluster state and the same ordered sequence of local updates on every node. The only
//! node-local behavior is which deltas are emitted, never how state is mutated.

use tokio::sync::mpsc;

use crate::cluster::models::{ClusterCommand, ClusterState, ClusterStateDelta, NodeConfig};
use crate::cluster::partitioner::PartitioningStrategy;
use crate::error::AppError;
use crate::NodeId;

/// The deterministic state machine at the heart of cluster coordination.
///
/// Each operation consumes one committed cluster command and mutates state synchronously.
/// Operations never fail: ill-formed commands are no-ops. Local-effect deltas are emitted on
/// the `local_updates` channel, which a consumer is required to drain; the channel is
/// unbounded so the apply loop never blocks and deltas are never dropped.
pub struct ClusterController {
    /// The ID of the node this controller is running on.
    pub local_node_id: NodeId,
    /// The cluster state owned by this controller.
    pub state: ClusterState,
    /// The strategy used to assign tokens to nodes.
    pub strategy: Box<dyn PartitioningStrategy>,
    /// The channel on which local-effect deltas are emitted, if any.
    pub local_updates: Option<mpsc::UnboundedSender<ClusterStateDelta>>,
}

impl ClusterController {
    /// Create a new instance.
    pub fn new(
        local_node_id: NodeId, state: ClusterState, strategy: Box<dyn PartitioningStrategy>,
        local_updates: Option<mpsc::UnboundedSender<ClusterStateDelta>>,
    ) -> Self {
        Self { local_node_id, state, strategy, local_updates }
    }

    /// Apply one committed cluster command.
    #[tracing::instrument(level = "trace", skip(self, command))]
    pub fn apply(&mut self, command: ClusterCommand) {
        match command {
            ClusterCommand::UpdateNode { node_id, config } => self.update_node_config(node_id, config),
            ClusterCommand::AddNode { node_id, config } => self.add_node(node_id, config),
            ClusterCommand::RemoveNode { node_id } => self.remove_node(node_id),
            ClusterCommand::TakePartitionReplica { partition, replica, node_id } => {
                self.take_partition_replica(partition, replica, node_id)
            }
            ClusterCommand::SetReplicationFactor { replication_factor } => self.set_replication_factor(replication_factor),
            ClusterCommand::SetPartitionCount { partitions } => self.set_partition_count(partitions),
        }
    }

    /// Update the address and capacity of an existing node.
    ///
    /// Unknown nodes are ignored. The address is overwritten unconditionally; a capacity
    /// change additionally triggers token reassignment. The local node dropping to zero
    /// capacity loses its tokens through the normal reassignment deltas.
    pub fn update_node_config(&mut self, node_id: NodeId, config: NodeConfig) {
        let node = match self.state.nodes.get_mut(&node_id) {
            Some(node) => node,
            None => return,
        };
        node.address.host = config.address.host;
        node.address.port = config.address.port;
        if node.capacity != config.capacity {
            node.capacity = config.capacity;
            self.reassign();
        }
    }

    /// Add a new node to the cluster.
    ///
    /// Nodes which are already members are ignored. If the added node is the local node, a
    /// `NodeAdd` delta is emitted before any token deltas produced by the reassignment which
    /// follows.
    pub fn add_node(&mut self, node_id: NodeId, config: NodeConfig) {
        if self.state.nodes.contains_key(&node_id) {
            return;
        }
        self.state.nodes.insert(node_id, config.clone());
        if node_id == self.local_node_id {
            self.emit(ClusterStateDelta::NodeAdd { node_id, config });
        }
        self.reassign();
    }

    /// Remove a node from the cluster.
    ///
    /// Unknown nodes are ignored. If the removed node is the local node, only a `NodeRemove`
    /// delta is emitted: the node is leaving wholesale, so per-token loss deltas are
    /// suppressed. Tokens which the local node gains from a removed peer generate
    /// `NodeGainToken` deltas as usual.
    pub fn remove_node(&mut self, node_id: NodeId) {
        let removed = match self.state.nodes.remove(&node_id) {
            Some(removed) => removed,
            None => return,
        };
        // Release the departed node's token slots and replica holdings up front. The
        // reassignment below then hands its tokens to the remaining nodes, which also
        // suppresses per-token loss deltas for the departed node itself.
        for token in removed.tokens.iter() {
            if let Some(slot) = self.state.tokens.get_mut(*token as usize) {
                *slot = 0;
            }
        }
        for (partition, replicas) in removed.partition_replicas.iter() {
            if let Some(row) = self.state.partitions.get_mut(*partition as usize) {
                for replica in replicas.iter() {
                    if let Some(entry) = row.get_mut(*replica as usize) {
                        if entry.holder == node_id {
                            entry.holder = 0;
                        }
                    }
                }
            }
        }
        if node_id == self.local_node_id {
            self.emit(ClusterStateDelta::NodeRemove { node_id });
        }
        self.reassign();
    }

    /// Transfer holdership of a partition replica to the given node.
    ///
    /// This command only moves an existing replica: it is issued after the data transfer has
    /// been negotiated out of band, and no token reassignment follows. Commands naming an
    /// unknown node or an out-of-range (partition, replica) pair are ignored.
    pub fn take_partition_replica(&mut self, partition: u64, replica: u64, node_id: NodeId) {
        if !self.state.nodes.contains_key(&node_id) {
            return;
        }
        let entry = match self
            .state
            .partitions
            .get_mut(partition as usize)
            .and_then(|row| row.get_mut(replica as usize))
        {
            Some(entry) => entry,
            None => return,
        };
        let prior_holder = entry.holder;
        if prior_holder == node_id {
            return;
        }
        entry.holder = node_id;

        if prior_holder != 0 {
            if let Some(prior) = self.state.nodes.get_mut(&prior_holder) {
                if let Some(replicas) = prior.partition_replicas.get_mut(&partition) {
                    replicas.remove(&replica);
                    if replicas.is_empty() {
                        prior.partition_replicas.remove(&partition);
                    }
                }
            }
            if prior_holder == self.local_node_id {
                self.emit(ClusterStateDelta::NodeLosePartitionReplica { node_id: prior_holder, partition, replica });
            }
        }

        let node = self.state.nodes.get_mut(&node_id).expect("membership checked above");
        node.partition_replicas.entry(partition).or_default().insert(replica);
        if node_id == self.local_node_id {
            self.emit(ClusterStateDelta::NodeGainPartitionReplica { node_id, partition, replica });
        }
    }

    /// Initialize the cluster replication factor.
    ///
    /// The replication factor is set-once: writes after initialization are ignored. Once both
    /// settings are nonzero the partition tables are built and the initial token assignment
    /// runs.
    pub fn set_replication_factor(&mut self, replication_factor: u64) {
        if self.state.settings.replication_factor != 0 || replication_factor == 0 {
            return;
        }
        self.state.settings.replication_factor = replication_factor;
        self.initialize_if_ready();
    }

    /// Initialize the cluster partition count.
    ///
    /// The partition count is set-once: writes after initialization are ignored. Once both
    /// settings are nonzero the partition tables are built and the initial token assignment
    /// runs.
    pub fn set_partition_count(&mut self, partitions: u64) {
        if self.state.settings.partitions != 0 || partitions == 0 {
            return;
        }
        self.state.settings.partitions = partitions;
        self.initialize_if_ready();
    }

    /// Build the token and partition tables and run the initial assignment once both cluster
    /// settings have been initialized.
    fn initialize_if_ready(&mut self) {
        if !self.state.settings.is_initialized() {
            return;
        }
        self.state.initialize_partitions();
        self.reassign();
    }

    /// Recompute the token assignment and apply the resulting ownership changes.
    ///
    /// Within a single reassignment, all loss deltas are emitted before all gain deltas, each
    /// group in ascending token order.
    fn reassign(&mut self) {
        // Nothing to assign until both cluster settings have been initialized.
        if !self.state.settings.is_initialized() || self.state.tokens.is_empty() {
            return;
        }
        let partitions = self.state.settings.partitions;
        let nodes: Vec<NodeConfig> = self.state.nodes.values().cloned().collect();
        let prev = self.state.tokens.clone();
        let next = match self.strategy.assign_tokens(&nodes, &prev, partitions) {
            Ok(next) => next,
            Err(AppError::NoNodesAvailable) => return,
            Err(err) => {
                tracing::warn!(error = %err, "token reassignment failed");
                return;
            }
        };

        let mut losses = Vec::new();
        let mut gains = Vec::new();
        for (token, &owner) in next.iter().enumerate() {
            let token = token as u64;
            let prior_owner = prev.get(token as usize).copied().unwrap_or(0);
            if prior_owner == owner {
                continue;
            }
            if prior_owner != 0 {
                self.release_token(prior_owner, token);
                if prior_owner == self.local_node_id {
                    losses.push(ClusterStateDelta::NodeLoseToken { node_id: prior_owner, token });
                }
            }
            if owner != 0 {
                if let Some(node) = self.state.nodes.get_mut(&owner) {
                    node.tokens.insert(token);
                }
                if owner == self.local_node_id {
                    gains.push(ClusterStateDelta::NodeGainToken { node_id: owner, token });
                }
            }
            if let Some(slot) = self.state.tokens.get_mut(token as usize) {
                *slot = owner;
            }
        }

        for delta in losses.into_iter().chain(gains.into_iter()) {
            self.emit(delta);
        }
    }

    /// Strip a token, and the holdings tied to its partition, from the given node.
    fn release_token(&mut self, node_id: NodeId, token: u64) {
        let node = match self.state.nodes.get_mut(&node_id) {
            Some(node) => node,
            None => return,
        };
        node.tokens.remove(&token);
        let replicas = node.partition_replicas.remove(&token);
        if let (Some(replicas), Some(row)) = (replicas, self.state.partitions.get_mut(token as usize)) {
            for replica in replicas {
                if let Some(entry) = row.get_mut(replica as usize) {
                    if entry.holder == node_id {
                        entry.holder = 0;
                    }
                }
            }
        }
    }

    fn emit(&self, delta: ClusterStateDelta) {
        if let Some(updates) = self.local_updates.as_ref() {
            let _ = updates.send(delta);
        }
    }
}
