//! Data models for cluster membership and topology.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// The address at which a cluster member accepts intra-cluster traffic.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeerAddress {
    /// The unique ID of the corresponding node.
    pub node_id: NodeId,
    /// The host at which the node can be reached.
    pub host: String,
    /// The port at which the node can be reached.
    pub port: u16,
}

/// The cluster-level record of a single member node.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeConfig {
    /// The address of this node.
    pub address: PeerAddress,
    /// The relative storage capacity of this node.
    ///
    /// A capacity of zero marks a node which is part of the cluster but is not eligible to own
    /// any tokens, typically because it is being drained for decommissioning.
    pub capacity: u64,
    /// The set of tokens currently owned by this node.
    ///
    /// This set is the maintained inverse of `ClusterState::tokens`, which is authoritative.
    pub tokens: BTreeSet<u64>,
    /// The partition replicas currently held by this node, keyed by partition.
    pub partition_replicas: BTreeMap<u64, BTreeSet<u64>>,
}

/// The holder record for one replica of one partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PartitionReplica {
    /// The partition to which this replica belongs.
    pub partition: u64,
    /// The offset of this replica within its partition.
    pub replica: u64,
    /// The ID of the node currently holding this replica, or 0 if unassigned.
    pub holder: NodeId,
}

/// Cluster-wide settings, each of which is set exactly once during cluster initialization.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClusterSettings {
    /// The number of partitions the keyspace is divided into.
    pub partitions: u64,
    /// The number of replicas kept of each partition.
    pub replication_factor: u64,
}

impl ClusterSettings {
    /// Check if both settings have been initialized.
    pub fn is_initialized(&self) -> bool {
        self.partitions != 0 && self.replication_factor != 0
    }
}

/// Global cluster membership and topology.
///
/// `nodes` is the single owner of all node records; tokens, partition replicas and deltas all
/// refer to nodes by ID only. `tokens` is the authoritative record of token ownership and
/// `NodeConfig::tokens` is maintained as its inverse.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClusterState {
    /// All member nodes of the cluster, keyed by node ID.
    pub nodes: BTreeMap<NodeId, NodeConfig>,
    /// The owner of each partition's primary token, or 0 if unassigned.
    ///
    /// Has length `settings.partitions` once the cluster is initialized.
    pub tokens: Vec<NodeId>,
    /// The holder records for every (partition, replica) pair.
    pub partitions: Vec<Vec<PartitionReplica>>,
    /// Cluster-wide settings.
    pub settings: ClusterSettings,
}

impl ClusterState {
    /// Initialize the token and partition replica tables from the cluster settings.
    ///
    /// A no-op unless both settings are nonzero and the tables have not yet been built.
    pub fn initialize_partitions(&mut self) {
        if !self.settings.is_initialized() || !self.tokens.is_empty() {
            return;
        }
        let (partitions, replicas) = (self.settings.partitions, self.settings.replication_factor);
        self.tokens = vec![0; partitions as usize];
        self.partitions = (0..partitions)
            .map(|partition| {
                (0..replicas)
                    .map(|replica| PartitionReplica { partition, replica, holder: 0 })
                    .collect()
            })
            .collect();
    }

    /// Rebuild each node's token set from the authoritative token table.
    ///
    /// Used after restoring cluster state from a snapshot: the token table is the single
    /// source of truth and the per-node sets are derived from it.
    pub fn rebuild_token_inverse(&mut self) {
        for node in self.nodes.values_mut() {
            node.tokens.clear();
        }
        for (token, owner) in self.tokens.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(owner) {
                node.tokens.insert(token as u64);
            }
        }
    }
}

/// A structured notification emitted by the cluster controller so local subsystems learn what
/// to do about a just-applied cluster command.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum ClusterStateDelta {
    /// The local node has been added to the cluster.
    NodeAdd { node_id: NodeId, config: NodeConfig },
    /// The local node has been removed from the cluster.
    NodeRemove { node_id: NodeId },
    /// The local node has gained ownership of a token.
    NodeGainToken { node_id: NodeId, token: u64 },
    /// The local node has lost ownership of a token.
    NodeLoseToken { node_id: NodeId, token: u64 },
    /// The local node has gained holdership of a partition replica.
    NodeGainPartitionReplica { node_id: NodeId, partition: u64, replica: u64 },
    /// The local node has lost holdership of a partition replica.
    NodeLosePartitionReplica { node_id: NodeId, partition: u64, replica: u64 },
}

/// A cluster command carried as the payload of a committed Raft log entry.
///
/// The bincode encoding of this type is the log's wire format and must remain stable
/// across versions.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum ClusterCommand {
    /// Update the address and capacity of an existing node.
    UpdateNode { node_id: NodeId, config: NodeConfig },
    /// Add a new node to the cluster.
    AddNode { node_id: NodeId, config: NodeConfig },
    /// Remove a node from the cluster.
    RemoveNode { node_id: NodeId },
    /// Transfer holdership of a partition replica to the given node.
    TakePartitionReplica { partition: u64, replica: u64, node_id: NodeId },
    /// Initialize the cluster replication factor.
    SetReplicationFactor { replication_factor: u64 },
    /// Initialize the cluster partition count.
    SetPartitionCount { partitions: u64 },
}
