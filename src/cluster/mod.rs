//! Cluster coordination.
//!
//! This module contains the deterministic core of cluster coordination: the data models of
//! cluster membership and topology, the token partitioning strategy, and the cluster
//! controller which applies committed cluster commands and emits local-effect deltas.
//!
//! All state mutation in this module is driven exclusively by the ordered stream of committed
//! Raft log entries, which guarantees that every node of the cluster arrives at an identical
//! view of cluster state and an identical sequence of local updates.

pub mod controller;
pub mod models;
pub mod partitioner;

pub use controller::ClusterController;
pub use models::{ClusterCommand, ClusterState, ClusterStateDelta, NodeConfig, PeerAddress};
pub use partitioner::{PartitioningStrategy, SimplePartitioningStrategy};
