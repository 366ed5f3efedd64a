//! Token partitioning strategies.

use crate::cluster::models::NodeConfig;
use crate::error::AppError;

/// A strategy for assigning partition tokens to cluster nodes.
///
/// Implementations must be deterministic: given identical inputs, every node of the cluster
/// must compute an identical assignment.
pub trait PartitioningStrategy: Send {
    /// Compute a new token assignment.
    ///
    /// `nodes` must be sorted by node ID in strictly increasing order. `current` is the
    /// current assignment, one owner ID per token slot (0 = unassigned), and must have
    /// exactly `partitions` elements.
    fn assign_tokens(&mut self, nodes: &[NodeConfig], current: &[u64], partitions: u64) -> Result<Vec<u64>, AppError>;
}

/// The default partitioning strategy.
///
/// Tokens are spread evenly across all nodes with nonzero capacity: each node is assigned
/// either ⌊P/N⌋ or ⌈P/N⌉ tokens, with the nodes earliest in ID order receiving the larger
/// share. Starting from the current assignment, slots owned by departed or zero-capacity
/// nodes are released first, then surplus slots are released from over-target nodes in
/// ascending slot order, and finally all unowned slots are handed to under-target nodes in
/// ascending node ID order. An unchanged cluster therefore yields an unchanged assignment,
/// and any membership or capacity change moves the minimum number of tokens needed to
/// restore balance.
#[derive(Default)]
pub struct SimplePartitioningStrategy;

impl PartitioningStrategy for SimplePartitioningStrategy {
    fn assign_tokens(&mut self, nodes: &[NodeConfig], current: &[u64], partitions: u64) -> Result<Vec<u64>, AppError> {
        if partitions == 0 || current.len() as u64 != partitions {
            return Err(AppError::PreconditionFailed);
        }
        for window in nodes.windows(2) {
            if window[0].address.node_id >= window[1].address.node_id {
                return Err(AppError::PreconditionFailed);
            }
        }
        for &owner in current.iter() {
            if owner != 0 && !nodes.iter().any(|node| node.address.node_id == owner) {
                return Err(AppError::PreconditionFailed);
            }
        }

        // Only nodes with spare capacity participate in token ownership.
        let available: Vec<&NodeConfig> = nodes.iter().filter(|node| node.capacity != 0).collect();
        if available.is_empty() {
            return Err(AppError::NoNodesAvailable);
        }

        // Determine each available node's target token count. The first `P mod N` nodes in ID
        // order receive the ceiling.
        let node_count = available.len() as u64;
        let floor = partitions / node_count;
        let remainder = (partitions % node_count) as usize;
        let targets: Vec<(u64, u64)> = available
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let target = if idx < remainder { floor + 1 } else { floor };
                (node.address.node_id, target)
            })
            .collect();
        let target_for = |id: u64| -> Option<u64> {
            targets
                .iter()
                .find(|(node_id, _)| *node_id == id)
                .map(|(_, target)| *target)
        };

        // Start from the current assignment, releasing any slot owned by a node which is no
        // longer eligible to own tokens.
        let mut assignment: Vec<u64> = current.to_vec();
        for slot in assignment.iter_mut() {
            if *slot != 0 && target_for(*slot).is_none() {
                *slot = 0;
            }
        }

        // Tally ownership and release surplus slots from over-target nodes in ascending slot
        // order.
        let mut counts: std::collections::BTreeMap<u64, u64> = targets.iter().map(|(id, _)| (*id, 0)).collect();
        for &owner in assignment.iter() {
            if owner != 0 {
                *counts.entry(owner).or_insert(0) += 1;
            }
        }
        for slot in assignment.iter_mut() {
            let owner = *slot;
            if owner == 0 {
                continue;
            }
            let target = target_for(owner).expect("owner slots of ineligible nodes released above");
            let count = counts.get_mut(&owner).expect("owner tallied above");
            if *count > target {
                *count -= 1;
                *slot = 0;
            }
        }

        // Hand every unowned slot to the next under-target node in ascending node ID order.
        let mut shortfalls: Vec<(u64, u64)> = targets
            .iter()
            .filter_map(|(id, target)| {
                let count = counts.get(id).copied().unwrap_or(0);
                if count < *target {
                    Some((*id, *target - count))
                } else {
                    None
                }
            })
            .collect();
        let mut taker = 0;
        for slot in assignment.iter_mut() {
            if *slot != 0 {
                continue;
            }
            while taker < shortfalls.len() && shortfalls[taker].1 == 0 {
                taker += 1;
            }
            if taker >= shortfalls.len() {
                break;
            }
            *slot = shortfalls[taker].0;
            shortfalls[taker].1 -= 1;
        }

        Ok(assignment)
    }
}
