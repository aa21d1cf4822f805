//! Deterministic partition -> target servers routing.
//!
//! Within each replication group, a partition is sent to every member unless
//! a per-partition server limit `k` is configured. With a limit, the group's
//! members are viewed as a ring and the partition goes to the `k` contiguous
//! members starting at `partition % group_size`. This window selection is a
//! compatibility contract: readers locate a partition's servers with the
//! same function.

use crate::protocol::PartitionId;
use crate::utils::{Bitmap, RssError};

/// Selects the member indices (within a group of `group_size`) that should
/// hold `partition`. Pure function of its arguments.
pub fn select_window(
    partition: PartitionId,
    group_size: usize,
    limit: Option<usize>,
) -> Vec<usize> {
    if group_size == 0 {
        return vec![];
    }
    let width = match limit {
        Some(k) if k > 0 && k < group_size => k,
        _ => return (0..group_size).collect(),
    };
    let start = partition as usize % group_size;
    (0..width).map(|i| (start + i) % group_size).collect()
}

/// Resolved targets of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Union of all groups' targets as connection indices.
    pub targets: Bitmap,

    /// Per group, the connection indices chosen within that group.
    pub group_targets: Vec<Vec<usize>>,
}

/// Maps partitions to the connections that must receive their records.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    /// Per replication group, the connection index of each member in group
    /// order. Two groups sharing a server share its connection index.
    groups: Vec<Vec<usize>>,

    /// Total number of distinct connections.
    num_connections: usize,

    /// Optional per-partition server count limit applied inside each group.
    max_servers_per_partition: Option<usize>,
}

impl PartitionRouter {
    /// Creates a new router over groups of connection indices.
    pub fn new(
        groups: Vec<Vec<usize>>,
        num_connections: usize,
        max_servers_per_partition: Option<usize>,
    ) -> Result<Self, RssError> {
        if groups.is_empty() {
            return Err(RssError::upload_state("no replication group given"));
        }
        for (g, members) in groups.iter().enumerate() {
            if members.is_empty() {
                return Err(RssError::upload_state(format!(
                    "replication group {} is empty",
                    g
                )));
            }
            if let Some(&idx) = members.iter().find(|&&i| i >= num_connections)
            {
                return Err(RssError::upload_state(format!(
                    "connection index {} out of bound {}",
                    idx, num_connections
                )));
            }
        }
        if max_servers_per_partition == Some(0) {
            return Err(RssError::upload_state(
                "max_servers_per_partition must be at least 1",
            ));
        }

        Ok(PartitionRouter {
            groups,
            num_connections,
            max_servers_per_partition,
        })
    }

    /// Resolves the connections that must receive `partition`'s records.
    pub fn route(&self, partition: PartitionId) -> Route {
        let mut targets = Bitmap::new(self.num_connections, false);
        let group_targets: Vec<Vec<usize>> = self
            .groups
            .iter()
            .map(|members| {
                select_window(
                    partition,
                    members.len(),
                    self.max_servers_per_partition,
                )
                .into_iter()
                .map(|m| members[m])
                .collect::<Vec<usize>>()
            })
            .collect();

        for &idx in group_targets.iter().flatten() {
            // indices validated at construction
            let _ = targets.set(idx, true);
        }

        Route {
            targets,
            group_targets,
        }
    }

    /// Connection indices for `partition`, in increasing order.
    pub fn servers_for(&self, partition: PartitionId) -> Vec<usize> {
        self.route(partition).targets.ones().collect()
    }
}
