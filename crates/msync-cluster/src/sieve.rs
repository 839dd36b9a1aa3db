use msync_core::types::MetricName;

use crate::{ClusterConfig, ConfigError};

/// Ownership rule: which metrics is a given node responsible for.
pub trait Sieve: Send + Sync + 'static {
    fn owns(&self, metric: &MetricName) -> bool;
}

/// Ring points per node. More points smooth out the key distribution.
const RING_POINTS_PER_NODE: u32 = 100;

/// Consistent-hash ownership sieve.
///
/// Every node gets `RING_POINTS_PER_NODE` positions on a 64-bit FNV-1a
/// ring; a metric's owners are the first `replication_factor` distinct
/// nodes clockwise from the metric's own hash. The ring depends only on
/// the node list and replication factor, so every node computes the same
/// assignment.
#[derive(Debug, Clone)]
pub struct HashRingSieve {
    ring: Vec<(u64, usize)>,
    nodes: Vec<String>,
    replication_factor: usize,
    local_index: usize,
}

impl HashRingSieve {
    pub fn new(cluster: &ClusterConfig, cluster_name: &str, local_node: &str) -> Result<Self, ConfigError> {
        let mut nodes = cluster.nodes.clone();
        nodes.sort();
        nodes.dedup();

        let local_index = nodes
            .iter()
            .position(|n| n == local_node)
            .ok_or_else(|| ConfigError::UnknownNode {
                cluster: cluster_name.to_string(),
                node: local_node.to_string(),
            })?;

        let mut ring = Vec::with_capacity(nodes.len() * RING_POINTS_PER_NODE as usize);
        for (idx, node) in nodes.iter().enumerate() {
            for point in 0..RING_POINTS_PER_NODE {
                let key = format!("{node}:{point}");
                ring.push((fnv1a64(key.as_bytes()), idx));
            }
        }
        ring.sort_unstable();

        Ok(Self {
            ring,
            nodes,
            replication_factor: cluster.replication_factor,
            local_index,
        })
    }

    /// Node names responsible for `metric`, in ring order.
    pub fn owners(&self, metric: &MetricName) -> Vec<&str> {
        let hash = fnv1a64(metric.as_str().as_bytes());
        let start = self.ring.partition_point(|(h, _)| *h < hash);

        let mut owners: Vec<usize> = Vec::with_capacity(self.replication_factor);
        for offset in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + offset) % self.ring.len()];
            if !owners.contains(&idx) {
                owners.push(idx);
                if owners.len() == self.replication_factor {
                    break;
                }
            }
        }
        owners.into_iter().map(|i| self.nodes[i].as_str()).collect()
    }
}

impl Sieve for HashRingSieve {
    fn owns(&self, metric: &MetricName) -> bool {
        let hash = fnv1a64(metric.as_str().as_bytes());
        let start = self.ring.partition_point(|(h, _)| *h < hash);

        let mut seen: Vec<usize> = Vec::with_capacity(self.replication_factor);
        for offset in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + offset) % self.ring.len()];
            if idx == self.local_index {
                return true;
            }
            if !seen.contains(&idx) {
                seen.push(idx);
                if seen.len() == self.replication_factor {
                    break;
                }
            }
        }
        false
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
