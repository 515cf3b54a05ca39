//! dotkv-ring: consistent-hash ring and preflist computation.
//!
//! The ring is an ordered circular sequence of `2^P` partitions, each
//! owned by a cluster node. A key's position is `hash160(bucket || key)`;
//! the partition whose arc contains the position is the first one
//! encountered walking the ring clockwise, and a key's preflist is that
//! partition plus its `N-1` clockwise successors.
//!
//! A [`RingSnapshot`] is immutable. The membership layer installs a new
//! snapshot on ownership changes; in-flight coordinators keep the one
//! they started with.

use dotkv_common::{Bkey, NodeName, RingPos};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("owner list has {got} entries, ring with exponent {exponent} needs {need}")]
    OwnerCount {
        exponent: u8,
        need: usize,
        got: usize,
    },
    #[error("ring exponent {0} out of range 1..=16")]
    Exponent(u8),
    #[error("ring needs at least one owner node")]
    NoOwners,
}

/// Immutable view of ring ownership at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSnapshot {
    exponent: u8,
    owners: Vec<NodeName>,
}

impl RingSnapshot {
    /// Build a snapshot from an explicit owner-per-partition list.
    pub fn new(exponent: u8, owners: Vec<NodeName>) -> Result<Self, RingError> {
        if exponent == 0 || exponent > 16 {
            return Err(RingError::Exponent(exponent));
        }
        let need = 1usize << exponent;
        if owners.len() != need {
            return Err(RingError::OwnerCount {
                exponent,
                need,
                got: owners.len(),
            });
        }
        Ok(Self { exponent, owners })
    }

    /// Build a snapshot assigning partitions round-robin over `nodes`.
    ///
    /// Every node computes the same map from the same sorted member list,
    /// so ownership is deterministic cluster-wide.
    pub fn uniform(exponent: u8, nodes: &[NodeName]) -> Result<Self, RingError> {
        if nodes.is_empty() {
            return Err(RingError::NoOwners);
        }
        let mut sorted: Vec<NodeName> = nodes.to_vec();
        sorted.sort();
        let count = 1usize << exponent;
        let owners = (0..count).map(|i| sorted[i % sorted.len()].clone()).collect();
        Self::new(exponent, owners)
    }

    pub fn exponent(&self) -> u8 {
        self.exponent
    }

    pub fn partition_count(&self) -> u32 {
        1u32 << self.exponent
    }

    pub fn owner(&self, index: u32) -> &NodeName {
        &self.owners[index as usize]
    }

    /// Map a ring position to the index of the partition owning its arc.
    pub fn index_for(&self, pos: &RingPos) -> u32 {
        pos.top_bits(self.exponent)
    }

    /// First partition clockwise from the key's position, with its owner.
    pub fn primary(&self, bkey: &Bkey) -> (u32, &NodeName) {
        let index = self.index_for(&bkey.ring_position());
        (index, self.owner(index))
    }

    /// The first `n` partitions clockwise from the key's position, each
    /// paired with its current owner. The first entry is the primary.
    pub fn replicas(&self, bkey: &Bkey, n: usize) -> Vec<(u32, NodeName)> {
        let count = self.partition_count();
        let n = n.min(count as usize);
        let start = self.index_for(&bkey.ring_position());
        (0..n as u32)
            .map(|i| {
                let index = (start + i) % count;
                (index, self.owners[index as usize].clone())
            })
            .collect()
    }

    /// Partitions sharing at least one preflist with `index`: the `n-1`
    /// counter-clockwise predecessors and the `n-1` clockwise successors,
    /// predecessors first in ring order.
    pub fn peers(&self, index: u32, n: usize) -> Vec<u32> {
        let count = self.partition_count();
        if n <= 1 {
            return Vec::new();
        }
        let span = (n - 1).min(count as usize - 1) as u32;
        let mut out = Vec::with_capacity(2 * span as usize);
        for back in (1..=span).rev() {
            out.push((index + count - back) % count);
        }
        for fwd in 1..=span {
            let p = (index + fwd) % count;
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out.retain(|&p| p != index);
        out
    }

    /// For each replication factor in `n_values`, the partitions whose
    /// preflists include `index`: those for which `index` is among the
    /// first `n` clockwise successors. Used to scope Merkle exchanges.
    pub fn responsible_preflists(&self, index: u32, n_values: &[usize]) -> Vec<(u32, usize)> {
        let count = self.partition_count();
        let mut out = Vec::new();
        for &n in n_values {
            let span = n.min(count as usize) as u32;
            for back in 0..span {
                out.push(((index + count - back) % count, n));
            }
        }
        out
    }
}
