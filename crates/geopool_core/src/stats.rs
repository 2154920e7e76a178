//! # Statistics
//!
//! Plain snapshots of pool and registry usage for tooling and reports.

use crate::block::{BlockExtent, BlockId};
use crate::layout::BufferUsage;

/// One entry of a pool's block sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Slot id of the record.
    pub id: BlockId,
    /// Extent in both regions.
    pub extent: BlockExtent,
    /// Free space rather than a client block.
    pub empty: bool,
    /// Staging data matches the uploaded image.
    pub valid: bool,
}

/// Usage of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool id.
    pub id: u32,
    /// Capacity in points.
    pub capacity: u32,
    /// Capacity in indices.
    pub index_capacity: u32,
    /// End of the last occupied block in points.
    pub used_size: u32,
    /// End of the last occupied block in indices.
    pub used_index_size: u32,
    /// Entries in the block sequence, empty ones included.
    pub block_count: u32,
    /// Client blocks.
    pub occupied_blocks: u32,
    /// Points held by client blocks.
    pub occupied_points: u32,
    /// Indices held by client blocks.
    pub occupied_indices: u32,
    /// Points in empty blocks.
    pub free_points: u32,
    /// Largest empty block in points.
    pub largest_free: u32,
    /// A prepare is pending.
    pub dirty: bool,
}

impl PoolStats {
    /// Fraction of the capacity held by client blocks.
    #[must_use]
    pub fn occupancy(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.occupied_points as f32 / self.capacity as f32
    }

    /// Free points that cannot serve a request of `largest_free + 1`.
    ///
    /// 0 when all free space is one run.
    #[must_use]
    pub fn fragmented_points(&self) -> u32 {
        self.free_points - self.largest_free
    }
}

/// Usage of one registry and its pools.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryStats {
    /// Record size in bytes.
    pub stride: u32,
    /// Usage hint of every pool.
    pub usage: BufferUsage,
    /// Standard pool capacity in points.
    pub max_point_count: u32,
    /// Standard pool capacity in indices.
    pub max_index_count: u32,
    /// Per-pool usage, in creation order.
    pub pools: Vec<PoolStats>,
}

impl RegistryStats {
    /// Client blocks across all pools.
    #[must_use]
    pub fn occupied_blocks(&self) -> u32 {
        self.pools.iter().map(|p| p.occupied_blocks).sum()
    }

    /// Points held by client blocks across all pools.
    #[must_use]
    pub fn occupied_points(&self) -> u64 {
        self.pools.iter().map(|p| u64::from(p.occupied_points)).sum()
    }

    /// Total capacity in points across all pools.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.pools.iter().map(|p| u64::from(p.capacity)).sum()
    }

    /// Pools larger than the standard capacity.
    #[must_use]
    pub fn oversized_pools(&self) -> usize {
        self.pools
            .iter()
            .filter(|p| {
                p.capacity > self.max_point_count || p.index_capacity > self.max_index_count
            })
            .count()
    }
}
