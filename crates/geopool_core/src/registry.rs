//! # Pool Registry
//!
//! Routes allocations for one `(layout, usage)` pair across a growing list
//! of pools. Pools are tried in creation order; when none has room a new
//! standard pool is created, or an exactly sized one for requests larger
//! than the standard capacity.
//!
//! Pools are never removed. A pool with no client blocks is one empty block
//! spanning its capacity and is reused by later requests.

use std::fmt;
use std::rc::Rc;

use crate::block::Block;
use crate::config::SharedBufferConfig;
use crate::device::BufferDevice;
use crate::error::{PoolError, PoolResult};
use crate::layout::{BufferLayout, BufferUsage};
use crate::pool::Pool;
use crate::stats::RegistryStats;

/// All pools sharing one layout and usage.
pub struct PoolRegistry<D: BufferDevice> {
    device: Rc<D>,
    layout: BufferLayout,
    usage: BufferUsage,
    /// Standard pool capacity in points.
    max_point_count: u32,
    /// Standard pool capacity in indices.
    max_index_count: u32,
    rebase_indices: bool,
    pools: Vec<Pool<D>>,
}

impl<D: BufferDevice> PoolRegistry<D> {
    /// Creates an empty registry. No device buffers exist until the first
    /// allocation.
    ///
    /// Indices are rebased at upload unless both `config` and the device
    /// allow base-vertex draws.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] if the layout is invalid.
    pub fn new(
        device: Rc<D>,
        layout: BufferLayout,
        usage: BufferUsage,
        config: &SharedBufferConfig,
    ) -> PoolResult<Self> {
        layout.validate()?;
        let max_point_count = config.max_point_count(&layout);
        let max_index_count = config.max_index_count(&layout);
        let rebase_indices = !(config.use_base_vertex && device.supports_base_vertex());

        tracing::debug!(
            stride = layout.stride,
            index_type = layout.index_type.name(),
            usage = usage.name(),
            max_point_count,
            max_index_count,
            rebase_indices,
            "created pool registry"
        );

        Ok(Self {
            device,
            layout,
            usage,
            max_point_count,
            max_index_count,
            rebase_indices,
            pools: Vec::new(),
        })
    }

    /// Allocates a block for `size` points and `index_count` indices.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] for `size == 0` or indices on an
    /// unindexed layout, [`PoolError::OutOfMemory`] or
    /// [`PoolError::Device`] if a needed pool cannot be created (nothing is
    /// added to the registry then).
    pub fn add_data(&mut self, size: u32, index_count: u32) -> PoolResult<Block<D>> {
        if size == 0 {
            return Err(PoolError::InvalidArgument(
                "block size must be at least one point",
            ));
        }
        if index_count > 0 && !self.layout.index_type.is_indexed() {
            return Err(PoolError::InvalidArgument(
                "index count requested for an unindexed layout",
            ));
        }

        for pool in &self.pools {
            match pool.add_block(size, index_count) {
                Ok(block) => return Ok(block),
                Err(PoolError::NoSpace { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let oversized = size > self.max_point_count || index_count > self.max_index_count;
        let (capacity, index_capacity) = if oversized {
            tracing::warn!(
                size,
                index_count,
                max_point_count = self.max_point_count,
                max_index_count = self.max_index_count,
                "request exceeds the standard pool capacity, creating an oversized pool; \
                 performance not optimal"
            );
            (size, index_count)
        } else {
            (self.max_point_count, self.max_index_count)
        };

        let pool = Pool::new(
            Rc::clone(&self.device),
            self.layout.clone(),
            self.usage,
            capacity,
            index_capacity,
            self.rebase_indices,
        )?;
        let block = match pool.add_block(size, index_count) {
            Ok(block) => block,
            Err(PoolError::NoSpace { .. }) => {
                return Err(PoolError::InvariantViolation(
                    "new pool rejected a request it was sized for",
                ))
            }
            Err(err) => return Err(err),
        };
        self.pools.push(pool);
        Ok(block)
    }

    /// Prepares every pool.
    ///
    /// All pools are attempted even if one fails.
    ///
    /// # Errors
    ///
    /// The first error encountered; failed pools stay dirty.
    pub fn prepare_all(&self) -> PoolResult<()> {
        let mut first_error = None;
        for pool in &self.pools {
            if let Err(err) = pool.prepare() {
                tracing::error!(pool = pool.id(), error = %err, "failed to prepare pool");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether this registry serves `layout` with `usage`.
    #[must_use]
    pub fn matches(&self, layout: &BufferLayout, usage: BufferUsage) -> bool {
        self.usage == usage && self.layout == *layout
    }

    /// Layout shared by all pools.
    #[must_use]
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Usage hint shared by all pools.
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Standard pool capacity in points.
    #[must_use]
    pub fn max_point_count(&self) -> u32 {
        self.max_point_count
    }

    /// Standard pool capacity in indices.
    #[must_use]
    pub fn max_index_count(&self) -> u32 {
        self.max_index_count
    }

    /// Whether pools rebase index values at upload.
    #[must_use]
    pub fn rebases_indices(&self) -> bool {
        self.rebase_indices
    }

    /// Pools in creation order.
    #[must_use]
    pub fn pools(&self) -> &[Pool<D>] {
        &self.pools
    }

    /// Number of pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Usage of every pool.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            stride: self.layout.stride,
            usage: self.usage,
            max_point_count: self.max_point_count,
            max_index_count: self.max_index_count,
            pools: self.pools.iter().map(Pool::stats).collect(),
        }
    }

    /// Writes the developer dump: limits, layout, pools and blocks.
    ///
    /// # Errors
    ///
    /// Only those of `out`.
    pub fn write_report(&self, label: usize, out: &mut impl fmt::Write) -> fmt::Result {
        let stride = self.layout.stride;
        writeln!(
            out,
            "- registry {label} (maxSize=({}|{}) maxIndexSize=({}|{}) usage={}):",
            u64::from(self.max_point_count) * u64::from(stride),
            self.max_point_count,
            self.max_index_count as usize * self.layout.index_size(),
            self.max_index_count,
            self.usage.name()
        )?;
        writeln!(
            out,
            "  - layout (stride={stride} index={}):",
            self.layout.index_type.name()
        )?;
        for (i, attribute) in self.layout.attributes.iter().enumerate() {
            writeln!(
                out,
                "    - attribute {i} (offset={} components={} type={}{})",
                attribute.offset,
                attribute.components,
                if attribute.normalized { "normalized " } else { "" },
                attribute.component_type.name()
            )?;
        }

        for (i, pool) in self.pools.iter().enumerate() {
            let stats = pool.stats();
            writeln!(
                out,
                "  - pool {i} (id={} usedSize=({}|{}) indexSize={} dirty={})",
                stats.id,
                stats.used_size,
                u64::from(stats.used_size) * u64::from(stride),
                stats.used_index_size,
                u8::from(stats.dirty)
            )?;
            for (j, block) in pool.blocks().iter().enumerate() {
                let extent = block.extent;
                writeln!(
                    out,
                    "    - block {j} (offset=({}|{}) size=({}|{}) indices=({},{}) empty={})",
                    extent.offset,
                    u64::from(extent.offset) * u64::from(stride),
                    extent.size,
                    u64::from(extent.size) * u64::from(stride),
                    extent.index_offset,
                    extent.index_count,
                    u8::from(block.empty)
                )?;
            }
        }
        Ok(())
    }
}

impl<D: BufferDevice> fmt::Debug for PoolRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("layout", &self.layout)
            .field("usage", &self.usage)
            .field("max_point_count", &self.max_point_count)
            .field("max_index_count", &self.max_index_count)
            .field("pools", &self.pools.len())
            .finish()
    }
}
