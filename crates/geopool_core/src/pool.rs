//! # Pool
//!
//! One fixed-capacity device buffer pair subdivided into blocks.
//!
//! ## Invariants
//!
//! - The block sequence tiles `[0, capacity)` and `[0, index_capacity)` in
//!   lock-step, with no gaps and no overlaps.
//! - No two adjacent blocks are both empty.
//! - Every occupied block holds at least one point.
//! - `used_size` is the end of the last occupied block (0 if none), so
//!   trailing free space is never uploaded.
//!
//! Block records live in a slot arena. The ordered sequence stores slot
//! indices, so splitting and merging shift small integers. A slot's
//! generation changes whenever its block is released or the slot is freed,
//! so stale ids never match a later block.
//!
//! A handle dropped while the pool is borrowed (inside [`Block::with_data`]
//! or [`Pool::with_buffer`]) queues its id. The queue is drained by the next
//! call that can borrow the pool mutably.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::block::{Block, BlockData, BlockExtent, BlockId, BlockRecord};
use crate::device::{BufferDevice, BufferRegion, BufferRequest};
use crate::error::{byte_len, try_zeroed, PoolError, PoolResult};
use crate::layout::{BufferLayout, BufferUsage, IndexType};
use crate::stats::{BlockInfo, PoolStats};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// One arena entry.
struct Slot {
    generation: u32,
    record: BlockRecord,
}

/// Pool internals, shared between the [`Pool`] handle and its blocks.
pub(crate) struct PoolState<D: BufferDevice> {
    id: u32,
    device: Rc<D>,
    /// `None` only while dropping.
    buffer: Option<D::Buffer>,
    layout: BufferLayout,
    usage: BufferUsage,
    capacity: u32,
    index_capacity: u32,
    /// Add the block offset to index values while building the upload image.
    rebase_indices: bool,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    /// Slot indices in offset order.
    sequence: Vec<u32>,
    used_size: u32,
    used_index_size: u32,
    dirty: bool,
}

impl<D: BufferDevice> PoolState<D> {
    fn record(&self, position: usize) -> &BlockRecord {
        &self.slots[self.sequence[position] as usize].record
    }

    fn record_mut(&mut self, position: usize) -> &mut BlockRecord {
        &mut self.slots[self.sequence[position] as usize].record
    }

    fn empty_record(&self, extent: BlockExtent) -> BlockRecord {
        BlockRecord::empty(extent, self.layout.stride_bytes(), self.layout.index_type)
    }

    /// Position of `id` in the sequence.
    fn find(&self, id: BlockId) -> Option<usize> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        self.sequence.iter().position(|&s| s == id.slot)
    }

    fn locate(&self, id: BlockId) -> PoolResult<usize> {
        self.find(id)
            .ok_or(PoolError::InvariantViolation("block is not part of this pool"))
    }

    fn alloc_slot(&mut self, record: BlockRecord) -> u32 {
        if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize].record = record;
            return slot;
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record,
        });
        slot
    }

    /// Removes the block at `position` from the sequence and retires its slot.
    fn retire(&mut self, position: usize) {
        let slot = self.sequence.remove(position);
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        self.free_slots.push(slot);
    }

    /// Claims the first empty block that fits, splitting off the remainder.
    pub(crate) fn add_block(
        &mut self,
        size: u32,
        index_count: u32,
    ) -> PoolResult<(BlockId, BlockExtent)> {
        let no_space = PoolError::NoSpace { size, index_count };
        if size == 0 || size > self.capacity || index_count > self.index_capacity {
            return Err(no_space);
        }

        let position = (0..self.sequence.len())
            .find(|&p| {
                let record = self.record(p);
                let extent = record.extent();
                record.is_empty() && extent.size >= size && extent.index_count >= index_count
            })
            .ok_or(no_space)?;
        let found = self.record(position).extent();

        let split = found.size > size || found.index_count > index_count;
        if split {
            let rest = self.empty_record(BlockExtent {
                offset: found.offset + size,
                size: found.size - size,
                index_offset: found.index_offset + index_count,
                index_count: found.index_count - index_count,
            });
            let slot = self.alloc_slot(rest);
            self.sequence.insert(position + 1, slot);
        }

        let record = self.record_mut(position);
        record.set_size(size)?;
        record.set_index_count(index_count)?;
        if let Err(err) = record.set_empty(false) {
            record.set_size(found.size)?;
            record.set_index_count(found.index_count)?;
            if split {
                self.retire(position + 1);
            }
            return Err(err);
        }
        let extent = record.extent();

        let slot = self.sequence[position];
        let id = BlockId {
            slot,
            generation: self.slots[slot as usize].generation,
        };
        self.update_used();
        self.dirty = true;
        debug_assert!(self.check().is_ok());
        Ok((id, extent))
    }

    /// Frees a block and coalesces it with empty neighbours.
    pub(crate) fn remove_block(&mut self, id: BlockId) -> PoolResult<()> {
        let mut position = self.locate(id)?;
        let entry = &mut self.slots[id.slot as usize];
        if entry.record.is_empty() {
            return Err(PoolError::InvariantViolation("block is already empty"));
        }
        entry.record.set_empty(true)?;
        entry.generation = entry.generation.wrapping_add(1);

        if position > 0 && self.record(position - 1).is_empty() {
            self.merge_into_previous(position)?;
            position -= 1;
        }
        if position + 1 < self.sequence.len() && self.record(position + 1).is_empty() {
            self.merge_into_previous(position + 1)?;
        }

        self.update_used();
        self.dirty = true;
        debug_assert!(self.check().is_ok());
        Ok(())
    }

    /// Removes a block whose last handle is gone. Failures are logged.
    fn release(&mut self, id: BlockId) {
        if let Err(err) = self.remove_block(id) {
            tracing::error!(pool = self.id, block = %id, error = %err, "failed to release block");
            debug_assert!(false, "failed to release {id}: {err}");
        }
    }

    /// Folds the empty block at `position` into the empty block before it.
    fn merge_into_previous(&mut self, position: usize) -> PoolResult<()> {
        let absorbed = self.record(position).extent();
        let target = self.record_mut(position - 1);
        let extent = target.extent();
        target.set_size(extent.size + absorbed.size)?;
        target.set_index_count(extent.index_count + absorbed.index_count)?;
        self.retire(position);
        Ok(())
    }

    /// Resizes an occupied block in place.
    ///
    /// Growth is taken from an empty block directly after it; shrinking hands
    /// the tail to that empty block or to a new one.
    pub(crate) fn resize_block(
        &mut self,
        id: BlockId,
        size: u32,
        index_count: u32,
    ) -> PoolResult<BlockExtent> {
        if size == 0 {
            return Err(PoolError::InvalidArgument(
                "block size must be at least one point",
            ));
        }
        let position = self.locate(id)?;
        if self.record(position).is_empty() {
            return Err(PoolError::InvariantViolation("handle refers to an empty block"));
        }
        let current = self.record(position).extent();
        if current.size == size && current.index_count == index_count {
            return Ok(current);
        }

        let next_empty =
            position + 1 < self.sequence.len() && self.record(position + 1).is_empty();
        let grows = size > current.size || index_count > current.index_count;
        let no_space = PoolError::NoSpace { size, index_count };

        // Free space after the block once it takes its new extent.
        let (rest_size, rest_index) = if next_empty {
            let next = self.record(position + 1).extent();
            (
                (next.size + current.size).checked_sub(size).ok_or(no_space.clone())?,
                (next.index_count + current.index_count)
                    .checked_sub(index_count)
                    .ok_or(no_space)?,
            )
        } else if grows {
            return Err(no_space);
        } else {
            (current.size - size, current.index_count - index_count)
        };

        let data = BlockData::allocate(
            size,
            index_count,
            self.layout.stride_bytes(),
            self.layout.index_type,
        )?;

        let rest_offset = current.offset + size;
        let rest_index_offset = current.index_offset + index_count;
        if next_empty {
            if rest_size == 0 && rest_index == 0 {
                self.retire(position + 1);
            } else {
                let next = self.record_mut(position + 1);
                next.move_to(rest_offset, rest_index_offset);
                next.set_size(rest_size)?;
                next.set_index_count(rest_index)?;
            }
        } else if rest_size > 0 || rest_index > 0 {
            let rest = self.empty_record(BlockExtent {
                offset: rest_offset,
                size: rest_size,
                index_offset: rest_index_offset,
                index_count: rest_index,
            });
            let slot = self.alloc_slot(rest);
            self.sequence.insert(position + 1, slot);
        }

        let record = self.record_mut(position);
        record.replace(size, index_count, data);
        let extent = record.extent();
        self.update_used();
        self.dirty = true;
        debug_assert!(self.check().is_ok());
        Ok(extent)
    }

    pub(crate) fn block_data_mut(&mut self, id: BlockId) -> PoolResult<&mut BlockData> {
        let position = self.locate(id)?;
        self.record_mut(position)
            .data_mut()
            .ok_or(PoolError::InvariantViolation("handle refers to an empty block"))
    }

    pub(crate) fn block_valid(&self, id: BlockId) -> PoolResult<bool> {
        let position = self.locate(id)?;
        Ok(self.record(position).is_valid())
    }

    pub(crate) fn set_block_valid(&mut self, id: BlockId, valid: bool) -> PoolResult<()> {
        let position = self.locate(id)?;
        self.record_mut(position).set_valid(valid);
        if !valid {
            self.dirty = true;
        }
        Ok(())
    }

    fn update_used(&mut self) {
        let last = (0..self.sequence.len())
            .rev()
            .map(|p| self.record(p))
            .find(|record| !record.is_empty())
            .map(BlockRecord::extent);
        self.used_size = last.map_or(0, |extent| extent.end());
        self.used_index_size = last.map_or(0, |extent| extent.index_end());
    }

    /// Builds the consolidated image and uploads it, one call per region.
    fn prepare(&mut self) -> PoolResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let stride = self.layout.stride_bytes();
        let index_type = self.layout.index_type;
        let index_size = index_type.element_size();
        let mut vertex_image = try_zeroed(byte_len(self.used_size, stride)?)?;
        let mut index_image = try_zeroed(byte_len(self.used_index_size, index_size)?)?;

        for &slot in &self.sequence {
            let record = &self.slots[slot as usize].record;
            let Some(data) = record.data() else {
                continue;
            };
            let extent = record.extent();

            let start = extent.offset as usize * stride;
            vertex_image[start..start + data.points().len()].copy_from_slice(data.points());

            if index_size > 0 && extent.index_count > 0 {
                let start = extent.index_offset as usize * index_size;
                let target = &mut index_image[start..start + data.indices().len()];
                target.copy_from_slice(data.indices());
                if self.rebase_indices && extent.offset > 0 {
                    rebase(target, index_type, extent.offset)?;
                }
            }
        }

        let buffer = self
            .buffer
            .as_ref()
            .ok_or(PoolError::InvariantViolation("pool has no device buffer"))?;
        if !vertex_image.is_empty() {
            self.device.upload(buffer, BufferRegion::Vertex, &vertex_image)?;
        }
        if !index_image.is_empty() {
            self.device.upload(buffer, BufferRegion::Index, &index_image)?;
        }
        tracing::trace!(
            pool = self.id,
            vertex_bytes = vertex_image.len(),
            index_bytes = index_image.len(),
            "uploaded shared buffer image"
        );

        for &slot in &self.sequence {
            let record = &mut self.slots[slot as usize].record;
            if !record.is_empty() {
                record.set_valid(true);
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Walks the sequence and verifies every structural invariant.
    fn check(&self) -> PoolResult<()> {
        let mut offset = 0u32;
        let mut index_offset = 0u32;
        let mut previous_empty = false;
        let mut used = (0, 0);

        for position in 0..self.sequence.len() {
            let record = self.record(position);
            let extent = record.extent();
            if extent.offset != offset || extent.index_offset != index_offset {
                return Err(PoolError::InvariantViolation("blocks leave a gap or overlap"));
            }
            if record.is_empty() {
                if previous_empty {
                    return Err(PoolError::InvariantViolation("adjacent empty blocks"));
                }
            } else {
                if extent.size == 0 {
                    return Err(PoolError::InvariantViolation("occupied block of size zero"));
                }
                let expected = (
                    byte_len(extent.size, self.layout.stride_bytes())?,
                    byte_len(extent.index_count, self.layout.index_size())?,
                );
                let staged = record
                    .data()
                    .map(|data| (data.points().len(), data.indices().len()));
                if staged != Some(expected) {
                    return Err(PoolError::InvariantViolation("staging size mismatch"));
                }
                used = (extent.end(), extent.index_end());
            }
            previous_empty = record.is_empty();
            offset = extent.end();
            index_offset = extent.index_end();
        }

        if offset != self.capacity || index_offset != self.index_capacity {
            return Err(PoolError::InvariantViolation("blocks do not cover the pool"));
        }
        if used != (self.used_size, self.used_index_size) {
            return Err(PoolError::InvariantViolation("stale used size"));
        }
        Ok(())
    }

    fn blocks(&self) -> Vec<BlockInfo> {
        self.sequence
            .iter()
            .map(|&slot| {
                let entry = &self.slots[slot as usize];
                BlockInfo {
                    id: BlockId {
                        slot,
                        generation: entry.generation,
                    },
                    extent: entry.record.extent(),
                    empty: entry.record.is_empty(),
                    valid: entry.record.is_valid(),
                }
            })
            .collect()
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            id: self.id,
            capacity: self.capacity,
            index_capacity: self.index_capacity,
            used_size: self.used_size,
            used_index_size: self.used_index_size,
            dirty: self.dirty,
            ..PoolStats::default()
        };
        for position in 0..self.sequence.len() {
            let record = self.record(position);
            let extent = record.extent();
            stats.block_count += 1;
            if record.is_empty() {
                stats.free_points += extent.size;
                stats.largest_free = stats.largest_free.max(extent.size);
            } else {
                stats.occupied_blocks += 1;
                stats.occupied_points += extent.size;
                stats.occupied_indices += extent.index_count;
            }
        }
        stats
    }
}

impl<D: BufferDevice> Drop for PoolState<D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.device.destroy_buffer(buffer);
            tracing::debug!(pool = self.id, "destroyed shared buffer pool");
        }
    }
}

/// State shared by a [`Pool`] handle and, weakly, by its blocks.
pub(crate) struct PoolShared<D: BufferDevice> {
    state: RefCell<PoolState<D>>,
    /// Blocks whose last handle dropped while `state` was borrowed.
    released: RefCell<Vec<BlockId>>,
}

impl<D: BufferDevice> PoolShared<D> {
    /// Returns a block's region, or queues it if the state is borrowed.
    pub(crate) fn release(&self, id: BlockId) {
        match self.state.try_borrow_mut() {
            Ok(mut state) => state.release(id),
            Err(_) => {
                tracing::trace!(block = %id, "pool busy, deferring block release");
                self.released.borrow_mut().push(id);
            }
        }
    }

    /// Applies queued releases unless the state is borrowed.
    pub(crate) fn flush(&self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            self.drain(&mut state);
        }
    }

    fn drain(&self, state: &mut PoolState<D>) {
        let pending = std::mem::take(&mut *self.released.borrow_mut());
        for id in pending {
            state.release(id);
        }
    }

    /// Borrows the state mutably with queued releases applied.
    pub(crate) fn state_mut(&self) -> PoolResult<RefMut<'_, PoolState<D>>> {
        let mut state = self
            .state
            .try_borrow_mut()
            .map_err(|_| PoolError::InvariantViolation("pool is busy"))?;
        self.drain(&mut state);
        Ok(state)
    }

    /// Borrows the state with queued releases applied where possible.
    pub(crate) fn state(&self) -> PoolResult<Ref<'_, PoolState<D>>> {
        self.flush();
        self.state
            .try_borrow()
            .map_err(|_| PoolError::InvariantViolation("pool is busy"))
    }
}

/// Adds `base` to every index value in `indices`.
fn rebase(indices: &mut [u8], index_type: IndexType, base: u32) -> PoolResult<()> {
    for element in indices.chunks_exact_mut(index_type.element_size()) {
        let value = index_type.decode(element) + u64::from(base);
        index_type.encode(value, element)?;
    }
    Ok(())
}

/// One physical buffer pair subdivided into [`Block`]s.
///
/// `Pool` is a cheap shared handle; clones refer to the same buffers.
///
/// # Thread Safety
///
/// NOT thread-safe. Pools and their blocks belong to the render thread.
///
/// # Panics
///
/// Accessors panic if called re-entrantly from inside [`Block::with_data`].
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::new(device, layout, BufferUsage::Static, 100, 0, false)?;
/// let block = pool.add_block(30, 0)?;
/// block.with_data(|data| data.write_points(0, &points))??;
/// block.set_valid(false)?;
/// pool.prepare()?;
/// ```
pub struct Pool<D: BufferDevice> {
    shared: Rc<PoolShared<D>>,
}

impl<D: BufferDevice> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<D: BufferDevice> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Pool")
            .field("id", &state.id)
            .field("capacity", &state.capacity)
            .field("index_capacity", &state.index_capacity)
            .field("used_size", &state.used_size)
            .field("blocks", &state.sequence.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl<D: BufferDevice> Pool<D> {
    /// Creates a pool and its device buffers.
    ///
    /// Unindexed layouts always get an index capacity of 0.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] for an invalid layout, zero capacity, or
    /// a capacity above `i32::MAX` points when indices are not rebased;
    /// [`PoolError::Device`] if the device cannot create the buffers.
    pub fn new(
        device: Rc<D>,
        layout: BufferLayout,
        usage: BufferUsage,
        capacity: u32,
        index_capacity: u32,
        rebase_indices: bool,
    ) -> PoolResult<Self> {
        layout.validate()?;
        if capacity == 0 {
            return Err(PoolError::InvalidArgument("pool capacity must be non-zero"));
        }
        // Base-vertex draws take the block offset as an i32.
        if !rebase_indices && i32::try_from(capacity).is_err() {
            return Err(PoolError::InvalidArgument(
                "pool capacity exceeds the base-vertex range",
            ));
        }
        let index_capacity = if layout.index_type.is_indexed() {
            index_capacity
        } else {
            0
        };

        let buffer = device.create_buffer(&BufferRequest {
            layout: &layout,
            usage,
            vertex_bytes: byte_len(capacity, layout.stride_bytes())?,
            index_bytes: byte_len(index_capacity, layout.index_size())?,
        })?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let whole = BlockRecord::empty(
            BlockExtent {
                offset: 0,
                size: capacity,
                index_offset: 0,
                index_count: index_capacity,
            },
            layout.stride_bytes(),
            layout.index_type,
        );
        tracing::debug!(
            pool = id,
            capacity,
            index_capacity,
            stride = layout.stride,
            usage = usage.name(),
            "created shared buffer pool"
        );

        let state = PoolState {
            id,
            device,
            buffer: Some(buffer),
            layout,
            usage,
            capacity,
            index_capacity,
            rebase_indices,
            slots: vec![Slot {
                generation: 0,
                record: whole,
            }],
            free_slots: Vec::new(),
            sequence: vec![0],
            used_size: 0,
            used_index_size: 0,
            dirty: false,
        };
        Ok(Self {
            shared: Rc::new(PoolShared {
                state: RefCell::new(state),
                released: RefCell::new(Vec::new()),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Rc<PoolShared<D>>) -> Self {
        Self { shared }
    }

    fn state(&self) -> Ref<'_, PoolState<D>> {
        self.shared.flush();
        self.shared.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, PoolState<D>> {
        let mut state = self.shared.state.borrow_mut();
        self.shared.drain(&mut state);
        state
    }

    /// Allocates a block of `size` points and `index_count` indices.
    ///
    /// First fit: the first empty block large enough in both regions is
    /// claimed and any remainder split off as a new empty block.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoSpace`] if no empty block fits or `size` is zero,
    /// [`PoolError::OutOfMemory`] if staging cannot be allocated (the pool is
    /// left unchanged).
    pub fn add_block(&self, size: u32, index_count: u32) -> PoolResult<Block<D>> {
        let mut state = self.state_mut();
        let (id, extent) = state.add_block(size, index_count)?;
        let rebased = state.rebase_indices;
        drop(state);
        Ok(Block::new(Rc::downgrade(&self.shared), id, extent, rebased))
    }

    /// Uploads all staging data if any block changed since the last prepare.
    ///
    /// The vertex image is uploaded before the index image. If the index
    /// upload fails the vertex region already holds the new image while the
    /// index region holds the old one; blocks stay invalid until a later
    /// prepare rewrites both.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`], [`PoolError::IndexOutOfRange`] or
    /// [`PoolError::Device`]; the pool stays dirty so a later call retries.
    pub fn prepare(&self) -> PoolResult<()> {
        self.state_mut().prepare()
    }

    /// Verifies the tiling, coalescing and used-size invariants.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvariantViolation`] naming the first broken invariant.
    pub fn check_invariants(&self) -> PoolResult<()> {
        self.state().check()
    }

    /// Process-unique pool id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.state().id
    }

    /// Capacity in points.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.state().capacity
    }

    /// Capacity in indices.
    #[must_use]
    pub fn index_capacity(&self) -> u32 {
        self.state().index_capacity
    }

    /// End of the last occupied block in points.
    #[must_use]
    pub fn used_size(&self) -> u32 {
        self.state().used_size
    }

    /// End of the last occupied block in indices.
    #[must_use]
    pub fn used_index_size(&self) -> u32 {
        self.state().used_index_size
    }

    /// Whether a prepare is pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Whether index values are rebased at upload instead of using base-vertex.
    #[must_use]
    pub fn rebases_indices(&self) -> bool {
        self.state().rebase_indices
    }

    /// Usage hint the buffers were created with.
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.state().usage
    }

    /// Layout of the stored records.
    #[must_use]
    pub fn layout(&self) -> Ref<'_, BufferLayout> {
        Ref::map(self.state(), |state| &state.layout)
    }

    /// Runs `f` with the device buffer pair, e.g. to bind it for drawing.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvariantViolation`] if the buffers are gone.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&D::Buffer) -> R) -> PoolResult<R> {
        let result = {
            let state = self.state();
            let buffer = state
                .buffer
                .as_ref()
                .ok_or(PoolError::InvariantViolation("pool has no device buffer"))?;
            f(buffer)
        };
        self.shared.flush();
        Ok(result)
    }

    /// Snapshot of the block sequence in offset order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.state().blocks()
    }

    /// Usage statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state().stats()
    }

    /// Whether both handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::DeviceError;
    use crate::memory_device::{MemoryBuffer, MemoryDevice};

    /// Memory device whose index uploads can be switched to fail.
    struct FlakyIndexDevice {
        inner: MemoryDevice,
        fail_index: Cell<bool>,
    }

    impl BufferDevice for FlakyIndexDevice {
        type Buffer = MemoryBuffer;

        fn create_buffer(&self, request: &BufferRequest<'_>) -> Result<MemoryBuffer, DeviceError> {
            self.inner.create_buffer(request)
        }

        fn upload(
            &self,
            buffer: &MemoryBuffer,
            region: BufferRegion,
            bytes: &[u8],
        ) -> Result<(), DeviceError> {
            if region == BufferRegion::Index && self.fail_index.get() {
                return Err(DeviceError::Upload("index region lost".into()));
            }
            self.inner.upload(buffer, region, bytes)
        }

        fn destroy_buffer(&self, buffer: MemoryBuffer) {
            self.inner.destroy_buffer(buffer);
        }
    }

    fn pool(capacity: u32) -> (Rc<MemoryDevice>, Pool<MemoryDevice>) {
        let device = Rc::new(MemoryDevice::new());
        let pool = Pool::new(
            Rc::clone(&device),
            BufferLayout::new(4),
            BufferUsage::Static,
            capacity,
            0,
            false,
        )
        .unwrap();
        (device, pool)
    }

    fn indexed_pool(
        capacity: u32,
        index_capacity: u32,
        rebase: bool,
    ) -> (Rc<MemoryDevice>, Pool<MemoryDevice>) {
        let device = Rc::new(MemoryDevice::new());
        let pool = Pool::new(
            Rc::clone(&device),
            BufferLayout::new(4).with_index_type(IndexType::U16),
            BufferUsage::Static,
            capacity,
            index_capacity,
            rebase,
        )
        .unwrap();
        (device, pool)
    }

    fn layout_of(pool: &Pool<MemoryDevice>) -> Vec<(u32, u32, bool)> {
        pool.blocks()
            .iter()
            .map(|b| (b.extent.offset, b.extent.size, b.empty))
            .collect()
    }

    fn buffer_of(pool: &Pool<MemoryDevice>) -> MemoryBuffer {
        pool.with_buffer(|b| *b).unwrap()
    }

    #[test]
    fn new_pool_is_one_empty_block() {
        let (device, pool) = pool(100);
        assert_eq!(layout_of(&pool), vec![(0, 100, true)]);
        assert_eq!(pool.used_size(), 0);
        assert!(!pool.is_dirty());
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn add_splits_first_fit() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(30, 0).unwrap();
        assert_eq!((a.offset(), a.size()), (0, 30));
        assert_eq!(layout_of(&pool), vec![(0, 30, false), (30, 70, true)]);
        let b = pool.add_block(20, 0).unwrap();
        assert_eq!(b.offset(), 30);
        assert_eq!(pool.used_size(), 50);
        assert!(pool.is_dirty());
    }

    #[test]
    fn exact_fit_does_not_split() {
        let (_device, pool) = pool(10);
        let _a = pool.add_block(10, 0).unwrap();
        assert_eq!(layout_of(&pool), vec![(0, 10, false)]);
        assert!(matches!(
            pool.add_block(1, 0),
            Err(PoolError::NoSpace { size: 1, .. })
        ));
    }

    #[test]
    fn zero_and_oversized_requests_are_no_space() {
        let (_device, pool) = pool(10);
        assert!(matches!(pool.add_block(0, 0), Err(PoolError::NoSpace { .. })));
        assert!(matches!(pool.add_block(11, 0), Err(PoolError::NoSpace { .. })));
        assert!(matches!(pool.add_block(1, 1), Err(PoolError::NoSpace { .. })));
    }

    #[test]
    fn removal_coalesces_both_neighbours() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let b = pool.add_block(10, 0).unwrap();
        let c = pool.add_block(10, 0).unwrap();
        drop(a);
        drop(c);
        assert_eq!(
            layout_of(&pool),
            vec![(0, 10, true), (10, 10, false), (20, 80, true)]
        );
        drop(b);
        assert_eq!(layout_of(&pool), vec![(0, 100, true)]);
        assert_eq!(pool.used_size(), 0);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn handle_clones_keep_block_alive() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let again = a.clone();
        assert_eq!(a.handle_count(), 2);
        drop(a);
        assert_eq!(layout_of(&pool)[0], (0, 10, false));
        drop(again);
        assert_eq!(layout_of(&pool), vec![(0, 100, true)]);
    }

    #[test]
    fn stale_id_is_an_invariant_violation() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let id = a.id();
        a.drop_owner();
        pool.state_mut().remove_block(id).unwrap();
        assert!(matches!(
            pool.state_mut().remove_block(id),
            Err(PoolError::InvariantViolation(_))
        ));
        assert!(matches!(a.with_data(|_| ()), Err(PoolError::Detached)));
    }

    #[test]
    fn handle_dropped_inside_with_data_is_released_afterwards() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let b = pool.add_block(20, 0).unwrap();
        a.with_data(move |_| drop(b)).unwrap();
        assert_eq!(layout_of(&pool), vec![(0, 10, false), (10, 90, true)]);
        assert_eq!(pool.used_size(), 10);
        drop(a);
        assert_eq!(layout_of(&pool), vec![(0, 100, true)]);
        assert_eq!(pool.used_size(), 0);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn handle_dropped_inside_with_buffer_is_released_afterwards() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let b = pool.add_block(20, 0).unwrap();
        pool.with_buffer(move |_| drop(b)).unwrap();
        drop(a);
        assert_eq!(layout_of(&pool), vec![(0, 100, true)]);
        assert_eq!(pool.used_size(), 0);
    }

    #[test]
    fn queued_release_is_applied_before_the_next_add() {
        let (_device, pool) = pool(30);
        let a = pool.add_block(10, 0).unwrap();
        let b = pool.add_block(20, 0).unwrap();
        let layout = pool.layout();
        drop(b);
        drop(layout);
        // The 20 points of `b` are reused, not leaked.
        let c = pool.add_block(20, 0).unwrap();
        assert_eq!(c.offset(), 10);
        drop(a);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let _b = pool.add_block(10, 0).unwrap();
        let old = a.id();
        drop(a);
        let c = pool.add_block(5, 0).unwrap();
        assert_eq!(c.offset(), 0);
        assert_ne!(c.id(), old);
    }

    #[test]
    fn prepare_uploads_used_extent_once() {
        let (device, pool) = pool(100);
        let a = pool.add_block(2, 0).unwrap();
        a.with_data(|data| data.write_points(0, &[7u32, 9u32])).unwrap().unwrap();
        a.set_valid(false).unwrap();
        pool.prepare().unwrap();
        assert_eq!(device.upload_count(), 1);
        assert_eq!(device.uploaded_bytes(), 8);
        assert!(!pool.is_dirty());
        assert!(a.is_valid().unwrap());

        pool.prepare().unwrap();
        assert_eq!(device.upload_count(), 1);

        let vertex = device.contents(buffer_of(&pool), BufferRegion::Vertex).unwrap();
        assert_eq!(&vertex[..8], bytemuck::cast_slice::<u32, u8>(&[7, 9]));
    }

    #[test]
    fn invalidating_a_block_dirties_the_pool() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(2, 0).unwrap();
        pool.prepare().unwrap();
        assert!(!pool.is_dirty());
        a.set_valid(true).unwrap();
        assert!(!pool.is_dirty());
        a.set_valid(false).unwrap();
        assert!(pool.is_dirty());
    }

    #[test]
    fn prepare_rebases_indices_without_base_vertex() {
        let (device, pool) = indexed_pool(100, 100, true);
        let a = pool.add_block(3, 3).unwrap();
        let b = pool.add_block(3, 3).unwrap();
        for block in [&a, &b] {
            block
                .with_data(|data| data.write_indices(0, &[0, 1, 2]))
                .unwrap()
                .unwrap();
        }
        pool.prepare().unwrap();
        let indices = device.contents(buffer_of(&pool), BufferRegion::Index).unwrap();
        let values: Vec<u16> = indices[..12]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(b.draw_range().base_vertex, 0);
    }

    #[test]
    fn base_vertex_keeps_indices_block_relative() {
        let (device, pool) = indexed_pool(100, 100, false);
        let _a = pool.add_block(3, 3).unwrap();
        let b = pool.add_block(3, 3).unwrap();
        b.with_data(|data| data.write_indices(0, &[2, 1, 0])).unwrap().unwrap();
        pool.prepare().unwrap();
        let indices = device.contents(buffer_of(&pool), BufferRegion::Index).unwrap();
        assert_eq!(&indices[6..12], &[2, 0, 1, 0, 0, 0]);
        assert_eq!(b.draw_range().base_vertex, 3);
        assert_eq!(b.draw_range().first_index, 3);
    }

    #[test]
    fn rebase_overflow_fails_and_stays_dirty() {
        let (device, pool) = indexed_pool(70_000, 10, true);
        let _a = pool.add_block(66_000, 1).unwrap();
        let b = pool.add_block(10, 1).unwrap();
        b.with_data(|data| data.write_indices(0, &[5])).unwrap().unwrap();
        assert!(matches!(
            pool.prepare(),
            Err(PoolError::IndexOutOfRange { value: 66_005, .. })
        ));
        assert!(pool.is_dirty());
        assert_eq!(device.upload_count(), 0);
    }

    #[test]
    fn lockstep_split_carries_zero_leftover() {
        let (_device, pool) = indexed_pool(10, 10, false);
        let _a = pool.add_block(10, 4).unwrap();
        let blocks = pool.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].extent.size, 0);
        assert_eq!(blocks[1].extent.index_offset, 4);
        assert_eq!(blocks[1].extent.index_count, 6);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn resize_grows_into_following_free_space() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        a.set_size(25).unwrap();
        assert_eq!(a.size(), 25);
        assert_eq!(layout_of(&pool), vec![(0, 25, false), (25, 75, true)]);
        assert!(!a.is_valid().unwrap());
        a.with_data(|data| assert_eq!(data.points().len(), 100)).unwrap();
    }

    #[test]
    fn resize_shrink_returns_tail() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let _b = pool.add_block(10, 0).unwrap();
        a.set_size(4).unwrap();
        assert_eq!(
            layout_of(&pool),
            vec![(0, 4, false), (4, 6, true), (10, 10, false), (20, 80, true)]
        );
        pool.check_invariants().unwrap();
    }

    #[test]
    fn resize_without_room_is_no_space() {
        let (_device, pool) = pool(100);
        let a = pool.add_block(10, 0).unwrap();
        let _b = pool.add_block(10, 0).unwrap();
        assert!(matches!(a.set_size(11), Err(PoolError::NoSpace { .. })));
        assert!(matches!(a.set_size(0), Err(PoolError::InvalidArgument(_))));
        assert_eq!(a.size(), 10);
    }

    #[test]
    fn resize_consuming_all_free_space_removes_it() {
        let (_device, pool) = pool(20);
        let a = pool.add_block(10, 0).unwrap();
        a.set_size(20).unwrap();
        assert_eq!(layout_of(&pool), vec![(0, 20, false)]);
    }

    #[test]
    fn dropping_pool_destroys_buffer_and_detaches_blocks() {
        let (device, pool) = pool(10);
        let a = pool.add_block(5, 0).unwrap();
        drop(pool);
        assert_eq!(device.live_buffers(), 0);
        assert!(!a.is_attached());
        assert!(matches!(a.set_valid(false), Err(PoolError::Detached)));
    }

    #[test]
    fn failed_index_upload_keeps_pool_dirty_until_retry() {
        let device = Rc::new(FlakyIndexDevice {
            inner: MemoryDevice::new(),
            fail_index: Cell::new(true),
        });
        let pool = Pool::new(
            Rc::clone(&device),
            BufferLayout::new(4).with_index_type(IndexType::U16),
            BufferUsage::Static,
            10,
            10,
            false,
        )
        .unwrap();
        let a = pool.add_block(3, 3).unwrap();
        a.with_data(|data| {
            data.write_points(0, &[1u32, 2, 3])?;
            data.write_indices(0, &[2, 1, 0])
        })
        .unwrap()
        .unwrap();

        assert!(matches!(
            pool.prepare(),
            Err(PoolError::Device(DeviceError::Upload(_)))
        ));
        assert!(pool.is_dirty());
        assert!(!a.is_valid().unwrap());
        assert_eq!(device.inner.upload_count(), 1);

        device.fail_index.set(false);
        pool.prepare().unwrap();
        assert!(!pool.is_dirty());
        assert!(a.is_valid().unwrap());
        let buffer = pool.with_buffer(|b| *b).unwrap();
        let indices = device.inner.contents(buffer, BufferRegion::Index).unwrap();
        assert_eq!(&indices[..6], &[2, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn base_vertex_pool_beyond_i32_is_rejected() {
        let device = Rc::new(MemoryDevice::new());
        let result = Pool::new(
            Rc::clone(&device),
            BufferLayout::new(4).with_index_type(IndexType::U32),
            BufferUsage::Static,
            i32::MAX as u32 + 1,
            0,
            false,
        );
        assert!(matches!(result, Err(PoolError::InvalidArgument(_))));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn device_failure_creates_no_pool() {
        let device = Rc::new(MemoryDevice::new().with_budget(16));
        let result = Pool::new(
            Rc::clone(&device),
            BufferLayout::new(4),
            BufferUsage::Stream,
            5,
            0,
            false,
        );
        assert!(matches!(result, Err(PoolError::Device(_))));
        assert_eq!(device.live_buffers(), 0);
    }
}
