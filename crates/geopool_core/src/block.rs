//! # Blocks
//!
//! A block is one client's region inside a [`Pool`]: a run of points in the
//! vertex region plus a run of indices in the index region, and the staging
//! bytes the client fills before the pool uploads them.
//!
//! The pool owns the block records. Clients hold [`Block`] handles: a weak
//! back-reference to the pool plus a generation-checked slot id. Releasing the
//! last clone of a handle returns its region to the pool.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytemuck::Pod;

use crate::device::BufferDevice;
use crate::error::{byte_len, try_zeroed, PoolError, PoolResult};
use crate::layout::IndexType;
use crate::pool::{Pool, PoolShared};

/// Generation-checked reference to a block slot inside one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl BlockId {
    /// Slot index inside the pool's block arena.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Generation of the slot when the block was handed out.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(slot={}, gen={})", self.slot, self.generation)
    }
}

/// Position of a block in both regions of its pool.
///
/// Offsets and sizes count points and indices, never bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockExtent {
    /// First point in the vertex region.
    pub offset: u32,
    /// Number of points.
    pub size: u32,
    /// First index in the index region.
    pub index_offset: u32,
    /// Number of indices.
    pub index_count: u32,
}

impl BlockExtent {
    /// One past the last point.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// One past the last index.
    #[inline]
    #[must_use]
    pub const fn index_end(&self) -> u32 {
        self.index_offset + self.index_count
    }
}

/// Arguments for drawing one block out of its pool's buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawRange {
    /// First point of the block in the vertex buffer.
    pub first_vertex: u32,
    /// Number of points.
    pub vertex_count: u32,
    /// First index of the block in the index buffer.
    pub first_index: u32,
    /// Number of indices.
    pub index_count: u32,
    /// Value the draw adds to every index. Zero when the pool rebased them.
    pub base_vertex: i32,
}

/// Staging bytes of an occupied block.
///
/// Point bytes are laid out exactly as the pool's vertex buffer expects.
/// Index values are block-relative: index 0 is the block's first point.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockData {
    points: Vec<u8>,
    indices: Vec<u8>,
    stride: usize,
    index_type: IndexType,
}

impl BlockData {
    pub(crate) fn allocate(
        size: u32,
        index_count: u32,
        stride: usize,
        index_type: IndexType,
    ) -> PoolResult<Self> {
        Ok(Self {
            points: try_zeroed(byte_len(size, stride)?)?,
            indices: try_zeroed(byte_len(index_count, index_type.element_size())?)?,
            stride,
            index_type,
        })
    }

    /// Number of points this block holds.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.points.len() / self.stride
    }

    /// Number of indices this block holds.
    #[must_use]
    pub fn index_count(&self) -> usize {
        match self.index_type.element_size() {
            0 => 0,
            size => self.indices.len() / size,
        }
    }

    /// Raw point bytes.
    #[inline]
    #[must_use]
    pub fn points(&self) -> &[u8] {
        &self.points
    }

    /// Raw point bytes, writable.
    #[inline]
    pub fn points_mut(&mut self) -> &mut [u8] {
        &mut self.points
    }

    /// Raw block-relative index bytes in the layout's index width.
    #[inline]
    #[must_use]
    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    /// Raw index bytes, writable.
    #[inline]
    pub fn indices_mut(&mut self) -> &mut [u8] {
        &mut self.indices
    }

    /// Copies typed records starting at point `first_point`.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] if the bytes do not fit the block.
    pub fn write_points<T: Pod>(&mut self, first_point: u32, points: &[T]) -> PoolResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(points);
        let start = first_point as usize * self.stride;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.points.len())
            .ok_or(PoolError::InvalidArgument("point data exceeds block size"))?;
        self.points[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Encodes block-relative indices starting at index `first_index`.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] if the indices do not fit the block,
    /// [`PoolError::IndexOutOfRange`] if a value addresses a point outside the
    /// block or does not fit the index width.
    pub fn write_indices(&mut self, first_index: u32, indices: &[u32]) -> PoolResult<()> {
        let size = self.index_type.element_size();
        if size == 0 {
            return Err(PoolError::InvalidArgument("layout has no index region"));
        }
        let start = first_index as usize * size;
        let end = start
            .checked_add(indices.len() * size)
            .filter(|&end| end <= self.indices.len())
            .ok_or(PoolError::InvalidArgument("index data exceeds block index count"))?;

        let points = self.point_count() as u64;
        for (&value, dst) in indices
            .iter()
            .zip(self.indices[start..end].chunks_exact_mut(size))
        {
            if u64::from(value) >= points {
                return Err(PoolError::IndexOutOfRange {
                    value: u64::from(value),
                    max: points.saturating_sub(1),
                });
            }
            self.index_type.encode(u64::from(value), dst)?;
        }
        Ok(())
    }

    /// Decodes the block-relative index at position `i`.
    #[must_use]
    pub fn index(&self, i: usize) -> Option<u32> {
        let size = self.index_type.element_size();
        let start = i.checked_mul(size)?;
        let bytes = self.indices.get(start..start.checked_add(size)?)?;
        if bytes.is_empty() {
            return None;
        }
        u32::try_from(self.index_type.decode(bytes)).ok()
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("point_bytes", &self.points.len())
            .field("index_bytes", &self.indices.len())
            .finish()
    }
}

/// A pool-owned block record: extent, staging buffer and upload state.
#[derive(Debug)]
pub(crate) struct BlockRecord {
    extent: BlockExtent,
    /// Present exactly while the block is occupied.
    data: Option<BlockData>,
    /// The pool's uploaded image reflects `data`.
    valid: bool,
    stride: usize,
    index_type: IndexType,
}

impl BlockRecord {
    /// Creates an empty record covering `extent`.
    pub(crate) fn empty(extent: BlockExtent, stride: usize, index_type: IndexType) -> Self {
        Self {
            extent,
            data: None,
            valid: true,
            stride,
            index_type,
        }
    }

    #[inline]
    pub(crate) fn extent(&self) -> BlockExtent {
        self.extent
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub(crate) fn data(&self) -> Option<&BlockData> {
        self.data.as_ref()
    }

    #[inline]
    pub(crate) fn data_mut(&mut self) -> Option<&mut BlockData> {
        self.data.as_mut()
    }

    /// Changes the point count, reallocating staging if occupied.
    ///
    /// On allocation failure the record is left unchanged.
    pub(crate) fn set_size(&mut self, size: u32) -> PoolResult<()> {
        if size == self.extent.size {
            return Ok(());
        }
        if self.data.is_some() {
            if size == 0 {
                return Err(PoolError::InvalidArgument(
                    "occupied block must hold at least one point",
                ));
            }
            self.data = Some(BlockData::allocate(
                size,
                self.extent.index_count,
                self.stride,
                self.index_type,
            )?);
            self.valid = false;
        }
        self.extent.size = size;
        Ok(())
    }

    /// Changes the index count, reallocating staging if occupied.
    pub(crate) fn set_index_count(&mut self, index_count: u32) -> PoolResult<()> {
        if index_count == self.extent.index_count {
            return Ok(());
        }
        if self.data.is_some() {
            self.data = Some(BlockData::allocate(
                self.extent.size,
                index_count,
                self.stride,
                self.index_type,
            )?);
            self.valid = false;
        }
        self.extent.index_count = index_count;
        Ok(())
    }

    /// Releases staging when emptied, allocates it when occupied.
    pub(crate) fn set_empty(&mut self, empty: bool) -> PoolResult<()> {
        if empty {
            self.data = None;
            self.valid = true;
            return Ok(());
        }
        if self.extent.size == 0 {
            return Err(PoolError::InvalidArgument(
                "occupied block must hold at least one point",
            ));
        }
        self.data = Some(BlockData::allocate(
            self.extent.size,
            self.extent.index_count,
            self.stride,
            self.index_type,
        )?);
        self.valid = false;
        Ok(())
    }

    #[inline]
    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Moves an empty record's start in both regions.
    pub(crate) fn move_to(&mut self, offset: u32, index_offset: u32) {
        self.extent.offset = offset;
        self.extent.index_offset = index_offset;
    }

    /// Installs freshly allocated staging for a new extent.
    pub(crate) fn replace(&mut self, size: u32, index_count: u32, data: BlockData) {
        self.extent.size = size;
        self.extent.index_count = index_count;
        self.data = Some(data);
        self.valid = false;
    }
}

/// Shared part of a [`Block`] handle. Dropping it returns the region.
struct BlockShared<D: BufferDevice> {
    owner: RefCell<Weak<PoolShared<D>>>,
    id: BlockId,
    extent: Cell<BlockExtent>,
    rebased: bool,
}

impl<D: BufferDevice> Drop for BlockShared<D> {
    fn drop(&mut self) {
        if let Some(pool) = self.owner.get_mut().upgrade() {
            pool.release(self.id);
        }
    }
}

/// Client handle to a block.
///
/// Cloning shares the handle. When the last clone is dropped the block is
/// removed from its pool and its space coalesced with free neighbours.
///
/// # Thread Safety
///
/// NOT thread-safe. Handles live on the render thread with their pools.
pub struct Block<D: BufferDevice> {
    shared: Rc<BlockShared<D>>,
}

impl<D: BufferDevice> Clone for Block<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<D: BufferDevice> fmt::Debug for Block<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.shared.id)
            .field("extent", &self.shared.extent.get())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<D: BufferDevice> Block<D> {
    pub(crate) fn new(
        owner: Weak<PoolShared<D>>,
        id: BlockId,
        extent: BlockExtent,
        rebased: bool,
    ) -> Self {
        Self {
            shared: Rc::new(BlockShared {
                owner: RefCell::new(owner),
                id,
                extent: Cell::new(extent),
                rebased,
            }),
        }
    }

    /// Slot id inside the owning pool.
    #[inline]
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.shared.id
    }

    /// Current extent in both regions.
    #[inline]
    #[must_use]
    pub fn extent(&self) -> BlockExtent {
        self.shared.extent.get()
    }

    /// First point in the pool's vertex region.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.extent().offset
    }

    /// Number of points.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.extent().size
    }

    /// First index in the pool's index region.
    #[inline]
    #[must_use]
    pub fn index_offset(&self) -> u32 {
        self.extent().index_offset
    }

    /// Number of indices.
    #[inline]
    #[must_use]
    pub fn index_count(&self) -> u32 {
        self.extent().index_count
    }

    /// Number of live clones of this handle.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }

    /// Whether the handle still has an owning pool.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared.owner.borrow().strong_count() > 0
    }

    /// The owning pool, if it is still alive.
    #[must_use]
    pub fn pool(&self) -> Option<Pool<D>> {
        self.shared.owner.borrow().upgrade().map(Pool::from_shared)
    }

    /// Draw arguments for this block.
    #[must_use]
    pub fn draw_range(&self) -> DrawRange {
        let extent = self.extent();
        DrawRange {
            first_vertex: extent.offset,
            vertex_count: extent.size,
            first_index: extent.index_offset,
            index_count: extent.index_count,
            base_vertex: if self.shared.rebased {
                0
            } else {
                // Pools drawn with base-vertex are capped at i32::MAX points.
                let base = i32::try_from(extent.offset);
                debug_assert!(base.is_ok(), "offset {} exceeds i32", extent.offset);
                base.unwrap_or(i32::MAX)
            },
        }
    }

    /// Runs `f` on the block's staging data.
    ///
    /// Writing does not schedule an upload; call [`Self::set_valid`] with
    /// `false` afterwards.
    ///
    /// # Errors
    ///
    /// [`PoolError::Detached`] if the pool is gone,
    /// [`PoolError::InvariantViolation`] if the pool is busy or no longer
    /// lists this block.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut BlockData) -> R) -> PoolResult<R> {
        let pool = self.owner()?;
        let result = {
            let mut state = pool.state_mut()?;
            let data = state.block_data_mut(self.shared.id)?;
            f(data)
        };
        // Handles dropped inside `f` were queued.
        pool.flush();
        Ok(result)
    }

    /// Whether the pool's uploaded image reflects this block's staging data.
    ///
    /// # Errors
    ///
    /// As [`Self::with_data`].
    pub fn is_valid(&self) -> PoolResult<bool> {
        let pool = self.owner()?;
        let state = pool.state()?;
        let valid = state.block_valid(self.shared.id)?;
        Ok(valid)
    }

    /// Marks the staging data as uploaded (`true`) or pending (`false`).
    ///
    /// Clearing validity makes the pool dirty so its next prepare uploads.
    ///
    /// # Errors
    ///
    /// As [`Self::with_data`].
    pub fn set_valid(&self, valid: bool) -> PoolResult<()> {
        let pool = self.owner()?;
        let mut state = pool.state_mut()?;
        state.set_block_valid(self.shared.id, valid)
    }

    /// Resizes the block in place, keeping its index count.
    ///
    /// Staging data is discarded and the block becomes invalid.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] for zero, [`PoolError::NoSpace`] if the
    /// block cannot grow where it is, otherwise as [`Self::with_data`].
    pub fn set_size(&self, size: u32) -> PoolResult<()> {
        self.resize(size, self.index_count())
    }

    /// Changes the block's index count in place, keeping its size.
    ///
    /// # Errors
    ///
    /// As [`Self::set_size`].
    pub fn set_index_count(&self, index_count: u32) -> PoolResult<()> {
        self.resize(self.size(), index_count)
    }

    /// Severs the back-reference to the pool without touching the region.
    ///
    /// Dropping the handle afterwards no longer talks to the pool.
    pub fn drop_owner(&self) {
        *self.shared.owner.borrow_mut() = Weak::new();
    }

    fn resize(&self, size: u32, index_count: u32) -> PoolResult<()> {
        let pool = self.owner()?;
        let mut state = pool.state_mut()?;
        let extent = state.resize_block(self.shared.id, size, index_count)?;
        self.shared.extent.set(extent);
        Ok(())
    }

    fn owner(&self) -> PoolResult<Rc<PoolShared<D>>> {
        self.shared
            .owner
            .borrow()
            .upgrade()
            .ok_or(PoolError::Detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied(size: u32, index_count: u32) -> BlockRecord {
        let mut record = BlockRecord::empty(
            BlockExtent {
                offset: 0,
                size,
                index_offset: 0,
                index_count,
            },
            8,
            IndexType::U16,
        );
        record.set_empty(false).unwrap();
        record
    }

    #[test]
    fn occupying_allocates_staging_sized_by_stride() {
        let record = occupied(4, 6);
        let data = record.data().unwrap();
        assert_eq!(data.points().len(), 32);
        assert_eq!(data.indices().len(), 12);
        assert!(!record.is_valid());
    }

    #[test]
    fn emptying_releases_staging() {
        let mut record = occupied(4, 6);
        record.set_empty(true).unwrap();
        assert!(record.is_empty());
        assert!(record.data().is_none());
    }

    #[test]
    fn resizing_reallocates_and_discards() {
        let mut record = occupied(4, 0);
        record.data_mut().unwrap().points_mut()[0] = 7;
        record.set_valid(true);
        record.set_size(2).unwrap();
        let data = record.data().unwrap();
        assert_eq!(data.points().len(), 16);
        assert_eq!(data.points()[0], 0);
        assert!(!record.is_valid());
    }

    #[test]
    fn occupied_record_rejects_zero_size() {
        let mut record = occupied(4, 0);
        assert!(matches!(
            record.set_size(0),
            Err(PoolError::InvalidArgument(_))
        ));
        assert_eq!(record.extent().size, 4);
    }

    #[test]
    fn empty_record_resizes_without_staging() {
        let mut record = BlockRecord::empty(BlockExtent::default(), 8, IndexType::None);
        record.set_size(10).unwrap();
        record.set_index_count(3).unwrap();
        assert_eq!(record.extent().size, 10);
        assert!(record.data().is_none());
    }

    #[test]
    fn typed_point_writes_land_at_stride_offsets() {
        let mut record = occupied(2, 0);
        let data = record.data_mut().unwrap();
        data.write_points(1, &[1.5f32, -2.0]).unwrap();
        assert_eq!(&data.points()[8..12], &1.5f32.to_le_bytes());
        assert!(data.write_points(2, &[0u8]).is_err());
    }

    #[test]
    fn index_writes_are_block_relative_and_checked() {
        let mut record = occupied(3, 3);
        let data = record.data_mut().unwrap();
        data.write_indices(0, &[2, 1, 0]).unwrap();
        assert_eq!(data.index(0), Some(2));
        assert_eq!(data.index(2), Some(0));
        assert_eq!(data.index(3), None);
        assert_eq!(data.index(usize::MAX), None);
        assert_eq!(data.index(usize::MAX / 2 + 1), None);
        assert_eq!(
            data.write_indices(0, &[3]),
            Err(PoolError::IndexOutOfRange { value: 3, max: 2 })
        );
        assert!(data.write_indices(2, &[0, 1]).is_err());
    }
}
