//! # Device Buffer Seam
//!
//! The narrow interface through which pools create, fill and destroy their
//! physical buffers. The allocator never reads device memory back.

use crate::error::DeviceError;
use crate::layout::{BufferLayout, BufferUsage};

/// Which half of a pool's buffer pair an upload targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRegion {
    /// Point records.
    Vertex,
    /// Index values.
    Index,
}

/// Parameters for creating one pool's buffer pair.
#[derive(Clone, Copy, Debug)]
pub struct BufferRequest<'a> {
    /// Layout of the stored records.
    pub layout: &'a BufferLayout,
    /// Usage hint.
    pub usage: BufferUsage,
    /// Vertex buffer capacity in bytes.
    pub vertex_bytes: usize,
    /// Index buffer capacity in bytes, 0 for unindexed pools.
    pub index_bytes: usize,
}

/// A graphics device able to hold pool buffers.
///
/// All methods take `&self`: one device is shared by every pool through an
/// `Rc`, and backends wrap their own interior state.
pub trait BufferDevice {
    /// Handle to one vertex buffer plus optional index buffer.
    type Buffer;

    /// Creates a buffer pair with the requested capacities.
    ///
    /// # Errors
    ///
    /// Backend specific; [`DeviceError::OutOfMemory`] when memory is exhausted.
    fn create_buffer(&self, request: &BufferRequest<'_>) -> Result<Self::Buffer, DeviceError>;

    /// Writes `bytes` at the start of `region`.
    ///
    /// # Errors
    ///
    /// Backend specific.
    fn upload(
        &self,
        buffer: &Self::Buffer,
        region: BufferRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    /// Releases a buffer pair.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Whether draws can add a per-draw vertex offset to index values.
    fn supports_base_vertex(&self) -> bool {
        true
    }
}
