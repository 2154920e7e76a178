//! # Memory Device
//!
//! A [`BufferDevice`] that keeps buffer contents in host memory. Used by
//! headless builds that must not pull GPU dependencies, and by tests that need
//! to inspect exactly what a pool uploaded.

use std::cell::{Cell, RefCell};

use crate::device::{BufferDevice, BufferRegion, BufferRequest};
use crate::error::DeviceError;

/// Handle to a buffer pair owned by a [`MemoryDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBuffer {
    id: u32,
}

impl MemoryBuffer {
    /// Device-unique buffer id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self.id
    }
}

/// Contents of one live buffer pair.
struct Storage {
    vertex: Vec<u8>,
    index: Vec<u8>,
}

/// Host-memory device with call counters and an optional byte budget.
///
/// # Thread Safety
///
/// NOT thread-safe, like the pools that use it.
pub struct MemoryDevice {
    /// Storage per buffer id; `None` once destroyed.
    buffers: RefCell<Vec<Option<Storage>>>,
    /// Bytes currently held by live buffers.
    allocated: Cell<usize>,
    /// Creation fails once `allocated` would exceed this.
    budget: Option<usize>,
    base_vertex: bool,
    uploads: Cell<usize>,
    uploaded_bytes: Cell<usize>,
}

impl MemoryDevice {
    /// Creates an unbounded device that supports base-vertex draws.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: RefCell::new(Vec::new()),
            allocated: Cell::new(0),
            budget: None,
            base_vertex: true,
            uploads: Cell::new(0),
            uploaded_bytes: Cell::new(0),
        }
    }

    /// Limits the bytes all live buffers may hold together.
    #[must_use]
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    /// Sets whether base-vertex draws are reported as available.
    #[must_use]
    pub fn with_base_vertex(mut self, supported: bool) -> Self {
        self.base_vertex = supported;
        self
    }

    /// Number of buffer pairs that are currently alive.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.borrow().iter().filter(|b| b.is_some()).count()
    }

    /// Bytes held by live buffers.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.get()
    }

    /// Number of upload calls received so far.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.get()
    }

    /// Total bytes received through uploads.
    #[must_use]
    pub fn uploaded_bytes(&self) -> usize {
        self.uploaded_bytes.get()
    }

    /// Copy of a region's current contents, `None` for a destroyed buffer.
    #[must_use]
    pub fn contents(&self, buffer: MemoryBuffer, region: BufferRegion) -> Option<Vec<u8>> {
        let buffers = self.buffers.borrow();
        let storage = buffers.get(buffer.id as usize)?.as_ref()?;
        Some(match region {
            BufferRegion::Vertex => storage.vertex.clone(),
            BufferRegion::Index => storage.index.clone(),
        })
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferDevice for MemoryDevice {
    type Buffer = MemoryBuffer;

    fn create_buffer(&self, request: &BufferRequest<'_>) -> Result<MemoryBuffer, DeviceError> {
        let requested = request.vertex_bytes.saturating_add(request.index_bytes);
        let total = self.allocated.get().saturating_add(requested);
        if self.budget.is_some_and(|budget| total > budget) {
            return Err(DeviceError::OutOfMemory { requested });
        }

        let mut buffers = self.buffers.borrow_mut();
        let id = u32::try_from(buffers.len())
            .map_err(|_| DeviceError::OutOfMemory { requested })?;
        buffers.push(Some(Storage {
            vertex: vec![0; request.vertex_bytes],
            index: vec![0; request.index_bytes],
        }));
        self.allocated.set(total);
        Ok(MemoryBuffer { id })
    }

    fn upload(
        &self,
        buffer: &MemoryBuffer,
        region: BufferRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.borrow_mut();
        let storage = buffers
            .get_mut(buffer.id as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownBuffer(buffer.id))?;
        let target = match region {
            BufferRegion::Vertex => &mut storage.vertex,
            BufferRegion::Index => &mut storage.index,
        };
        if bytes.len() > target.len() {
            return Err(DeviceError::Upload(format!(
                "{} bytes do not fit a {} byte {:?} region",
                bytes.len(),
                target.len(),
                region
            )));
        }
        target[..bytes.len()].copy_from_slice(bytes);
        self.uploads.set(self.uploads.get() + 1);
        self.uploaded_bytes.set(self.uploaded_bytes.get() + bytes.len());
        Ok(())
    }

    fn destroy_buffer(&self, buffer: MemoryBuffer) {
        let mut buffers = self.buffers.borrow_mut();
        if let Some(storage) = buffers.get_mut(buffer.id as usize).and_then(Option::take) {
            let freed = storage.vertex.len() + storage.index.len();
            self.allocated.set(self.allocated.get().saturating_sub(freed));
        }
    }

    fn supports_base_vertex(&self) -> bool {
        self.base_vertex
    }
}
