//! # GEOPOOL wgpu Backend
//!
//! [`BufferDevice`] on top of wgpu. Every pool gets one vertex buffer and,
//! for indexed layouts, one index buffer. Uploads go through
//! `Queue::write_buffer`, padded to the copy alignment.
//!
//! ## Example
//!
//! ```rust,ignore
//! let device = Rc::new(WgpuDevice::new(Arc::clone(&gpu), Arc::clone(&queue)));
//! let mut set = RegistrySet::new(device, SharedBufferConfig::default());
//! // ...
//! pool.with_buffer(|buffers| {
//!     pass.set_vertex_buffer(0, buffers.vertex().slice(..));
//! })?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

use std::borrow::Cow;
use std::cell::Cell;
use std::sync::Arc;

use geopool_core::{
    BufferDevice, BufferLayout, BufferRegion, BufferRequest, ComponentType, DeviceError,
    IndexType, VertexAttribute,
};

/// Buffers backing one pool.
#[derive(Debug)]
pub struct WgpuBuffers {
    id: u32,
    vertex: Arc<wgpu::Buffer>,
    index: Option<Arc<wgpu::Buffer>>,
    index_format: Option<wgpu::IndexFormat>,
}

impl WgpuBuffers {
    /// Device-unique id, used in diagnostics.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Vertex buffer.
    #[must_use]
    pub fn vertex(&self) -> &Arc<wgpu::Buffer> {
        &self.vertex
    }

    /// Index buffer, `None` for unindexed layouts.
    #[must_use]
    pub fn index(&self) -> Option<&Arc<wgpu::Buffer>> {
        self.index.as_ref()
    }

    /// Format to bind the index buffer with.
    #[must_use]
    pub fn index_format(&self) -> Option<wgpu::IndexFormat> {
        self.index_format
    }
}

/// A wgpu device and queue shared by every pool.
///
/// # Thread Safety
///
/// NOT thread-safe, like the pools that use it. The wrapped device and queue
/// may still be shared with other threads.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    next_id: Cell<u32>,
}

impl WgpuDevice {
    /// Wraps a device and its queue.
    #[must_use]
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            next_id: Cell::new(0),
        }
    }

    /// The wrapped device.
    #[must_use]
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// The wrapped queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    fn create(
        &self,
        label: &str,
        bytes: usize,
        usage: wgpu::BufferUsages,
    ) -> Result<Arc<wgpu::Buffer>, DeviceError> {
        let size = aligned_size(bytes);
        if size > self.device.limits().max_buffer_size {
            return Err(DeviceError::OutOfMemory { requested: bytes });
        }
        Ok(Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })))
    }
}

impl BufferDevice for WgpuDevice {
    type Buffer = WgpuBuffers;

    fn create_buffer(&self, request: &BufferRequest<'_>) -> Result<WgpuBuffers, DeviceError> {
        vertex_attributes(request.layout, 0)?;
        let index_format = index_format(request.layout.index_type)?;
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        let vertex = self.create(
            &format!("Shared Vertex Buffer {id} ({})", request.usage.name()),
            request.vertex_bytes,
            wgpu::BufferUsages::VERTEX,
        )?;
        let index = match index_format {
            Some(_) if request.index_bytes > 0 => Some(self.create(
                &format!("Shared Index Buffer {id} ({})", request.usage.name()),
                request.index_bytes,
                wgpu::BufferUsages::INDEX,
            )?),
            _ => None,
        };

        tracing::debug!(
            buffer = id,
            vertex_bytes = request.vertex_bytes,
            index_bytes = request.index_bytes,
            "created wgpu shared buffers"
        );
        Ok(WgpuBuffers {
            id,
            vertex,
            index,
            index_format,
        })
    }

    fn upload(
        &self,
        buffer: &WgpuBuffers,
        region: BufferRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let target = match region {
            BufferRegion::Vertex => &buffer.vertex,
            BufferRegion::Index => buffer
                .index
                .as_ref()
                .ok_or(DeviceError::UnknownBuffer(buffer.id))?,
        };
        let data = padded(bytes);
        if data.len() as u64 > target.size() {
            return Err(DeviceError::Upload(format!(
                "{} bytes do not fit a {} byte {:?} buffer",
                data.len(),
                target.size(),
                region
            )));
        }
        self.queue.write_buffer(target, 0, &data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: WgpuBuffers) {
        buffer.vertex.destroy();
        if let Some(index) = &buffer.index {
            index.destroy();
        }
        tracing::debug!(buffer = buffer.id, "destroyed wgpu shared buffers");
    }
}

/// Rounds a byte size up to the copy alignment. Never returns 0.
#[must_use]
pub fn aligned_size(bytes: usize) -> wgpu::BufferAddress {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    (bytes as u64).max(1).div_ceil(align) * align
}

/// Pads upload data with zeros to the copy alignment.
fn padded(bytes: &[u8]) -> Cow<'_, [u8]> {
    let len = aligned_size(bytes.len()) as usize;
    if len == bytes.len() {
        return Cow::Borrowed(bytes);
    }
    let mut data = bytes.to_vec();
    data.resize(len, 0);
    Cow::Owned(data)
}

/// Index format for `index_type`, `None` if unindexed.
///
/// # Errors
///
/// [`DeviceError::UnsupportedLayout`] for 8-bit indices.
pub fn index_format(index_type: IndexType) -> Result<Option<wgpu::IndexFormat>, DeviceError> {
    match index_type {
        IndexType::None => Ok(None),
        IndexType::U8 => Err(DeviceError::UnsupportedLayout(
            "wgpu has no 8-bit index format".to_owned(),
        )),
        IndexType::U16 => Ok(Some(wgpu::IndexFormat::Uint16)),
        IndexType::U32 => Ok(Some(wgpu::IndexFormat::Uint32)),
    }
}

/// Vertex format for one attribute.
///
/// # Errors
///
/// [`DeviceError::UnsupportedLayout`] for component counts wgpu cannot
/// express for the component type, or normalized 32-bit integers.
pub fn vertex_format(attribute: &VertexAttribute) -> Result<wgpu::VertexFormat, DeviceError> {
    use wgpu::VertexFormat as F;

    let format = match (attribute.component_type, attribute.normalized, attribute.components) {
        (ComponentType::Float, _, 1) => Some(F::Float32),
        (ComponentType::Float, _, 2) => Some(F::Float32x2),
        (ComponentType::Float, _, 3) => Some(F::Float32x3),
        (ComponentType::Float, _, 4) => Some(F::Float32x4),
        (ComponentType::U8, false, 2) => Some(F::Uint8x2),
        (ComponentType::U8, false, 4) => Some(F::Uint8x4),
        (ComponentType::U8, true, 2) => Some(F::Unorm8x2),
        (ComponentType::U8, true, 4) => Some(F::Unorm8x4),
        (ComponentType::I8, false, 2) => Some(F::Sint8x2),
        (ComponentType::I8, false, 4) => Some(F::Sint8x4),
        (ComponentType::I8, true, 2) => Some(F::Snorm8x2),
        (ComponentType::I8, true, 4) => Some(F::Snorm8x4),
        (ComponentType::U16, false, 2) => Some(F::Uint16x2),
        (ComponentType::U16, false, 4) => Some(F::Uint16x4),
        (ComponentType::U16, true, 2) => Some(F::Unorm16x2),
        (ComponentType::U16, true, 4) => Some(F::Unorm16x4),
        (ComponentType::I16, false, 2) => Some(F::Sint16x2),
        (ComponentType::I16, false, 4) => Some(F::Sint16x4),
        (ComponentType::I16, true, 2) => Some(F::Snorm16x2),
        (ComponentType::I16, true, 4) => Some(F::Snorm16x4),
        (ComponentType::U32, false, 1) => Some(F::Uint32),
        (ComponentType::U32, false, 2) => Some(F::Uint32x2),
        (ComponentType::U32, false, 3) => Some(F::Uint32x3),
        (ComponentType::U32, false, 4) => Some(F::Uint32x4),
        (ComponentType::I32, false, 1) => Some(F::Sint32),
        (ComponentType::I32, false, 2) => Some(F::Sint32x2),
        (ComponentType::I32, false, 3) => Some(F::Sint32x3),
        (ComponentType::I32, false, 4) => Some(F::Sint32x4),
        _ => None,
    };
    format.ok_or_else(|| {
        DeviceError::UnsupportedLayout(format!(
            "{} x{}{} has no wgpu vertex format",
            attribute.component_type.name(),
            attribute.components,
            if attribute.normalized { " normalized" } else { "" }
        ))
    })
}

/// wgpu attributes for `layout`, with shader locations numbered from
/// `first_location` in declaration order.
///
/// # Errors
///
/// As [`vertex_format`].
pub fn vertex_attributes(
    layout: &BufferLayout,
    first_location: u32,
) -> Result<Vec<wgpu::VertexAttribute>, DeviceError> {
    layout
        .attributes
        .iter()
        .zip(first_location..)
        .map(|(attribute, shader_location)| {
            Ok(wgpu::VertexAttribute {
                format: vertex_format(attribute)?,
                offset: u64::from(attribute.offset),
                shader_location,
            })
        })
        .collect()
}

/// Vertex buffer layout over `attributes` for pipelines drawing from pools.
#[must_use]
pub fn vertex_buffer_layout<'a>(
    layout: &BufferLayout,
    attributes: &'a [wgpu::VertexAttribute],
) -> wgpu::VertexBufferLayout<'a> {
    wgpu::VertexBufferLayout {
        array_stride: u64::from(layout.stride),
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes,
    }
}
