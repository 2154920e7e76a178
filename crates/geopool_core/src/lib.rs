//! # GEOPOOL Core
//!
//! Sub-allocating geometry buffer pools. Many small meshes share a few large
//! device buffers so a frame binds a handful of buffers instead of one per
//! mesh.
//!
//! ## Architecture
//!
//! 1. **Pool** - one fixed-capacity vertex/index buffer pair, tiled by blocks
//! 2. **Block** - a client's region inside a pool, with CPU staging data
//! 3. **Pool Registry** - first-fit routing across all pools of one layout
//!
//! Sizes and offsets are counted in points (one layout-sized record), never
//! bytes. Staging data is uploaded lazily: a pool only rebuilds and uploads
//! its image in [`Pool::prepare`] after a block changed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use geopool_core::{BufferLayout, BufferUsage, MemoryDevice, RegistrySet, SharedBufferConfig};
//!
//! let mut set = RegistrySet::new(Rc::new(MemoryDevice::new()), SharedBufferConfig::default());
//! let registry = set.get_with(&BufferLayout::new(12), BufferUsage::Static)?;
//! let block = registry.add_data(3, 0)?;
//! block.with_data(|data| data.write_points(0, &triangle))??;
//! block.set_valid(false)?;
//! set.prepare_all()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod block;
pub mod config;
pub mod device;
pub mod error;
pub mod layout;
pub mod memory_device;
pub mod pool;
pub mod registry;
pub mod set;
pub mod stats;

pub use block::{Block, BlockData, BlockExtent, BlockId, DrawRange};
pub use config::SharedBufferConfig;
pub use device::{BufferDevice, BufferRegion, BufferRequest};
pub use error::{ConfigError, DeviceError, PoolError, PoolResult};
pub use layout::{BufferLayout, BufferUsage, ComponentType, IndexType, VertexAttribute};
pub use memory_device::{MemoryBuffer, MemoryDevice};
pub use pool::Pool;
pub use registry::PoolRegistry;
pub use set::RegistrySet;
pub use stats::{BlockInfo, PoolStats, RegistryStats};
