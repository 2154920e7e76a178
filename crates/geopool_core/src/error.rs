//! # Pool Error Types
//!
//! All errors that can occur while sub-allocating shared geometry buffers.

use thiserror::Error;

/// Errors reported by a device backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not provide the requested buffer memory.
    #[error("device out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested from the device.
        requested: usize,
    },

    /// The backend cannot express this layout (e.g. an index width it lacks).
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// An upload was rejected by the device.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The buffer handle is not known to this device.
    #[error("unknown device buffer {0}")]
    UnknownBuffer(u32),
}

/// Errors that can occur in pool, block and registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A size or count was rejected before any mutation happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free block in this pool can hold the request.
    ///
    /// Registries consume this while falling back to the next pool; clients
    /// only see it from an in-place block resize.
    #[error("no space: requested {size} points and {index_count} indices")]
    NoSpace {
        /// Requested size in points.
        size: u32,
        /// Requested index count.
        index_count: u32,
    },

    /// A staging allocation failed.
    #[error("out of memory: failed to allocate {bytes} staging bytes")]
    OutOfMemory {
        /// Bytes that could not be allocated.
        bytes: usize,
    },

    /// Internal bookkeeping is inconsistent. This is a programming defect.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// The block handle no longer has an owning pool.
    #[error("block is detached from its pool")]
    Detached,

    /// An index value does not fit the layout's index type.
    #[error("index value {value} exceeds index type maximum {max}")]
    IndexOutOfRange {
        /// The offending (possibly rebased) value.
        value: u64,
        /// Largest value representable by the index type.
        max: u64,
    },

    /// The device backend failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while loading a [`crate::SharedBufferConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but its values are unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Allocates a zeroed staging vector, reporting exhaustion instead of aborting.
pub(crate) fn try_zeroed(len: usize) -> PoolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|_| PoolError::OutOfMemory { bytes: len })?;
    bytes.resize(len, 0);
    Ok(bytes)
}

/// Multiplies an element count by an element size in bytes.
pub(crate) fn byte_len(count: u32, element_size: usize) -> PoolResult<usize> {
    (count as usize)
        .checked_mul(element_size)
        .ok_or(PoolError::OutOfMemory { bytes: usize::MAX })
}
