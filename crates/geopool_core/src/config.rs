//! # Shared Buffer Configuration
//!
//! Standard pool sizing and draw choices, loaded once at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layout::BufferLayout;

/// Sizing and draw choices shared by every registry.
///
/// ```toml
/// max_vertex_bytes = 4194304
/// max_index_bytes = 4194304
/// use_base_vertex = false
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedBufferConfig {
    /// Vertex capacity of a standard pool in bytes.
    pub max_vertex_bytes: u32,
    /// Index capacity of a standard pool in bytes.
    pub max_index_bytes: u32,
    /// Draw with a base vertex instead of rebasing index values at upload.
    ///
    /// Only honoured when the device also supports it.
    pub use_base_vertex: bool,
}

impl SharedBufferConfig {
    /// Default standard pool vertex capacity: 4MB.
    pub const DEFAULT_MAX_VERTEX_BYTES: u32 = 4_194_304;

    /// Default standard pool index capacity: 4MB.
    pub const DEFAULT_MAX_INDEX_BYTES: u32 = 4_194_304;

    /// Parses a config from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML, [`ConfigError::Invalid`] on
    /// unusable values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks that standard pools can hold at least something.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `max_vertex_bytes` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_vertex_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_vertex_bytes must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Standard pool capacity in points for `layout`. Never less than one.
    #[must_use]
    pub fn max_point_count(&self, layout: &BufferLayout) -> u32 {
        (self.max_vertex_bytes / layout.stride.max(1)).max(1)
    }

    /// Standard pool capacity in indices for `layout`, 0 if unindexed.
    #[must_use]
    pub fn max_index_count(&self, layout: &BufferLayout) -> u32 {
        match layout.index_size() {
            0 => 0,
            size => self.max_index_bytes / size as u32,
        }
    }
}

impl Default for SharedBufferConfig {
    fn default() -> Self {
        Self {
            max_vertex_bytes: Self::DEFAULT_MAX_VERTEX_BYTES,
            max_index_bytes: Self::DEFAULT_MAX_INDEX_BYTES,
            use_base_vertex: true,
        }
    }
}
