//! # Buffer Layouts
//!
//! Immutable description of the records stored in a shared buffer. Pools are
//! interchangeable only when their layout and usage compare equal.

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Width of the integers stored in a pool's index region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// No index region.
    #[default]
    None,
    /// 8-bit indices.
    U8,
    /// 16-bit indices.
    U16,
    /// 32-bit indices.
    U32,
}

impl IndexType {
    /// Size of one index in bytes, 0 for [`IndexType::None`].
    #[inline]
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Largest index value this type can hold.
    #[inline]
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::None => 0,
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
        }
    }

    /// Whether the layout has an index region at all.
    #[inline]
    #[must_use]
    pub const fn is_indexed(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Short name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::U8 => "byte",
            Self::U16 => "short",
            Self::U32 => "int",
        }
    }

    /// Encodes `value` little-endian into `dst`, which must be one element wide.
    pub(crate) fn encode(self, value: u64, dst: &mut [u8]) -> PoolResult<()> {
        if value > self.max_value() {
            return Err(PoolError::IndexOutOfRange {
                value,
                max: self.max_value(),
            });
        }
        match self {
            Self::None => {}
            Self::U8 => dst[0] = value as u8,
            Self::U16 => dst.copy_from_slice(&(value as u16).to_le_bytes()),
            Self::U32 => dst.copy_from_slice(&(value as u32).to_le_bytes()),
        }
        Ok(())
    }

    /// Decodes one little-endian element.
    pub(crate) fn decode(self, src: &[u8]) -> u64 {
        match self {
            Self::None => 0,
            Self::U8 => u64::from(src[0]),
            Self::U16 => u64::from(u16::from_le_bytes([src[0], src[1]])),
            Self::U32 => u64::from(u32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        }
    }
}

/// Usage hint passed to the device when creating pool buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferUsage {
    /// Written rarely, drawn many times.
    #[default]
    Static,
    /// Rewritten about once per frame.
    Stream,
}

impl BufferUsage {
    /// Short name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Stream => "stream",
        }
    }
}

/// Scalar type of one attribute component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    /// 32-bit float.
    Float,
    /// Signed byte.
    I8,
    /// Unsigned byte.
    U8,
    /// Signed short.
    I16,
    /// Unsigned short.
    U16,
    /// Signed int.
    I32,
    /// Unsigned int.
    U32,
}

impl ComponentType {
    /// Size of one component in bytes.
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::Float | Self::I32 | Self::U32 => 4,
        }
    }

    /// Short name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::I8 => "byte",
            Self::U8 => "unsigned byte",
            Self::I16 => "short",
            Self::U16 => "unsigned short",
            Self::I32 => "int",
            Self::U32 => "unsigned int",
        }
    }
}

/// One attribute inside a point record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexAttribute {
    /// Byte offset inside the point record.
    pub offset: u32,
    /// Number of components (1 to 4).
    pub components: u8,
    /// Scalar type of each component.
    pub component_type: ComponentType,
    /// Integer components are read as normalized floats when set.
    #[serde(default)]
    pub normalized: bool,
}

impl VertexAttribute {
    /// Float attribute with `components` components at `offset`.
    #[must_use]
    pub const fn float(offset: u32, components: u8) -> Self {
        Self {
            offset,
            components,
            component_type: ComponentType::Float,
            normalized: false,
        }
    }

    /// Size of the attribute in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.components as u32 * self.component_type.size()
    }
}

/// Immutable layout of the points and indices stored in a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferLayout {
    /// Size of one point record in bytes.
    pub stride: u32,
    /// Index width, or [`IndexType::None`] for unindexed geometry.
    #[serde(default)]
    pub index_type: IndexType,
    /// Attributes inside each point record.
    #[serde(default)]
    pub attributes: Vec<VertexAttribute>,
}

impl BufferLayout {
    /// Creates an unindexed layout with no attributes described.
    #[must_use]
    pub const fn new(stride: u32) -> Self {
        Self {
            stride,
            index_type: IndexType::None,
            attributes: Vec::new(),
        }
    }

    /// Sets the index type.
    #[must_use]
    pub fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    /// Appends an attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: VertexAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Stride in bytes as `usize`.
    #[inline]
    #[must_use]
    pub const fn stride_bytes(&self) -> usize {
        self.stride as usize
    }

    /// Index element size in bytes, 0 if unindexed.
    #[inline]
    #[must_use]
    pub const fn index_size(&self) -> usize {
        self.index_type.element_size()
    }

    /// Checks that the layout can back a pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidArgument`] for a zero stride, an attribute with an
    /// invalid component count, or an attribute reaching past the stride.
    pub fn validate(&self) -> PoolResult<()> {
        if self.stride == 0 {
            return Err(PoolError::InvalidArgument("layout stride must be non-zero"));
        }
        for attribute in &self.attributes {
            if !(1..=4).contains(&attribute.components) {
                return Err(PoolError::InvalidArgument(
                    "attribute component count must be 1 to 4",
                ));
            }
            if u64::from(attribute.offset) + u64::from(attribute.size()) > u64::from(self.stride) {
                return Err(PoolError::InvalidArgument(
                    "attribute extends past the layout stride",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_model() -> BufferLayout {
        BufferLayout::new(40)
            .with_index_type(IndexType::U32)
            .with_attribute(VertexAttribute::float(0, 3))
            .with_attribute(VertexAttribute {
                offset: 12,
                components: 3,
                component_type: ComponentType::I8,
                normalized: true,
            })
            .with_attribute(VertexAttribute::float(32, 2))
    }

    #[test]
    fn layouts_compare_by_value() {
        assert_eq!(static_model(), static_model());
        assert_ne!(
            static_model(),
            static_model().with_index_type(IndexType::U16)
        );
    }

    #[test]
    fn validate_rejects_attribute_past_stride() {
        let layout = BufferLayout::new(8).with_attribute(VertexAttribute::float(4, 2));
        assert!(matches!(
            layout.validate(),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(static_model().validate().is_ok());
        assert!(BufferLayout::new(0).validate().is_err());
    }

    #[test]
    fn index_encoding_checks_range() {
        let mut dst = [0u8; 2];
        IndexType::U16.encode(513, &mut dst).unwrap();
        assert_eq!(IndexType::U16.decode(&dst), 513);
        assert_eq!(
            IndexType::U16.encode(70_000, &mut dst),
            Err(PoolError::IndexOutOfRange {
                value: 70_000,
                max: 65_535
            })
        );
    }

    #[test]
    fn layout_parses_from_toml() {
        let layout: BufferLayout = toml::from_str(
            r#"
            stride = 16
            index_type = "u16"

            [[attributes]]
            offset = 0
            components = 3
            component_type = "float"
            "#,
        )
        .unwrap();
        assert_eq!(layout.index_type, IndexType::U16);
        assert_eq!(layout.attributes[0], VertexAttribute::float(0, 3));
    }
}
