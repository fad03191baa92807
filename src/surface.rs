//! Plane geometry, supplied by the host.
//!
//! The buffer manager does not know pixel formats. Hosts that want
//! [`BufferManager::plane_info`](crate::manager::BufferManager::plane_info)
//! install a [`PlaneLayout`] that knows their formats' alignment rules.

use crate::error::Result;
use std::fmt;

/// A DRM fourcc pixel format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    /// Build a code from its four characters.
    pub const fn from_bytes(code: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(code))
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_le_bytes() {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Geometry of one plane of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneInfo {
    /// Plane size in bytes.
    pub size: u32,
    /// Row stride in bytes.
    pub pitch: u32,
    /// Byte offset of the plane within its buffer object.
    pub offset: u32,
    /// Which of the surface's buffer objects holds this plane.
    pub bo_index: u32,
}

/// Pure function from surface parameters to plane geometry.
pub trait PlaneLayout: Send + Sync {
    /// Geometry of `plane` for a `width`x`height` surface of `format`.
    fn plane(&self, width: u32, height: u32, format: Fourcc, plane: u32) -> Result<PlaneInfo>;

    /// Formats this layout knows about.
    fn supported_formats(&self) -> Vec<Fourcc>;
}
