// rust/restart-core/src/element.rs

//! Element type tags for persisted datasets.
//!
//! Every dataset carries an explicit [`ElementType`] alongside its element
//! size, so an engine can map it onto the matching native scalar type of its
//! container format. Opaque byte blobs cover records the layer does not need
//! to interpret.

use serde::{Deserialize, Serialize};

use crate::error::{RestartError, Result};

/// Scalar kind and width of one dataset element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Two's complement signed integer of the given byte width.
    Int(u8),
    /// Unsigned integer of the given byte width.
    UInt(u8),
    /// IEEE 754 floating point number of the given byte width.
    Float(u8),
    /// Fixed-size blob of bytes with no numeric interpretation.
    Opaque(u32),
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match *self {
            Self::Int(w) | Self::UInt(w) | Self::Float(w) => w as usize,
            Self::Opaque(w) => w as usize,
        }
    }

    /// An opaque element of `size` bytes.
    pub fn opaque(size: usize) -> Result<Self> {
        u32::try_from(size)
            .ok()
            .filter(|&s| s > 0)
            .map(Self::Opaque)
            .ok_or_else(|| RestartError::config(format!("invalid opaque element size {size}")))
    }

    /// Checks that the width is one the scalar kind supports.
    pub fn validate(&self) -> Result<()> {
        let valid = match *self {
            Self::Int(w) | Self::UInt(w) => matches!(w, 1 | 2 | 4 | 8),
            Self::Float(w) => matches!(w, 4 | 8),
            Self::Opaque(w) => w > 0,
        };

        if valid {
            Ok(())
        } else {
            Err(RestartError::config(format!(
                "unsupported element type {self}"
            )))
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(w) => write!(f, "i{}", u32::from(*w) * 8),
            Self::UInt(w) => write!(f, "u{}", u32::from(*w) * 8),
            Self::Float(w) => write!(f, "f{}", u32::from(*w) * 8),
            Self::Opaque(w) => write!(f, "opaque[{w}]"),
        }
    }
}

/// Native scalar types that can back a part buffer.
pub trait Element: bytemuck::Pod {
    /// The tag recorded for datasets of this type.
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = $tag;
            }
        )*
    };
}

impl_element! {
    i8 => ElementType::Int(1),
    i16 => ElementType::Int(2),
    i32 => ElementType::Int(4),
    i64 => ElementType::Int(8),
    u8 => ElementType::UInt(1),
    u16 => ElementType::UInt(2),
    u32 => ElementType::UInt(4),
    u64 => ElementType::UInt(8),
    f32 => ElementType::Float(4),
    f64 => ElementType::Float(8),
}
