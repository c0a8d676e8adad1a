// rust/restart-core/src/dataset/descriptor.rs

//! Dataset descriptors and part registration.

use crate::config::{LayoutConfig, OverlapPolicy};
use crate::element::{Element, ElementType};
use crate::error::{RestartError, Result};
use crate::region::Region;

/// How a logical dataset maps onto the file's dataspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Decomposed across processes; each part occupies its own hyperslab and
    /// every transfer is collective.
    Shard,
    /// Identical on every process; written once by the canonical rank and
    /// read back whole by every rank.
    Global,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shard => f.write_str("shard"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Borrowed memory behind a part.
///
/// Shared buffers can only be written to the file; restoring data requires
/// an exclusive borrow.
#[derive(Debug)]
pub enum PartBuffer<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
}

impl<'a> PartBuffer<'a> {
    pub(crate) fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Shared(buf) => buf,
            Self::Exclusive(buf) => &buf[..],
        }
    }

    /// Mutable view of the buffer, if it was registered exclusively.
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Shared(_) => None,
            Self::Exclusive(buf) => Some(&mut buf[..]),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Exclusive(_))
    }
}

impl<'a> From<&'a [u8]> for PartBuffer<'a> {
    fn from(buf: &'a [u8]) -> Self {
        Self::Shared(buf)
    }
}

impl<'a> From<&'a mut [u8]> for PartBuffer<'a> {
    fn from(buf: &'a mut [u8]) -> Self {
        Self::Exclusive(buf)
    }
}

/// Binding of a process-local buffer to a region of the dataset.
///
/// The part never owns its memory. Its region is copied in at registration.
#[derive(Debug)]
pub struct Part<'a> {
    buffer: PartBuffer<'a>,
    region: Option<Region>,
    // Bytes of `buffer` that take part in a transfer.
    transfer_len: usize,
}

impl<'a> Part<'a> {
    /// File-space region of this part; `None` for a GLOBAL part registered
    /// without one.
    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    /// The bytes moved by a transfer of this part.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer.as_bytes()[..self.transfer_len]
    }

    /// Mutable view of the transferred bytes, if the buffer is exclusive.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        let len = self.transfer_len;
        self.buffer.as_bytes_mut().map(|buf| &mut buf[..len])
    }

    pub fn is_writable(&self) -> bool {
        self.buffer.is_writable()
    }

    /// Region and mutable transfer bytes at once, for reads into the part.
    pub(crate) fn split_mut(&mut self) -> (Option<&Region>, Option<&mut [u8]>) {
        let len = self.transfer_len;
        (
            self.region.as_ref(),
            self.buffer.as_bytes_mut().map(|buf| &mut buf[..len]),
        )
    }
}

/// One named, typed, multi-dimensional dataset and the parts this process
/// contributes to it.
#[derive(Debug)]
pub struct DatasetDescriptor<'a> {
    name: String,
    element_type: ElementType,
    global_shape: Vec<u64>,
    mode: StorageMode,
    overlap: OverlapPolicy,
    parts: Vec<Part<'a>>,
}

impl<'a> DatasetDescriptor<'a> {
    /// Defines a dataset with the default layout limits.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `rank` is zero or does not match
    /// `global_shape`, if any extent is zero, if the element type is
    /// unsupported, or if the name is empty or longer than 512 bytes.
    pub fn define(
        name: &str,
        rank: usize,
        element_type: ElementType,
        global_shape: &[u64],
        mode: StorageMode,
    ) -> Result<Self> {
        Self::define_with_layout(
            name,
            rank,
            element_type,
            global_shape,
            mode,
            &LayoutConfig::default(),
        )
    }

    /// Defines a dataset using explicit layout limits.
    pub fn define_with_layout(
        name: &str,
        rank: usize,
        element_type: ElementType,
        global_shape: &[u64],
        mode: StorageMode,
        layout: &LayoutConfig,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(RestartError::config("dataset name must not be empty"));
        }
        if name.len() > layout.max_name_len {
            return Err(RestartError::config(format!(
                "dataset name is {} bytes, limit is {}",
                name.len(),
                layout.max_name_len
            )));
        }
        if rank == 0 {
            return Err(RestartError::config(format!(
                "dataset '{name}' must have at least one dimension"
            )));
        }
        if global_shape.len() != rank {
            return Err(RestartError::config(format!(
                "dataset '{name}' has rank {rank} but {} extents were given",
                global_shape.len()
            )));
        }
        if let Some(dim) = global_shape.iter().position(|&s| s == 0) {
            return Err(RestartError::config(format!(
                "dataset '{name}' has zero extent in dimension {dim}"
            )));
        }
        element_type.validate()?;

        Ok(Self {
            name: name.to_string(),
            element_type,
            global_shape: global_shape.to_vec(),
            mode,
            overlap: layout.overlap,
            parts: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> usize {
        self.global_shape.len()
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn element_size(&self) -> usize {
        self.element_type.size()
    }

    pub fn global_shape(&self) -> &[u64] {
        &self.global_shape
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap
    }

    pub fn parts(&self) -> &[Part<'a>] {
        &self.parts
    }

    pub(crate) fn parts_mut(&mut self) -> &mut [Part<'a>] {
        &mut self.parts
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Total number of elements in the global dataspace.
    pub fn num_elements(&self) -> u64 {
        self.global_shape.iter().product()
    }

    /// Registers a typed, read-only buffer. Such parts can be written but
    /// not restored.
    pub fn register<T: Element>(
        &mut self,
        data: &'a [T],
        offset: Option<&[u64]>,
        extent: Option<&[u64]>,
    ) -> Result<()> {
        self.check_element::<T>()?;
        self.register_bytes(PartBuffer::Shared(bytemuck::cast_slice(data)), offset, extent)
    }

    /// Registers a typed, mutable buffer usable for both write and read.
    pub fn register_mut<T: Element>(
        &mut self,
        data: &'a mut [T],
        offset: Option<&[u64]>,
        extent: Option<&[u64]>,
    ) -> Result<()> {
        self.check_element::<T>()?;
        self.register_bytes(
            PartBuffer::Exclusive(bytemuck::cast_slice_mut(data)),
            offset,
            extent,
        )
    }

    /// Appends a part binding `buffer` to the region `offset`/`extent`.
    ///
    /// SHARD parts need both vectors, each with one entry per dimension, and
    /// the region must lie inside the global shape. GLOBAL parts may omit
    /// them; the whole dataspace is implied either way, so a GLOBAL region
    /// only has to match the dataset's rank. On error the part list is left
    /// untouched.
    pub fn register_bytes(
        &mut self,
        buffer: PartBuffer<'a>,
        offset: Option<&[u64]>,
        extent: Option<&[u64]>,
    ) -> Result<()> {
        let region = match (offset, extent) {
            (Some(offset), Some(extent)) => {
                let region = Region::new(offset, extent)?;
                match self.mode {
                    StorageMode::Shard => region.check_within(&self.global_shape).map_err(|e| {
                        RestartError::config(format!("invalid region for '{}': {e}", self.name))
                    })?,
                    // GLOBAL transfers always cover the whole dataspace, so
                    // only the rank of the region matters.
                    StorageMode::Global if region.rank() != self.rank() => {
                        return Err(RestartError::config(format!(
                            "region of rank {} for '{}' of rank {}",
                            region.rank(),
                            self.name,
                            self.rank()
                        )));
                    }
                    StorageMode::Global => {}
                }
                Some(region)
            }
            (None, None) if self.mode == StorageMode::Global => None,
            (None, None) => {
                return Err(RestartError::config(format!(
                    "SHARD dataset '{}' requires an offset and an extent per part",
                    self.name
                )));
            }
            _ => {
                return Err(RestartError::config(format!(
                    "part of '{}' has only one of offset and extent",
                    self.name
                )));
            }
        };

        let elements = match (self.mode, &region) {
            (StorageMode::Shard, Some(region)) => region.num_elements(),
            _ => self.num_elements(),
        };
        let required = elements
            .checked_mul(self.element_size() as u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                RestartError::config(format!("part of '{}' is too large to address", self.name))
            })?;
        if buffer.len() < required {
            return Err(RestartError::config(format!(
                "part buffer of '{}' holds {} bytes but its region needs {required}",
                self.name,
                buffer.len()
            )));
        }

        if self.mode == StorageMode::Shard && self.overlap == OverlapPolicy::Reject {
            if let Some(new_region) = &region {
                if let Some(idx) = self
                    .parts
                    .iter()
                    .position(|p| p.region.as_ref().is_some_and(|r| r.overlaps(new_region)))
                {
                    return Err(RestartError::config(format!(
                        "part of '{}' overlaps part {idx}",
                        self.name
                    )));
                }
            }
        }

        self.parts.push(Part {
            buffer,
            region,
            transfer_len: required,
        });

        Ok(())
    }

    fn check_element<T: Element>(&self) -> Result<()> {
        let matches = T::TYPE == self.element_type
            || matches!(self.element_type, ElementType::Opaque(w) if w as usize == std::mem::size_of::<T>());
        if matches {
            Ok(())
        } else {
            Err(RestartError::config(format!(
                "dataset '{}' stores {} but a {} buffer was registered",
                self.name,
                self.element_type,
                T::TYPE
            )))
        }
    }
}
