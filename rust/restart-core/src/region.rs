// rust/restart-core/src/region.rs

//! Rectangular regions (hyperslabs) of a multi-dimensional index space.
//!
//! A [`Region`] pairs an *offset* (first index per dimension) with an
//! *extent* (number of elements per dimension). Both vectors always have the
//! same length, the rank of the owning dataset.
//!
//! Elements are laid out row-major: the last dimension varies fastest, both
//! in the file and in a part's memory buffer. [`Region::contiguous_runs`]
//! walks a region as the minimal sequence of contiguous file runs, which is
//! what an engine needs to move a hyperslab with plain positional I/O.

use crate::error::{RestartError, Result};

/// A rectangular selection: per-dimension offset and extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    offset: Vec<u64>,
    extent: Vec<u64>,
}

/// One contiguous stretch of a region.
///
/// Offsets and length are in elements, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Linear element index of the run's first element in the dataset.
    pub file_offset: u64,
    /// Element index of the run's first element in the region's own buffer.
    pub memory_offset: u64,
    /// Number of elements in the run.
    pub len: u64,
}

impl Region {
    /// Creates a region from an offset and an extent.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the vectors differ in length or are
    /// empty.
    pub fn new(offset: impl Into<Vec<u64>>, extent: impl Into<Vec<u64>>) -> Result<Self> {
        let offset = offset.into();
        let extent = extent.into();

        if offset.len() != extent.len() {
            return Err(RestartError::config(format!(
                "offset has {} dimensions but extent has {}",
                offset.len(),
                extent.len()
            )));
        }
        if offset.is_empty() {
            return Err(RestartError::config(
                "region must have at least one dimension",
            ));
        }

        Ok(Self { offset, extent })
    }

    /// The region covering an entire dataspace of the given shape.
    pub fn whole(shape: &[u64]) -> Self {
        Self {
            offset: vec![0; shape.len()],
            extent: shape.to_vec(),
        }
    }

    pub fn offset(&self) -> &[u64] {
        &self.offset
    }

    pub fn extent(&self) -> &[u64] {
        &self.extent
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.extent.len()
    }

    /// Total number of elements selected.
    pub fn num_elements(&self) -> u64 {
        self.extent.iter().product()
    }

    /// Whether the region selects no elements at all.
    pub fn is_empty(&self) -> bool {
        self.extent.iter().any(|&e| e == 0)
    }

    /// Checks that the region lies inside a dataspace of the given shape.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending dimension.
    pub fn check_within(&self, shape: &[u64]) -> Result<()> {
        if self.rank() != shape.len() {
            return Err(RestartError::config(format!(
                "region has rank {} but the dataspace has rank {}",
                self.rank(),
                shape.len()
            )));
        }

        for (dim, ((&off, &ext), &span)) in self
            .offset
            .iter()
            .zip(&self.extent)
            .zip(shape)
            .enumerate()
        {
            let end = off.checked_add(ext).ok_or_else(|| {
                RestartError::config(format!("region overflows in dimension {dim}"))
            })?;
            if end > span {
                return Err(RestartError::config(format!(
                    "region {off}..{end} exceeds dataspace extent {span} in dimension {dim}"
                )));
            }
        }

        Ok(())
    }

    /// Whether two regions of the same rank share at least one element.
    pub fn overlaps(&self, other: &Region) -> bool {
        if self.rank() != other.rank() || self.is_empty() || other.is_empty() {
            return false;
        }

        self.offset
            .iter()
            .zip(&self.extent)
            .zip(other.offset.iter().zip(&other.extent))
            .all(|((&a_off, &a_ext), (&b_off, &b_ext))| {
                a_off < b_off + b_ext && b_off < a_off + a_ext
            })
    }

    /// Iterates the region as contiguous runs within a row-major dataspace.
    ///
    /// The region must already satisfy [`Region::check_within`] for `shape`.
    /// Trailing dimensions the region covers completely are folded into a
    /// single run, so a block of whole rows is one run.
    pub fn contiguous_runs<'a>(&'a self, shape: &'a [u64]) -> ContiguousRuns<'a> {
        ContiguousRuns::new(self, shape)
    }
}

/// Iterator returned by [`Region::contiguous_runs`].
#[derive(Debug)]
pub struct ContiguousRuns<'a> {
    region: &'a Region,
    strides: Vec<u64>,
    // Dimensions before `split` are walked by the odometer; `split` and
    // everything after it is folded into each run.
    split: usize,
    run_len: u64,
    cursor: Vec<u64>,
    memory_offset: u64,
    done: bool,
}

impl<'a> ContiguousRuns<'a> {
    fn new(region: &'a Region, shape: &'a [u64]) -> Self {
        let rank = region.rank();

        let mut strides = vec![1u64; rank];
        for dim in (0..rank.saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * shape[dim + 1];
        }

        let extent = region.extent();
        let mut split = rank - 1;
        let mut run_len = extent[split];
        while split > 0 && extent[split] == shape[split] {
            split -= 1;
            run_len *= extent[split];
        }

        Self {
            region,
            strides,
            split,
            run_len,
            cursor: vec![0; split],
            memory_offset: 0,
            done: region.is_empty(),
        }
    }

    fn advance(&mut self) {
        let extent = self.region.extent();
        let mut dim = self.split;
        loop {
            if dim == 0 {
                self.done = true;
                return;
            }
            dim -= 1;
            self.cursor[dim] += 1;
            if self.cursor[dim] < extent[dim] {
                return;
            }
            self.cursor[dim] = 0;
        }
    }
}

impl Iterator for ContiguousRuns<'_> {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        if self.done {
            return None;
        }

        let offset = self.region.offset();
        let file_offset = offset
            .iter()
            .enumerate()
            .map(|(dim, &off)| {
                let coord = if dim < self.split {
                    off + self.cursor[dim]
                } else {
                    off
                };
                coord * self.strides[dim]
            })
            .sum();

        let run = Run {
            file_offset,
            memory_offset: self.memory_offset,
            len: self.run_len,
        };

        self.memory_offset += self.run_len;
        self.advance();

        Some(run)
    }
}
