// rust/restart-core/src/dataset/decompose.rs

//! Regular block decompositions of a global shape.
//!
//! Restarting at a different process count needs a fresh partition of the
//! dataspace before any parts are registered. [`BlockDecomposition`] splits
//! every dimension into an equal number of blocks and hands each rank one
//! block, numbered row-major over the process grid.

use crate::error::{RestartError, Result};
use crate::region::Region;

/// Equal-sized blocks of a global shape laid out on a process grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDecomposition {
    global_shape: Vec<u64>,
    grid: Vec<u64>,
    block: Vec<u64>,
}

impl BlockDecomposition {
    /// Creates a decomposition with `grid[d]` blocks along dimension `d`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the ranks differ, a grid entry is
    /// zero, or a dimension is not divisible by its grid entry.
    pub fn new(global_shape: &[u64], grid: &[u64]) -> Result<Self> {
        if global_shape.is_empty() || global_shape.len() != grid.len() {
            return Err(RestartError::config(format!(
                "process grid of rank {} does not match shape of rank {}",
                grid.len(),
                global_shape.len()
            )));
        }

        let mut block = Vec::with_capacity(grid.len());
        for (dim, (&span, &parts)) in global_shape.iter().zip(grid).enumerate() {
            if parts == 0 || span % parts != 0 || span / parts == 0 {
                return Err(RestartError::config(format!(
                    "dimension {dim} of extent {span} cannot be split into {parts} equal blocks"
                )));
            }
            block.push(span / parts);
        }

        Ok(Self {
            global_shape: global_shape.to_vec(),
            grid: grid.to_vec(),
            block,
        })
    }

    /// Splits every dimension into the same number of blocks, one block per
    /// rank. `ranks` must be a perfect power of the rank of `global_shape`
    /// (a perfect square for 2-D data).
    pub fn uniform(global_shape: &[u64], ranks: usize) -> Result<Self> {
        let ndims = u32::try_from(global_shape.len())
            .map_err(|_| RestartError::config("too many dimensions"))?;
        let per_dim = integer_root(ranks as u64, ndims).ok_or_else(|| {
            RestartError::config(format!(
                "{ranks} ranks do not form a uniform {}-dimensional process grid",
                global_shape.len()
            ))
        })?;

        Self::new(global_shape, &vec![per_dim; global_shape.len()])
    }

    pub fn global_shape(&self) -> &[u64] {
        &self.global_shape
    }

    pub fn grid(&self) -> &[u64] {
        &self.grid
    }

    /// Extent of every block.
    pub fn block_extent(&self) -> &[u64] {
        &self.block
    }

    pub fn num_blocks(&self) -> usize {
        self.grid.iter().product::<u64>() as usize
    }

    /// The block owned by `rank`.
    pub fn block(&self, rank: usize) -> Result<Region> {
        if rank >= self.num_blocks() {
            return Err(RestartError::config(format!(
                "rank {rank} outside a decomposition of {} blocks",
                self.num_blocks()
            )));
        }

        let mut remaining = rank as u64;
        let mut offset = vec![0u64; self.grid.len()];
        for dim in (0..self.grid.len()).rev() {
            offset[dim] = (remaining % self.grid[dim]) * self.block[dim];
            remaining /= self.grid[dim];
        }

        Region::new(offset, self.block.clone())
    }

    /// The block owned by `rank`, cut into slabs of thickness one along the
    /// first dimension. For 2-D data each slab is one row of the block, which
    /// is the only contiguous piece of a row-major buffer per row.
    pub fn rows(&self, rank: usize) -> Result<Vec<Region>> {
        let block = self.block(rank)?;

        let mut extent = block.extent().to_vec();
        let rows = extent[0];
        extent[0] = 1;

        (0..rows)
            .map(|row| {
                let mut offset = block.offset().to_vec();
                offset[0] += row;
                Region::new(offset, extent.clone())
            })
            .collect()
    }
}

/// Exact integer `k`-th root of `n`, if there is one.
fn integer_root(n: u64, k: u32) -> Option<u64> {
    if n == 0 || k == 0 {
        return None;
    }
    if k == 1 {
        return Some(n);
    }

    let guess = (n as f64).powf(1.0 / f64::from(k)).round() as u64;
    (guess.saturating_sub(1)..=guess + 1)
        .find(|candidate| candidate.checked_pow(k) == Some(n))
}
