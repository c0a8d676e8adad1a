// rust/restart-core/src/dataset/mod.rs

//! Dataset descriptors, part registration and block decompositions.
//!
//! A [`DatasetDescriptor`] describes one named array in the checkpoint file:
//! its global shape, element type and [`StorageMode`]. Each process then
//! registers the [`Part`]s it owns, binding a local buffer to a region of
//! the global dataspace.
//!
//! # Example
//!
//! ```
//! use restart_core::dataset::{DatasetDescriptor, StorageMode};
//! use restart_core::ElementType;
//!
//! let row = vec![1i32; 6];
//! let mut grid =
//!     DatasetDescriptor::define("grid", 2, ElementType::Int(4), &[4, 6], StorageMode::Shard)?;
//! grid.register(&row, Some(&[2, 0]), Some(&[1, 6]))?;
//!
//! // Out-of-bounds regions are rejected and leave the descriptor unchanged.
//! assert!(grid.register(&row, Some(&[4, 0]), Some(&[1, 6])).is_err());
//! assert_eq!(grid.num_parts(), 1);
//! # Ok::<(), restart_core::RestartError>(())
//! ```

mod decompose;
mod descriptor;

pub use decompose::BlockDecomposition;
pub use descriptor::{DatasetDescriptor, Part, PartBuffer, StorageMode};
