// rust/restart-core/src/lib.rs

//! Restart Core - Collective Checkpoint/Restart Library
//!
//! This crate persists and restores arrays that are distributed over a group
//! of cooperating processes. Each process describes the fragments it owns as
//! parts of a named dataset; the I/O layer stitches them into one dataset in
//! a shared container file, and restores them later, possibly at a
//! different process count.

pub mod config;
pub mod error;
pub mod region;

// Re-export commonly used types for convenience
pub use config::{EngineBackend, OverlapPolicy, RestartConfig};
pub use error::{RestartError, Result};
pub use region::Region;

pub mod element;
pub use element::{Element, ElementType};

pub mod dataset;
pub use dataset::{BlockDecomposition, DatasetDescriptor, Part, StorageMode};

pub mod group;
#[cfg(feature = "mpi")]
pub use group::MpiGroup;
pub use group::{LocalGroup, ProcessGroup, SingleProcess};

pub mod engine;
#[cfg(feature = "hdf5")]
pub use engine::Hdf5Engine;
pub use engine::{FileEngine, LocalEngine};

pub mod session;
pub use session::{FileAccess, FileSession, OpenMode};

pub mod io;
pub use io::{DatasetShape, RestartIo};
