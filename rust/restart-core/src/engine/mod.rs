// rust/restart-core/src/engine/mod.rs

//! Container-file engine abstraction.
//!
//! The I/O layer never touches files directly. It drives an engine through
//! three traits, mirroring the usual hierarchical-container model:
//!
//! - [`FileEngine`] creates or opens a container at a path.
//! - [`ContainerFile`] creates or opens named datasets inside a container.
//! - [`ContainerDataset`] moves hyperslabs between memory and one dataset.
//!
//! Transfers take a [`Selection`] of the file dataspace and a
//! [`TransferMode`]. A collective transfer must be issued by every rank of
//! the group the container was opened with, the same number of times and in
//! the same order; a rank with nothing to move passes [`Selection::None`].
//! Memory buffers are always dense and row-major with exactly as many
//! elements as the selection.
//!
//! Two implementations ship with the crate:
//!
//! - [`LocalEngine`]: a directory per container and a file per dataset.
//!   Works for any process group, including threads of one process.
//! - `Hdf5Engine` (feature `hdf5`): one HDF5 file per container, opened
//!   through MPI-IO when the group is an MPI communicator.

mod format;
#[cfg(feature = "hdf5")]
mod h5;
mod local;

use std::path::Path;
use std::sync::Arc;

pub use format::DatasetHeader;
#[cfg(feature = "hdf5")]
pub use h5::Hdf5Engine;
pub use local::LocalEngine;

use crate::config::{EngineBackend, EngineConfig};
use crate::element::ElementType;
use crate::error::Result;
use crate::region::Region;
use crate::session::{FileAccess, OpenMode};

/// Builds the engine selected by `config.backend`.
///
/// # Errors
///
/// Returns a configuration error if the backend was not compiled in, and
/// whatever the engine's constructor returns otherwise.
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn FileEngine>> {
    match config.backend {
        EngineBackend::Local => Ok(Arc::new(LocalEngine::new(config)?)),
        #[cfg(feature = "hdf5")]
        EngineBackend::Hdf5 => Ok(Arc::new(Hdf5Engine::new(config)?)),
        #[cfg(not(feature = "hdf5"))]
        EngineBackend::Hdf5 => Err(crate::error::RestartError::config(
            "the HDF5 engine needs the `hdf5` feature",
        )),
    }
}

/// The part of a dataset's file dataspace a transfer touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    /// No elements. Used by ranks that have run out of parts but must still
    /// take part in a collective transfer.
    None,
    /// The whole dataspace.
    All,
    /// A rectangular hyperslab.
    Hyperslab(&'a Region),
}

impl Selection<'_> {
    /// Number of elements selected in a dataspace of the given shape.
    pub fn num_elements(&self, shape: &[u64]) -> u64 {
        match self {
            Selection::None => 0,
            Selection::All => shape.iter().product(),
            Selection::Hyperslab(region) => region.num_elements(),
        }
    }
}

/// Whether a transfer is coordinated across the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Every rank participates; the call returns once the group has
    /// completed it.
    Collective,
    /// Only the calling rank participates.
    Independent,
}

/// Creates and opens containers.
///
/// # Object Safety
///
/// This trait is object-safe and can be used with `Arc<dyn FileEngine>`.
pub trait FileEngine: Send + Sync {
    /// Creates a container at `path`, truncating any existing one.
    ///
    /// Collective over `access.group()`.
    ///
    /// # Errors
    ///
    /// Returns a resource error if the container cannot be created on any
    /// rank.
    fn create(&self, path: &Path, access: &FileAccess) -> Result<Box<dyn ContainerFile>>;

    /// Opens an existing container.
    ///
    /// # Errors
    ///
    /// Returns a resource error if the container does not exist, or a
    /// format error if it is not a container this engine understands.
    fn open(&self, path: &Path, access: &FileAccess, mode: OpenMode)
        -> Result<Box<dyn ContainerFile>>;
}

/// An open container.
pub trait ContainerFile {
    /// Path the container was created or opened at.
    fn path(&self) -> &Path;

    /// Creates a dataset of the given element type and shape.
    ///
    /// Collective: every rank must create the same datasets in the same
    /// order with identical arguments.
    fn create_dataset(
        &mut self,
        name: &str,
        element_type: ElementType,
        shape: &[u64],
    ) -> Result<Box<dyn ContainerDataset>>;

    /// Opens an existing dataset by name.
    fn open_dataset(&mut self, name: &str) -> Result<Box<dyn ContainerDataset>>;

    /// Releases the container. Datasets opened from it must be closed first.
    ///
    /// Collective for containers returned by [`FileEngine::create`]: it
    /// returns on any rank only once every rank has closed, with the same
    /// outcome everywhere.
    fn close(self: Box<Self>) -> Result<()>;
}

/// An open dataset inside a container.
pub trait ContainerDataset {
    fn name(&self) -> &str;

    fn element_type(&self) -> ElementType;

    /// Global shape as recorded in the container.
    fn shape(&self) -> &[u64];

    /// Writes `data` to the selected elements.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the selection lies outside the
    /// dataspace or `data` has the wrong length, and a resource error if the
    /// underlying write fails. A collective call completes its
    /// synchronization even when it fails locally.
    fn write(&mut self, selection: &Selection<'_>, mode: TransferMode, data: &[u8]) -> Result<()>;

    /// Reads the selected elements into `data`.
    fn read(
        &mut self,
        selection: &Selection<'_>,
        mode: TransferMode,
        data: &mut [u8],
    ) -> Result<()>;

    /// Releases the dataset, flushing written data if configured to.
    fn close(self: Box<Self>) -> Result<()>;
}
