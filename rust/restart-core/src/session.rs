// rust/restart-core/src/session.rs

//! File sessions: the lifetime of one open container and its datasets.
//!
//! A [`FileSession`] owns the container handle and the access configuration
//! (process group, canonical rank) it was opened with. Datasets opened
//! through it come back as [`DatasetHandle`]s. Both release their engine
//! handle when closed or dropped, so every exit path releases the dataset
//! before the container as long as handles are declared after the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::config::GroupConfig;
use crate::element::ElementType;
use crate::engine::{ContainerDataset, ContainerFile, FileEngine, Selection, TransferMode};
use crate::error::{RestartError, Result};
use crate::group::{ProcessGroup, CANONICAL_RANK};

/// Access mode for an existing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// The process group a container is accessed by, and which of its ranks
/// writes GLOBAL-mode data.
#[derive(Clone)]
pub struct FileAccess {
    group: Arc<dyn ProcessGroup>,
    canonical_rank: usize,
}

impl FileAccess {
    /// Access by `group` with rank 0 as the canonical rank.
    pub fn new(group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            group,
            canonical_rank: CANONICAL_RANK,
        }
    }

    /// Access by `group` with an explicit canonical rank.
    ///
    /// # Errors
    ///
    /// Returns a group synchronization error if `canonical_rank` is not a
    /// rank of `group`.
    pub fn with_canonical_rank(group: Arc<dyn ProcessGroup>, canonical_rank: usize) -> Result<Self> {
        if canonical_rank >= group.size() {
            return Err(RestartError::group_sync(format!(
                "canonical rank {canonical_rank} is outside a group of {} ranks",
                group.size()
            )));
        }
        Ok(Self {
            group,
            canonical_rank,
        })
    }

    pub fn from_config(group: Arc<dyn ProcessGroup>, config: &GroupConfig) -> Result<Self> {
        Self::with_canonical_rank(group, config.canonical_rank)
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn canonical_rank(&self) -> usize {
        self.canonical_rank
    }

    /// Whether the calling rank is the canonical rank.
    pub fn is_canonical(&self) -> bool {
        self.group.rank() == self.canonical_rank
    }
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccess")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("canonical_rank", &self.canonical_rank)
            .finish()
    }
}

/// An open container.
pub struct FileSession {
    path: PathBuf,
    access: FileAccess,
    file: Option<Box<dyn ContainerFile>>,
}

impl FileSession {
    /// Creates (truncating) a container. Collective.
    pub fn create(engine: &dyn FileEngine, path: &Path, access: FileAccess) -> Result<Self> {
        let file = engine.create(path, &access)?;
        Ok(Self {
            path: path.to_path_buf(),
            access,
            file: Some(file),
        })
    }

    /// Opens an existing container.
    pub fn open(
        engine: &dyn FileEngine,
        path: &Path,
        access: FileAccess,
        mode: OpenMode,
    ) -> Result<Self> {
        let file = engine.open(path, &access, mode)?;
        Ok(Self {
            path: path.to_path_buf(),
            access,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> &FileAccess {
        &self.access
    }

    fn file(&mut self) -> Result<&mut Box<dyn ContainerFile>> {
        self.file
            .as_mut()
            .ok_or_else(|| RestartError::resource(&self.path, "container is already closed"))
    }

    /// Creates a dataset in the container. Collective.
    pub fn create_dataset(
        &mut self,
        name: &str,
        element_type: ElementType,
        shape: &[u64],
    ) -> Result<DatasetHandle> {
        let dataset = self.file()?.create_dataset(name, element_type, shape)?;
        Ok(DatasetHandle::new(dataset))
    }

    pub fn open_dataset(&mut self, name: &str) -> Result<DatasetHandle> {
        let dataset = self.file()?.open_dataset(name)?;
        Ok(DatasetHandle::new(dataset))
    }

    /// Closes the container, reporting any error the engine raises.
    pub fn close(mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!(path = %self.path.display(), error = %e, "failed to close container");
            }
        }
    }
}

/// An open dataset.
pub struct DatasetHandle {
    name: String,
    dataset: Option<Box<dyn ContainerDataset>>,
}

impl DatasetHandle {
    fn new(dataset: Box<dyn ContainerDataset>) -> Self {
        Self {
            name: dataset.name().to_string(),
            dataset: Some(dataset),
        }
    }

    fn dataset(&self) -> Result<&dyn ContainerDataset> {
        self.dataset.as_deref().ok_or_else(|| self.closed())
    }

    fn dataset_mut(&mut self) -> Result<&mut Box<dyn ContainerDataset>> {
        match self.dataset.as_mut() {
            Some(dataset) => Ok(dataset),
            None => Err(RestartError::resource(
                self.name.as_str(),
                "dataset is already closed",
            )),
        }
    }

    fn closed(&self) -> RestartError {
        RestartError::resource(self.name.as_str(), "dataset is already closed")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> Result<ElementType> {
        Ok(self.dataset()?.element_type())
    }

    /// Global shape as recorded in the container.
    pub fn shape(&self) -> Result<Vec<u64>> {
        Ok(self.dataset()?.shape().to_vec())
    }

    pub fn write(&mut self, selection: &Selection<'_>, mode: TransferMode, data: &[u8]) -> Result<()> {
        self.dataset_mut()?.write(selection, mode, data)
    }

    pub fn read(
        &mut self,
        selection: &Selection<'_>,
        mode: TransferMode,
        data: &mut [u8],
    ) -> Result<()> {
        self.dataset_mut()?.read(selection, mode, data)
    }

    pub fn close(mut self) -> Result<()> {
        match self.dataset.take() {
            Some(dataset) => dataset.close(),
            None => Ok(()),
        }
    }
}

impl Drop for DatasetHandle {
    fn drop(&mut self) {
        if let Some(dataset) = self.dataset.take() {
            if let Err(e) = dataset.close() {
                warn!(dataset = %self.name, error = %e, "failed to close dataset");
            }
        }
    }
}
