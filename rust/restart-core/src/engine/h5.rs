// rust/restart-core/src/engine/h5.rs

//! HDF5 container engine.
//!
//! A container is one HDF5 file and every dataset sits at its root under
//! the dataset's own name. Element types map onto native HDF5 types;
//! opaque elements become fixed-size byte arrays.
//!
//! With the `mpi` feature and a group backed by an MPI communicator, files
//! are opened through the MPI-IO driver on that communicator, so file and
//! dataset creation and closing are collective HDF5 calls. Otherwise only
//! single-rank groups can share a file. Element data always moves with
//! independent HDF5 transfers; a collective transfer is completed with a
//! group barrier, as in the local engine.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use hdf5::types::TypeDescriptor;
use hdf5::{FileBuilder, H5Type};
use ndarray::{ArrayD, ArrayViewD, IxDyn, SliceInfo, SliceInfoElem};
use tracing::{debug, trace};

use super::{ContainerDataset, ContainerFile, FileEngine, Selection, TransferMode};
use crate::config::EngineConfig;
use crate::element::ElementType;
use crate::error::{RestartError, Result};
use crate::group::agree;
use crate::region::Region;
use crate::session::{FileAccess, OpenMode};

/// Calls `$func::<T>($args)` with the native type `T` of an element type.
macro_rules! with_native_type {
    ($element_type:expr, $func:ident($($arg:expr),*)) => {
        match $element_type {
            ElementType::Int(1) => $func::<i8>($($arg),*),
            ElementType::Int(2) => $func::<i16>($($arg),*),
            ElementType::Int(4) => $func::<i32>($($arg),*),
            ElementType::Int(8) => $func::<i64>($($arg),*),
            ElementType::UInt(1) => $func::<u8>($($arg),*),
            ElementType::UInt(2) => $func::<u16>($($arg),*),
            ElementType::UInt(4) => $func::<u32>($($arg),*),
            ElementType::UInt(8) => $func::<u64>($($arg),*),
            ElementType::Float(4) => $func::<f32>($($arg),*),
            ElementType::Float(8) => $func::<f64>($($arg),*),
            ElementType::Opaque(1) => $func::<[u8; 1]>($($arg),*),
            ElementType::Opaque(2) => $func::<[u8; 2]>($($arg),*),
            ElementType::Opaque(4) => $func::<[u8; 4]>($($arg),*),
            ElementType::Opaque(8) => $func::<[u8; 8]>($($arg),*),
            ElementType::Opaque(16) => $func::<[u8; 16]>($($arg),*),
            ElementType::Opaque(32) => $func::<[u8; 32]>($($arg),*),
            other => Err(RestartError::config(format!(
                "element type {other} has no HDF5 counterpart"
            ))),
        }
    };
}

/// Container engine writing HDF5 files.
#[derive(Debug, Clone)]
pub struct Hdf5Engine {
    /// Base path relative container paths are resolved against.
    base_path: PathBuf,
    flush_on_close: bool,
}

impl Hdf5Engine {
    /// Creates a new `Hdf5Engine` from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).map_err(|e| {
                RestartError::resource_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            flush_on_close: config.sync_on_close,
        })
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

/// A file builder for `access`, using MPI-IO when the group has a
/// communicator.
fn file_builder(access: &FileAccess) -> Result<FileBuilder> {
    let mut builder = FileBuilder::new();
    if !attach_communicator(&mut builder, access) && access.size() > 1 {
        return Err(RestartError::config(format!(
            "an HDF5 container shared by {} ranks needs an MPI process group",
            access.size()
        )));
    }
    Ok(builder)
}

#[cfg(feature = "mpi")]
fn attach_communicator(builder: &mut FileBuilder, access: &FileAccess) -> bool {
    use mpi::raw::AsRaw;

    match access.group().communicator() {
        Some(comm) => {
            let comm = comm.as_raw();
            builder.with_fapl(|p| p.mpio(comm, None));
            true
        }
        None => false,
    }
}

#[cfg(not(feature = "mpi"))]
fn attach_communicator(_builder: &mut FileBuilder, _access: &FileAccess) -> bool {
    false
}

fn hdf5_error(path: &Path, context: &str, e: hdf5::Error) -> RestartError {
    RestartError::resource(path, format!("{context}: {e}"))
}

impl FileEngine for Hdf5Engine {
    fn create(&self, path: &Path, access: &FileAccess) -> Result<Box<dyn ContainerFile>> {
        let full_path = self.resolve_path(path);

        let created = file_builder(access).and_then(|builder| {
            builder
                .create(&full_path)
                .map_err(|e| hdf5_error(&full_path, "failed to create HDF5 file", e))
        });
        let file = agree(access.group(), created, |ranks| {
            RestartError::resource(
                &full_path,
                format!("container creation failed on {ranks} rank(s)"),
            )
        })?;

        debug!(path = %full_path.display(), rank = access.rank(), "created HDF5 container");

        Ok(Box::new(Hdf5File {
            file,
            path: full_path,
            access: access.clone(),
            mode: OpenMode::ReadWrite,
            flush_on_close: self.flush_on_close,
            collective: true,
        }))
    }

    fn open(
        &self,
        path: &Path,
        access: &FileAccess,
        mode: OpenMode,
    ) -> Result<Box<dyn ContainerFile>> {
        let full_path = self.resolve_path(path);

        if !full_path.is_file() {
            return Err(RestartError::resource(&full_path, "container not found"));
        }

        let builder = file_builder(access)?;
        let opened = match mode {
            OpenMode::ReadOnly => builder.open(&full_path),
            OpenMode::ReadWrite => builder.open_rw(&full_path),
        };
        let file = opened.map_err(|e| {
            RestartError::format(&full_path, format!("not a readable HDF5 container: {e}"))
        })?;

        debug!(path = %full_path.display(), ?mode, "opened HDF5 container");

        Ok(Box::new(Hdf5File {
            file,
            path: full_path,
            access: access.clone(),
            mode,
            flush_on_close: self.flush_on_close,
            collective: false,
        }))
    }
}

/// An open HDF5 file.
struct Hdf5File {
    file: hdf5::File,
    path: PathBuf,
    access: FileAccess,
    mode: OpenMode,
    flush_on_close: bool,
    /// Created by the whole group, so closing it is collective.
    collective: bool,
}

impl Hdf5File {
    fn check_name(&self, name: &str) -> Result<()> {
        if name.contains('/') || name == "." {
            return Err(RestartError::config(format!(
                "'{name}' cannot name a dataset at the root of an HDF5 file"
            )));
        }
        Ok(())
    }
}

fn create_typed<T: H5Type>(
    file: &hdf5::File,
    name: &str,
    shape: Vec<usize>,
) -> Result<hdf5::Dataset> {
    file.new_dataset::<T>()
        .no_chunk()
        .shape(shape)
        .create(name)
        .map_err(|e| hdf5_error(Path::new(name), "failed to create dataset", e))
}

impl ContainerFile for Hdf5File {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_dataset(
        &mut self,
        name: &str,
        element_type: ElementType,
        shape: &[u64],
    ) -> Result<Box<dyn ContainerDataset>> {
        if self.mode == OpenMode::ReadOnly {
            return Err(RestartError::resource(&self.path, "container is open read-only"));
        }
        self.check_name(name)?;

        let dims = to_dims(shape)?;
        let created = if self.file.link_exists(name) {
            Err(RestartError::resource(
                &self.path,
                format!("dataset '{name}' already exists"),
            ))
        } else {
            with_native_type!(element_type, create_typed(&self.file, name, dims))
        };
        let dataset = agree(self.access.group(), created, |ranks| {
            RestartError::resource(
                &self.path,
                format!("dataset '{name}' could not be created on {ranks} rank(s)"),
            )
        })?;

        trace!(dataset = name, path = %self.path.display(), "created HDF5 dataset");

        Ok(Box::new(Hdf5Dataset {
            dataset,
            name: name.to_string(),
            element_type,
            shape: shape.to_vec(),
            path: self.path.clone(),
            access: self.access.clone(),
            writable: true,
            flush_on_close: self.flush_on_close,
        }))
    }

    fn open_dataset(&mut self, name: &str) -> Result<Box<dyn ContainerDataset>> {
        self.check_name(name)?;
        if !self.file.link_exists(name) {
            return Err(RestartError::resource(
                &self.path,
                format!("no dataset named '{name}'"),
            ));
        }

        let dataset = self
            .file
            .dataset(name)
            .map_err(|e| hdf5_error(&self.path, "failed to open dataset", e))?;

        let descriptor = dataset
            .dtype()
            .and_then(|dtype| dtype.to_descriptor())
            .map_err(|e| hdf5_error(&self.path, "failed to read dataset type", e))?;
        let element_type = element_type_of(&descriptor).ok_or_else(|| {
            RestartError::format(
                &self.path,
                format!("dataset '{name}' has unsupported type {descriptor:?}"),
            )
        })?;
        let shape = dataset.shape().into_iter().map(|d| d as u64).collect();

        Ok(Box::new(Hdf5Dataset {
            dataset,
            name: name.to_string(),
            element_type,
            shape,
            path: self.path.clone(),
            access: self.access.clone(),
            writable: self.mode == OpenMode::ReadWrite,
            flush_on_close: self.flush_on_close,
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let flushed = if self.mode == OpenMode::ReadWrite && self.flush_on_close {
            self.file
                .flush()
                .map_err(|e| hdf5_error(&self.path, "failed to flush container", e))
        } else {
            Ok(())
        };
        let Hdf5File {
            file,
            path,
            access,
            collective,
            ..
        } = *self;
        drop(file);

        if collective {
            agree(access.group(), flushed, |ranks| {
                RestartError::resource(
                    &path,
                    format!("container was not flushed on {ranks} rank(s)"),
                )
            })?;
        } else {
            flushed?;
        }
        trace!(path = %path.display(), "closed HDF5 container");
        Ok(())
    }
}

/// Element type of a stored HDF5 type, if it is one this layer writes.
fn element_type_of(descriptor: &TypeDescriptor) -> Option<ElementType> {
    let element_type = match descriptor {
        TypeDescriptor::Integer(size) => ElementType::Int(*size as u8),
        TypeDescriptor::Unsigned(size) => ElementType::UInt(*size as u8),
        TypeDescriptor::Float(size) => ElementType::Float(*size as u8),
        TypeDescriptor::FixedArray(inner, len)
            if matches!(**inner, TypeDescriptor::Unsigned(hdf5::types::IntSize::U1)) =>
        {
            ElementType::opaque(*len).ok()?
        }
        _ => return None,
    };
    element_type.validate().ok().map(|()| element_type)
}

fn to_dims(extent: &[u64]) -> Result<Vec<usize>> {
    extent
        .iter()
        .map(|&e| {
            usize::try_from(e)
                .map_err(|_| RestartError::config(format!("extent {e} does not fit in memory")))
        })
        .collect()
}

/// The hyperslab of `region` as an HDF5 selection.
fn slice_info(region: &Region) -> Result<SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>> {
    let elems = region
        .offset()
        .iter()
        .zip(region.extent())
        .map(|(&off, &ext)| {
            let start = isize::try_from(off).ok()?;
            let end = isize::try_from(off + ext).ok()?;
            Some(SliceInfoElem::Slice {
                start,
                end: Some(end),
                step: 1,
            })
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RestartError::config("region does not fit in memory"))?;

    SliceInfo::try_from(elems)
        .map_err(|e| RestartError::config(format!("invalid hyperslab: {e}")))
}

fn write_typed<T: H5Type + bytemuck::Pod>(
    dataset: &hdf5::Dataset,
    region: &Region,
    data: &[u8],
) -> Result<()> {
    // Part buffers are usually typed and aligned; copy only when not.
    let values: Cow<'_, [T]> = match bytemuck::try_cast_slice(data) {
        Ok(values) => Cow::Borrowed(values),
        Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(data)),
    };
    let view = ArrayViewD::from_shape(IxDyn(&to_dims(region.extent())?), &*values)
        .map_err(|e| RestartError::config(format!("buffer does not match selection: {e}")))?;

    dataset
        .write_slice(view, slice_info(region)?)
        .map_err(|e| hdf5_error(Path::new(&dataset.name()), "failed to write hyperslab", e))
}

fn read_typed<T: H5Type + bytemuck::Pod>(
    dataset: &hdf5::Dataset,
    region: &Region,
    data: &mut [u8],
) -> Result<()> {
    let values: ArrayD<T> = dataset
        .read_slice(slice_info(region)?)
        .map_err(|e| hdf5_error(Path::new(&dataset.name()), "failed to read hyperslab", e))?;
    let values = values.as_standard_layout();
    let source = values.as_slice().ok_or_else(|| {
        RestartError::format(Path::new(&dataset.name()), "hyperslab is not contiguous")
    })?;

    data.copy_from_slice(bytemuck::cast_slice(source));
    Ok(())
}

/// An open HDF5 dataset.
struct Hdf5Dataset {
    dataset: hdf5::Dataset,
    name: String,
    element_type: ElementType,
    shape: Vec<u64>,
    path: PathBuf,
    access: FileAccess,
    writable: bool,
    flush_on_close: bool,
}

impl Hdf5Dataset {
    /// Checks a selection against the dataspace and the buffer length,
    /// returning the region to transfer, if any.
    fn resolve<'s>(&self, selection: &Selection<'s>, len: usize) -> Result<Option<Cow<'s, Region>>> {
        let region = match *selection {
            Selection::None => None,
            Selection::All => Some(Cow::Owned(Region::whole(&self.shape))),
            Selection::Hyperslab(region) => {
                region.check_within(&self.shape)?;
                Some(Cow::Borrowed(region))
            }
        };

        let expected = selection.num_elements(&self.shape) * self.element_type.size() as u64;
        if len as u64 != expected {
            return Err(RestartError::config(format!(
                "buffer of {len} bytes does not match a selection of {expected} bytes in '{}'",
                self.name
            )));
        }

        Ok(region.filter(|region| !region.is_empty()))
    }

    fn write_local(&mut self, selection: &Selection<'_>, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RestartError::resource(&self.path, "dataset is open read-only"));
        }
        match self.resolve(selection, data.len())? {
            Some(region) => {
                with_native_type!(self.element_type, write_typed(&self.dataset, &region, data))
            }
            None => Ok(()),
        }
    }

    fn read_local(&mut self, selection: &Selection<'_>, data: &mut [u8]) -> Result<()> {
        match self.resolve(selection, data.len())? {
            Some(region) => {
                with_native_type!(self.element_type, read_typed(&self.dataset, &region, data))
            }
            None => Ok(()),
        }
    }
}

impl ContainerDataset for Hdf5Dataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }

    fn write(&mut self, selection: &Selection<'_>, mode: TransferMode, data: &[u8]) -> Result<()> {
        let outcome = self.write_local(selection, data);
        if mode == TransferMode::Collective {
            self.access.group().barrier();
        }
        outcome
    }

    fn read(
        &mut self,
        selection: &Selection<'_>,
        mode: TransferMode,
        data: &mut [u8],
    ) -> Result<()> {
        let outcome = self.read_local(selection, data);
        if mode == TransferMode::Collective {
            self.access.group().barrier();
        }
        outcome
    }

    fn close(self: Box<Self>) -> Result<()> {
        if self.writable && self.flush_on_close {
            self.dataset
                .file()
                .and_then(|file| file.flush())
                .map_err(|e| hdf5_error(&self.path, "failed to flush dataset", e))?;
        }
        trace!(dataset = %self.name, "closed HDF5 dataset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::group::{LocalGroup, SingleProcess};
    use tempfile::TempDir;

    fn create_test_engine(temp_dir: &TempDir) -> Hdf5Engine {
        Hdf5Engine::new(&EngineConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    fn serial() -> FileAccess {
        FileAccess::new(Arc::new(SingleProcess))
    }

    #[test]
    fn test_create_and_reopen_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let values: Vec<i32> = (1..=6).collect();

        let mut file = engine.create(Path::new("ckpt.h5"), &serial()).unwrap();
        let mut dataset = file
            .create_dataset("shared dataset", ElementType::Int(4), &[2, 3])
            .unwrap();
        dataset
            .write(
                &Selection::All,
                TransferMode::Independent,
                bytemuck::cast_slice(&values),
            )
            .unwrap();
        dataset.close().unwrap();
        file.close().unwrap();

        let mut file = engine
            .open(Path::new("ckpt.h5"), &serial(), OpenMode::ReadOnly)
            .unwrap();
        let mut dataset = file.open_dataset("shared dataset").unwrap();
        assert_eq!(dataset.element_type(), ElementType::Int(4));
        assert_eq!(dataset.shape(), &[2, 3]);

        let region = Region::new(vec![0, 1], vec![2, 2]).unwrap();
        let mut out = vec![0i32; 4];
        dataset
            .read(
                &Selection::Hyperslab(&region),
                TransferMode::Independent,
                bytemuck::cast_slice_mut(&mut out),
            )
            .unwrap();
        assert_eq!(out, vec![2, 3, 5, 6]);
    }

    #[test]
    fn test_native_types_are_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let types = [
            ElementType::Int(8),
            ElementType::UInt(2),
            ElementType::Float(4),
            ElementType::Opaque(16),
        ];

        let mut file = engine.create(Path::new("types.h5"), &serial()).unwrap();
        for (i, &element_type) in types.iter().enumerate() {
            file.create_dataset(&format!("d{i}"), element_type, &[4])
                .unwrap()
                .close()
                .unwrap();
        }
        file.close().unwrap();

        let mut file = engine
            .open(Path::new("types.h5"), &serial(), OpenMode::ReadOnly)
            .unwrap();
        for (i, &element_type) in types.iter().enumerate() {
            let dataset = file.open_dataset(&format!("d{i}")).unwrap();
            assert_eq!(dataset.element_type(), element_type);
        }
    }

    #[test]
    fn test_unsupported_opaque_width() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt.h5"), &serial()).unwrap();

        let err = file
            .create_dataset("records", ElementType::Opaque(12), &[4])
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_container_and_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        let err = engine
            .open(Path::new("absent.h5"), &serial(), OpenMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RestartError::Resource { .. }));

        engine.create(Path::new("ckpt.h5"), &serial()).unwrap();
        let mut file = engine
            .open(Path::new("ckpt.h5"), &serial(), OpenMode::ReadOnly)
            .unwrap();
        let err = file.open_dataset("nope").err().unwrap();
        assert!(err.to_string().contains("no dataset named 'nope'"));
    }

    #[test]
    fn test_non_hdf5_file_is_format_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("plain.h5"), b"not hdf5").unwrap();
        let engine = create_test_engine(&temp_dir);

        let err = engine
            .open(Path::new("plain.h5"), &serial(), OpenMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RestartError::Format { .. }));
    }

    #[test]
    fn test_selection_checks() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt.h5"), &serial()).unwrap();
        let mut dataset = file
            .create_dataset("grid", ElementType::Int(4), &[4, 4])
            .unwrap();

        let outside = Region::new(vec![3, 0], vec![2, 4]).unwrap();
        let err = dataset
            .write(&Selection::Hyperslab(&outside), TransferMode::Independent, &[0; 32])
            .unwrap_err();
        assert!(err.is_configuration());

        dataset
            .write(&Selection::None, TransferMode::Independent, &[])
            .unwrap();
    }

    #[test]
    fn test_multi_rank_group_needs_mpi() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        let outcomes = LocalGroup::run(2, |group| {
            let access = FileAccess::new(Arc::new(group));
            engine.create(Path::new("ckpt.h5"), &access).err().map(|e| e.is_configuration())
        });

        assert_eq!(outcomes, vec![Some(true), Some(true)]);
    }
}
