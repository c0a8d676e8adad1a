// rust/restart-core/src/engine/local.rs

//! Local filesystem container engine.
//!
//! A container is a directory holding a marker file and one file per
//! dataset. Dataset files carry a checksummed [`DatasetHeader`] followed by
//! the element data at a fixed size, so ranks address their hyperslabs with
//! plain positional I/O on their own file handles.
//!
//! Metadata changes (creating the container, creating a dataset) are done
//! by the canonical rank alone and published to the group with an agreement
//! round. Element transfers are done by every rank in parallel; a collective
//! transfer ends with a barrier so no rank returns before the group is done.
//! Closing a container that was created collectively is collective too: it
//! returns on every rank only once the canonical rank has synced the
//! container and every dataset handle has been closed.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, trace};
use twox_hash::XxHash64;

use super::format::DatasetHeader;
use super::{ContainerDataset, ContainerFile, FileEngine, Selection, TransferMode};
use crate::config::EngineConfig;
use crate::element::ElementType;
use crate::error::{RestartError, Result};
use crate::group::agree;
use crate::region::Region;
use crate::session::{FileAccess, OpenMode};

/// Name of the file that marks a directory as a container.
const MARKER_FILE: &str = ".restart-container";

/// Contents of the marker file.
const MARKER: &[u8] = b"RSTC 1\n";

const DATASET_EXTENSION: &str = "dset";

// Encoded names longer than this are shortened and suffixed with a hash.
const MAX_ENCODED_NAME: usize = 160;

/// Engine options shared by every handle an engine hands out.
#[derive(Debug, Clone, Copy)]
struct LocalOptions {
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
    sync_on_close: bool,
}

/// Container engine backed by the local filesystem.
///
/// Suitable for threads of one process and for MPI ranks on a shared POSIX
/// filesystem.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    /// Base path relative container paths are resolved against.
    base_path: PathBuf,
    options: LocalOptions,
}

impl LocalEngine {
    /// Creates a new `LocalEngine` from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                RestartError::resource_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            options: LocalOptions {
                buffer_size: config.buffer_size,
                use_mmap: config.use_mmap,
                mmap_threshold: config.mmap_threshold,
                sync_on_close: config.sync_on_close,
            },
        })
    }

    /// Resolves a path relative to the base path.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

impl FileEngine for LocalEngine {
    fn create(&self, path: &Path, access: &FileAccess) -> Result<Box<dyn ContainerFile>> {
        let full_path = self.resolve_path(path);

        let local = if access.is_canonical() {
            init_container(&full_path)
        } else {
            Ok(())
        };
        agree(access.group(), local, |_| {
            RestartError::resource(&full_path, "container creation failed on the canonical rank")
        })?;

        debug!(path = %full_path.display(), rank = access.rank(), "created container");

        Ok(Box::new(LocalFile {
            path: full_path,
            access: access.clone(),
            mode: OpenMode::ReadWrite,
            options: self.options,
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

        if !full_path.is_dir() {
            return Err(RestartError::resource(&full_path, "container not found"));
        }

        let marker_path = full_path.join(MARKER_FILE);
        let marker = match fs::read(&marker_path) {
            Ok(marker) => marker,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RestartError::format(&full_path, "not a restart container"));
            }
            Err(e) => {
                return Err(RestartError::resource_with_source(
                    &marker_path,
                    "failed to read container marker",
                    e,
                ));
            }
        };
        if marker != MARKER {
            return Err(RestartError::format(
                &full_path,
                "unrecognized container marker",
            ));
        }

        debug!(path = %full_path.display(), ?mode, "opened container");

        Ok(Box::new(LocalFile {
            path: full_path,
            access: access.clone(),
            mode,
            options: self.options,
            collective: false,
        }))
    }
}

/// Replaces whatever is at `path` with an empty container.
fn init_container(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).map_err(|e| {
            RestartError::resource_with_source(path, "failed to remove existing container", e)
        })?;
    } else if path.exists() {
        fs::remove_file(path).map_err(|e| {
            RestartError::resource_with_source(path, "failed to remove existing file", e)
        })?;
    }

    fs::create_dir_all(path)
        .map_err(|e| RestartError::resource_with_source(path, "failed to create container", e))?;

    let marker_path = path.join(MARKER_FILE);
    fs::write(&marker_path, MARKER).map_err(|e| {
        RestartError::resource_with_source(&marker_path, "failed to write container marker", e)
    })
}

/// File name for a dataset. Bytes outside `[A-Za-z0-9_-]` are
/// percent-encoded; over-long names keep a prefix plus a hash of the
/// full name.
fn dataset_file_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }

    if encoded.len() > MAX_ENCODED_NAME {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(name.as_bytes());
        // Encoding is ASCII, so any byte index is a char boundary.
        encoded.truncate(MAX_ENCODED_NAME - 17);
        encoded.push_str(&format!("~{:016x}", hasher.finish()));
    }

    format!("{encoded}.{DATASET_EXTENSION}")
}

/// Flushes the directory entries of a container to disk.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| RestartError::resource_with_source(path, "failed to sync container", e))
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// An open local container.
struct LocalFile {
    path: PathBuf,
    access: FileAccess,
    mode: OpenMode,
    options: LocalOptions,
    /// Created by the whole group, so closing it is collective.
    collective: bool,
}

impl LocalFile {
    fn dataset_path(&self, name: &str) -> PathBuf {
        self.path.join(dataset_file_name(name))
    }

    /// Writes the header of a new dataset and sizes the file for its data.
    fn write_dataset_file(&self, path: &Path, header: &DatasetHeader) -> Result<()> {
        let prefix = header.encode()?;
        let data_len = header.data_len()?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                let message = if e.kind() == ErrorKind::AlreadyExists {
                    format!("dataset '{}' already exists", header.name)
                } else {
                    "failed to create dataset file".to_string()
                };
                RestartError::resource_with_source(path, message, e)
            })?;

        let mut writer = BufWriter::with_capacity(self.options.buffer_size, file);
        writer
            .write_all(&prefix)
            .and_then(|_| writer.flush())
            .map_err(|e| RestartError::resource_with_source(path, "failed to write dataset header", e))?;

        writer
            .get_ref()
            .set_len(prefix.len() as u64 + data_len)
            .map_err(|e| RestartError::resource_with_source(path, "failed to size dataset file", e))
    }
}

impl ContainerFile for LocalFile {
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

        let dataset_path = self.dataset_path(name);
        let header = DatasetHeader::new(name, element_type, shape);

        let local = if self.access.is_canonical() {
            self.write_dataset_file(&dataset_path, &header)
        } else {
            Ok(())
        };
        agree(self.access.group(), local, |_| {
            RestartError::resource(&dataset_path, "dataset creation failed on the canonical rank")
        })?;

        trace!(dataset = name, path = %dataset_path.display(), "created dataset");

        let dataset = LocalDataset::open(
            dataset_path,
            name,
            self.access.clone(),
            OpenMode::ReadWrite,
            self.options,
        )?;
        Ok(Box::new(dataset))
    }

    fn open_dataset(&mut self, name: &str) -> Result<Box<dyn ContainerDataset>> {
        let dataset = LocalDataset::open(
            self.dataset_path(name),
            name,
            self.access.clone(),
            self.mode,
            self.options,
        )?;
        Ok(Box::new(dataset))
    }

    fn close(self: Box<Self>) -> Result<()> {
        if self.collective {
            let local = if self.access.is_canonical() && self.options.sync_on_close {
                sync_dir(&self.path)
            } else {
                Ok(())
            };
            agree(self.access.group(), local, |_| {
                RestartError::resource(
                    &self.path,
                    "container could not be synced on the canonical rank",
                )
            })?;
        }
        trace!(path = %self.path.display(), "closed container");
        Ok(())
    }
}

/// An open dataset file.
struct LocalDataset {
    path: PathBuf,
    header: DatasetHeader,
    /// Byte offset of the first element.
    data_offset: u64,
    file: File,
    writable: bool,
    access: FileAccess,
    options: LocalOptions,
    /// Created on the first read of a large dataset.
    mmap: Option<Mmap>,
    dirty: bool,
}

impl LocalDataset {
    fn open(
        path: PathBuf,
        name: &str,
        access: FileAccess,
        mode: OpenMode,
        options: LocalOptions,
    ) -> Result<Self> {
        let writable = mode == OpenMode::ReadWrite;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| {
                let message = if e.kind() == ErrorKind::NotFound {
                    format!("no dataset named '{name}'")
                } else {
                    "failed to open dataset file".to_string()
                };
                RestartError::resource_with_source(&path, message, e)
            })?;

        let (header, data_offset) = {
            let mut reader = BufReader::with_capacity(options.buffer_size, &file);
            DatasetHeader::decode(&mut reader, &path)?
        };

        if header.name != name {
            return Err(RestartError::format(
                &path,
                format!("file holds dataset '{}', expected '{name}'", header.name),
            ));
        }
        header.element_type.validate()?;

        let file_len = file
            .metadata()
            .map_err(|e| RestartError::resource_with_source(&path, "failed to read file metadata", e))?
            .len();
        let expected_len = data_offset + header.data_len()?;
        if file_len < expected_len {
            return Err(RestartError::format(
                &path,
                format!("dataset file is truncated: {file_len} bytes, expected {expected_len}"),
            ));
        }

        Ok(Self {
            path,
            header,
            data_offset,
            file,
            writable,
            access,
            options,
            mmap: None,
            dirty: false,
        })
    }

    /// Checks a selection against the dataspace and the buffer length,
    /// returning the region to transfer, if any.
    fn resolve<'s>(&self, selection: &Selection<'s>, len: usize) -> Result<Option<Cow<'s, Region>>> {
        let region = match *selection {
            Selection::None => None,
            Selection::All => Some(Cow::Owned(Region::whole(&self.header.shape))),
            Selection::Hyperslab(region) => {
                region.check_within(&self.header.shape)?;
                Some(Cow::Borrowed(region))
            }
        };

        let expected = selection.num_elements(&self.header.shape)
            * self.header.element_type.size() as u64;
        if len as u64 != expected {
            return Err(RestartError::config(format!(
                "buffer of {len} bytes does not match a selection of {expected} bytes in '{}'",
                self.header.name
            )));
        }

        Ok(region)
    }

    fn write_local(&mut self, selection: &Selection<'_>, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RestartError::resource(&self.path, "dataset is open read-only"));
        }
        let Some(region) = self.resolve(selection, data.len())? else {
            return Ok(());
        };

        let element_size = self.header.element_type.size() as u64;
        for run in region.contiguous_runs(&self.header.shape) {
            let start = (run.memory_offset * element_size) as usize;
            let end = start + (run.len * element_size) as usize;
            let position = self.data_offset + run.file_offset * element_size;

            self.file
                .seek(SeekFrom::Start(position))
                .and_then(|_| self.file.write_all(&data[start..end]))
                .map_err(|e| {
                    RestartError::resource_with_source(
                        &self.path,
                        format!("failed to write {} bytes at offset {position}", end - start),
                        e,
                    )
                })?;
        }

        self.dirty = true;
        Ok(())
    }

    fn read_local(&mut self, selection: &Selection<'_>, data: &mut [u8]) -> Result<()> {
        let Some(region) = self.resolve(selection, data.len())? else {
            return Ok(());
        };

        let file_len = self.data_offset + self.header.data_len()?;
        if self.mmap.is_none() && self.options.use_mmap && file_len >= self.options.mmap_threshold {
            // SAFETY: the mapping lives no longer than this handle and the
            // file's length is fixed at creation. Concurrent writers only
            // touch element data, which a reader treats as plain bytes.
            let mmap = unsafe { Mmap::map(&self.file) }.map_err(|e| {
                RestartError::resource_with_source(&self.path, "failed to memory-map dataset", e)
            })?;
            self.mmap = Some(mmap);
        }

        let element_size = self.header.element_type.size() as u64;
        for run in region.contiguous_runs(&self.header.shape) {
            let start = (run.memory_offset * element_size) as usize;
            let end = start + (run.len * element_size) as usize;
            let position = self.data_offset + run.file_offset * element_size;

            match &self.mmap {
                Some(mmap) => {
                    let from = position as usize;
                    let source = mmap.get(from..from + (end - start)).ok_or_else(|| {
                        RestartError::format(
                            &self.path,
                            format!("read at offset {position} runs past the end of the file"),
                        )
                    })?;
                    data[start..end].copy_from_slice(source);
                }
                None => {
                    self.file
                        .seek(SeekFrom::Start(position))
                        .and_then(|_| self.file.read_exact(&mut data[start..end]))
                        .map_err(|e| {
                            RestartError::resource_with_source(
                                &self.path,
                                format!("failed to read {} bytes at offset {position}", end - start),
                                e,
                            )
                        })?;
                }
            }
        }

        Ok(())
    }
}

impl ContainerDataset for LocalDataset {
    fn name(&self) -> &str {
        &self.header.name
    }

    fn element_type(&self) -> ElementType {
        self.header.element_type
    }

    fn shape(&self) -> &[u64] {
        &self.header.shape
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
        if self.dirty && self.options.sync_on_close {
            self.file.sync_all().map_err(|e| {
                RestartError::resource_with_source(&self.path, "failed to sync dataset to disk", e)
            })?;
        }
        trace!(dataset = %self.header.name, "closed dataset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::group::{LocalGroup, ProcessGroup, SingleProcess};
    use tempfile::TempDir;

    fn create_test_engine(temp_dir: &TempDir) -> LocalEngine {
        let config = EngineConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            mmap_threshold: 1024, // Low threshold for testing
            ..Default::default()
        };
        LocalEngine::new(&config).unwrap()
    }

    fn serial() -> FileAccess {
        FileAccess::new(Arc::new(SingleProcess))
    }

    fn bytes(values: &[i32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("nested").join("base");

        let config = EngineConfig {
            base_path: base.clone(),
            ..Default::default()
        };
        LocalEngine::new(&config).unwrap();

        assert!(base.is_dir());
    }

    #[test]
    fn test_dataset_file_name() {
        assert_eq!(dataset_file_name("grid"), "grid.dset");
        assert_eq!(dataset_file_name("shared dataset"), "shared%20dataset.dset");
        assert_eq!(dataset_file_name("a/b.c"), "a%2Fb%2Ec.dset");

        let long = "x".repeat(512);
        let encoded = dataset_file_name(&long);
        assert!(encoded.len() <= MAX_ENCODED_NAME + 1 + DATASET_EXTENSION.len());
        assert_ne!(encoded, dataset_file_name(&"x".repeat(511)));
    }

    #[test]
    fn test_create_and_reopen_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let access = serial();

        let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
        let mut dataset = file
            .create_dataset("grid", ElementType::Int(4), &[2, 3])
            .unwrap();
        dataset
            .write(&Selection::All, TransferMode::Independent, &bytes(&[1, 2, 3, 4, 5, 6]))
            .unwrap();
        dataset.close().unwrap();
        file.close().unwrap();

        let mut file = engine
            .open(Path::new("ckpt"), &access, OpenMode::ReadOnly)
            .unwrap();
        let mut dataset = file.open_dataset("grid").unwrap();
        assert_eq!(dataset.name(), "grid");
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
    fn test_create_truncates_existing_container() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let access = serial();

        let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
        file.create_dataset("old", ElementType::Float(8), &[4])
            .unwrap()
            .close()
            .unwrap();
        file.close().unwrap();

        let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
        assert!(file.open_dataset("old").is_err());
        // Same name can be created again after truncation.
        file.create_dataset("old", ElementType::Float(8), &[4]).unwrap();
    }

    #[test]
    fn test_duplicate_dataset_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt"), &serial()).unwrap();

        file.create_dataset("grid", ElementType::Int(4), &[2]).unwrap();
        let err = file
            .create_dataset("grid", ElementType::Int(4), &[2])
            .err()
            .unwrap();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_open_missing_container() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        let err = engine
            .open(Path::new("absent"), &serial(), OpenMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RestartError::Resource { .. }));
    }

    #[test]
    fn test_open_plain_directory_is_format_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("plain")).unwrap();
        let engine = create_test_engine(&temp_dir);

        let err = engine
            .open(Path::new("plain"), &serial(), OpenMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RestartError::Format { .. }));
    }

    #[test]
    fn test_open_missing_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        engine.create(Path::new("ckpt"), &serial()).unwrap();

        let mut file = engine
            .open(Path::new("ckpt"), &serial(), OpenMode::ReadOnly)
            .unwrap();
        let err = file.open_dataset("nope").err().unwrap();
        assert!(err.to_string().contains("no dataset named 'nope'"));
    }

    #[test]
    fn test_truncated_dataset_file() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt"), &serial()).unwrap();
        file.create_dataset("grid", ElementType::Int(4), &[64])
            .unwrap()
            .close()
            .unwrap();

        let path = temp_dir.path().join("ckpt").join("grid.dset");
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 4)
            .unwrap();

        let err = file.open_dataset("grid").err().unwrap();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt"), &serial()).unwrap();
        file.create_dataset("grid", ElementType::Int(4), &[2]).unwrap();
        file.close().unwrap();

        let mut file = engine
            .open(Path::new("ckpt"), &serial(), OpenMode::ReadOnly)
            .unwrap();
        assert!(file
            .create_dataset("other", ElementType::Int(4), &[2])
            .is_err());

        let mut dataset = file.open_dataset("grid").unwrap();
        assert!(dataset
            .write(&Selection::All, TransferMode::Independent, &bytes(&[1, 2]))
            .is_err());
    }

    #[test]
    fn test_selection_checks() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let mut file = engine.create(Path::new("ckpt"), &serial()).unwrap();
        let mut dataset = file
            .create_dataset("grid", ElementType::Int(4), &[4, 4])
            .unwrap();

        let outside = Region::new(vec![3, 0], vec![2, 4]).unwrap();
        let err = dataset
            .write(&Selection::Hyperslab(&outside), TransferMode::Independent, &[0; 32])
            .unwrap_err();
        assert!(err.is_configuration());

        let row = Region::new(vec![1, 0], vec![1, 4]).unwrap();
        let err = dataset
            .write(&Selection::Hyperslab(&row), TransferMode::Independent, &[0; 12])
            .unwrap_err();
        assert!(err.is_configuration());

        dataset
            .write(&Selection::None, TransferMode::Independent, &[])
            .unwrap();
    }

    #[test]
    fn test_buffered_and_mapped_reads_agree() {
        let temp_dir = TempDir::new().unwrap();
        let values: Vec<i32> = (0..1024).collect();

        for use_mmap in [false, true] {
            let config = EngineConfig {
                base_path: temp_dir.path().to_path_buf(),
                use_mmap,
                mmap_threshold: 1024,
                ..Default::default()
            };
            let engine = LocalEngine::new(&config).unwrap();

            let mut file = engine.create(Path::new("ckpt"), &serial()).unwrap();
            let mut dataset = file
                .create_dataset("big", ElementType::Int(4), &[32, 32])
                .unwrap();
            dataset
                .write(&Selection::All, TransferMode::Independent, &bytes(&values))
                .unwrap();

            let block = Region::new(vec![8, 16], vec![4, 4]).unwrap();
            let mut out = vec![0i32; 16];
            dataset
                .read(
                    &Selection::Hyperslab(&block),
                    TransferMode::Independent,
                    bytemuck::cast_slice_mut(&mut out),
                )
                .unwrap();

            let expected: Vec<i32> = (8..12)
                .flat_map(|row| (16..20).map(move |col| row * 32 + col))
                .collect();
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn test_collective_rows_across_ranks() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        LocalGroup::run(4, |group| {
            let rank = group.rank();
            let access = FileAccess::new(Arc::new(group));

            let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
            let mut dataset = file
                .create_dataset("rows", ElementType::Int(4), &[4, 8])
                .unwrap();

            let row = Region::new(vec![rank as u64, 0], vec![1, 8]).unwrap();
            let values = vec![rank as i32; 8];
            dataset
                .write(&Selection::Hyperslab(&row), TransferMode::Collective, &bytes(&values))
                .unwrap();

            // Everyone reads the whole dataset after the collective write.
            let mut out = vec![0i32; 4 * 8];
            dataset
                .read(
                    &Selection::All,
                    TransferMode::Independent,
                    bytemuck::cast_slice_mut(&mut out),
                )
                .unwrap();
            for (i, &v) in out.iter().enumerate() {
                assert_eq!(v, (i / 8) as i32);
            }

            dataset.close().unwrap();
            file.close().unwrap();
        });
    }

    #[test]
    fn test_failed_collective_transfer_still_synchronizes() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        let outcomes = LocalGroup::run(2, |group| {
            let rank = group.rank();
            let access = FileAccess::new(Arc::new(group));
            let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
            let mut dataset = file
                .create_dataset("grid", ElementType::Int(4), &[2, 2])
                .unwrap();

            let row = Region::new(vec![rank as u64, 0], vec![1, 2]).unwrap();
            // Rank 1 passes a short buffer.
            let data = if rank == 1 { vec![0u8; 4] } else { vec![0u8; 8] };
            let first = dataset.write(&Selection::Hyperslab(&row), TransferMode::Collective, &data);

            // A second collective call must line up on both ranks.
            let second = dataset.write(
                &Selection::Hyperslab(&row),
                TransferMode::Collective,
                &[1u8; 8],
            );
            (first.is_ok(), second.is_ok())
        });

        assert_eq!(outcomes, vec![(true, true), (false, true)]);
    }

    #[test]
    fn test_close_waits_for_canonical_writer() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);
        let values: Vec<i32> = (0..64 * 1024).collect();

        let outcomes = LocalGroup::run(2, |group| {
            let access = FileAccess::new(Arc::new(group));
            let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
            let mut dataset = file
                .create_dataset("table", ElementType::Int(4), &[64 * 1024])
                .unwrap();
            if access.is_canonical() {
                // Give the other rank every chance to run ahead.
                std::thread::sleep(std::time::Duration::from_millis(50));
                dataset
                    .write(&Selection::All, TransferMode::Independent, &bytes(&values))
                    .unwrap();
            }
            dataset.close().unwrap();
            file.close().unwrap();

            let stored = fs::read(temp_dir.path().join("ckpt").join("table.dset")).unwrap();
            stored[stored.len() - 4..] == bytes(&[64 * 1024 - 1])[..]
        });

        assert_eq!(outcomes, vec![true, true]);
    }

    #[test]
    fn test_dataset_creation_failure_reaches_every_rank() {
        let temp_dir = TempDir::new().unwrap();
        let engine = create_test_engine(&temp_dir);

        let outcomes = LocalGroup::run(3, |group| {
            let access = FileAccess::new(Arc::new(group));
            let mut file = engine.create(Path::new("ckpt"), &access).unwrap();
            file.create_dataset("grid", ElementType::Int(4), &[3]).unwrap();
            file.create_dataset("grid", ElementType::Int(4), &[3]).is_err()
        });

        assert_eq!(outcomes, vec![true, true, true]);
    }
}
