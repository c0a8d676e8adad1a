// rust/restart-core/src/io.rs

//! Mode-dispatch checkpoint I/O.
//!
//! [`RestartIo`] writes a set of [`DatasetDescriptor`]s to a container, or
//! restores them from one, dispatching each descriptor on its
//! [`StorageMode`]:
//!
//! - **SHARD**: the group first agrees on the largest part count of any
//!   rank. Every rank then issues exactly that many collective transfers,
//!   one hyperslab per part and empty selections once its own parts run
//!   out.
//! - **GLOBAL**: the canonical rank writes every part over the whole
//!   dataspace with independent transfers; on restart every rank reads the
//!   whole dataspace into each of its parts.
//!
//! Steps that can fail on one rank only (descriptor checks, opening a
//! dataset) end in an agreement round, so either every rank goes on to the
//! collective transfers or none does. Failed transfers never cut the loop
//! short; they are counted and reported per descriptor once the loop is
//! done. Writing a dataset ends in another agreement round, so a write
//! returns on every rank with the same outcome and only after the dataset
//! has been written and closed everywhere.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{LayoutConfig, RestartConfig};
use crate::dataset::{DatasetDescriptor, StorageMode};
use crate::element::ElementType;
use crate::engine::{self, FileEngine, Selection, TransferMode};
use crate::error::{RestartError, Result};
use crate::group::{agree, ProcessGroup, SingleProcess};
use crate::session::{DatasetHandle, FileAccess, FileSession, OpenMode};

/// Rank, extents and element type of a dataset as stored in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetShape {
    pub rank: usize,
    pub global_shape: Vec<u64>,
    pub element_type: ElementType,
}

/// Collective checkpoint writer and reader for one process group.
pub struct RestartIo {
    engine: Arc<dyn FileEngine>,
    access: FileAccess,
    layout: LayoutConfig,
}

impl RestartIo {
    pub fn new(engine: Arc<dyn FileEngine>, access: FileAccess) -> Self {
        Self {
            engine,
            access,
            layout: LayoutConfig::default(),
        }
    }

    /// Builds a `RestartIo` over the engine `config.engine.backend` selects.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid, and a
    /// group synchronization error if the canonical rank is not in `group`.
    pub fn from_config(config: &RestartConfig, group: Arc<dyn ProcessGroup>) -> Result<Self> {
        config.validate()?;

        let engine = engine::from_config(&config.engine)?;
        let access = FileAccess::from_config(group, &config.group)?;

        Ok(Self {
            engine,
            access,
            layout: config.layout.clone(),
        })
    }

    pub fn access(&self) -> &FileAccess {
        &self.access
    }

    /// Defines a descriptor under this instance's layout limits.
    pub fn define<'a>(
        &self,
        name: &str,
        rank: usize,
        element_type: ElementType,
        global_shape: &[u64],
        mode: StorageMode,
    ) -> Result<DatasetDescriptor<'a>> {
        DatasetDescriptor::define_with_layout(
            name,
            rank,
            element_type,
            global_shape,
            mode,
            &self.layout,
        )
    }

    /// Writes one dataset to a new container at `path`. Collective.
    pub fn write(&self, path: impl AsRef<Path>, descriptor: &DatasetDescriptor<'_>) -> Result<()> {
        self.write_all(path, std::slice::from_ref(descriptor))
    }

    /// Restores one dataset from the container at `path`. Collective.
    pub fn read(
        &self,
        path: impl AsRef<Path>,
        descriptor: &mut DatasetDescriptor<'_>,
    ) -> Result<()> {
        self.read_all(path, std::slice::from_mut(descriptor))
    }

    /// Writes every descriptor to a new container at `path`, replacing any
    /// existing one. Collective: every rank passes the same datasets in the
    /// same order, each with its own parts.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any I/O if the dataset names
    /// repeat on any rank. Otherwise returns the first error among the
    /// datasets; a dataset that fails does not stop the ones after it.
    pub fn write_all(
        &self,
        path: impl AsRef<Path>,
        descriptors: &[DatasetDescriptor<'_>],
    ) -> Result<()> {
        let path = path.as_ref();
        let group = self.access.group();

        agree(group, check_names(descriptors), |ranks| {
            RestartError::config(format!(
                "datasets for '{}' were rejected on {ranks} rank(s)",
                path.display()
            ))
        })?;

        let created = FileSession::create(self.engine.as_ref(), path, self.access.clone());
        let mut session = agree(group, created, |ranks| {
            RestartError::resource(path, format!("container creation failed on {ranks} rank(s)"))
        })?;

        let mut first_error = None;
        for descriptor in descriptors {
            match self.write_dataset(&mut session, descriptor) {
                Ok(()) => info!(
                    dataset = descriptor.name(),
                    mode = %descriptor.mode(),
                    parts = descriptor.num_parts(),
                    "wrote dataset"
                ),
                Err(e) => {
                    warn!(dataset = descriptor.name(), error = %e, "failed to write dataset");
                    first_error.get_or_insert(e);
                }
            }
        }

        let closed = session.close();
        match first_error {
            Some(e) => Err(e),
            None => closed,
        }
    }

    /// Restores every descriptor from the container at `path`. Collective.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any I/O if a part's buffer is
    /// read-only or names repeat, and a configuration error per dataset
    /// whose stored shape or element type differs from its descriptor.
    pub fn read_all(
        &self,
        path: impl AsRef<Path>,
        descriptors: &mut [DatasetDescriptor<'_>],
    ) -> Result<()> {
        let path = path.as_ref();
        let group = self.access.group();

        let checked = check_names(descriptors).and_then(|()| check_writable(descriptors));
        agree(group, checked, |ranks| {
            RestartError::config(format!(
                "datasets for '{}' were rejected on {ranks} rank(s)",
                path.display()
            ))
        })?;

        let opened = FileSession::open(
            self.engine.as_ref(),
            path,
            self.access.clone(),
            OpenMode::ReadOnly,
        );
        let mut session = agree(group, opened, |ranks| {
            RestartError::resource(path, format!("container could not be opened on {ranks} rank(s)"))
        })?;

        let mut first_error = None;
        for descriptor in descriptors.iter_mut() {
            match self.read_dataset(&mut session, descriptor) {
                Ok(()) => info!(
                    dataset = descriptor.name(),
                    mode = %descriptor.mode(),
                    parts = descriptor.num_parts(),
                    "restored dataset"
                ),
                Err(e) => {
                    warn!(dataset = descriptor.name(), error = %e, "failed to restore dataset");
                    first_error.get_or_insert(e);
                }
            }
        }

        let closed = session.close();
        match first_error {
            Some(e) => Err(e),
            None => closed,
        }
    }

    /// Reads the rank, extents and element type of a stored dataset without
    /// transferring element data. Not collective; any rank may call it.
    pub fn probe_shape(&self, path: impl AsRef<Path>, name: &str) -> Result<DatasetShape> {
        let path = path.as_ref();
        // Opened by this rank alone, so no engine treats it as collective.
        let mut session = FileSession::open(
            self.engine.as_ref(),
            path,
            FileAccess::new(Arc::new(SingleProcess)),
            OpenMode::ReadOnly,
        )?;
        let dataset = session.open_dataset(name)?;

        let global_shape = dataset.shape()?;
        let shape = DatasetShape {
            rank: global_shape.len(),
            global_shape,
            element_type: dataset.element_type()?,
        };
        debug!(path = %path.display(), dataset = name, ?shape, "probed dataset");

        dataset.close()?;
        session.close()?;
        Ok(shape)
    }

    fn write_dataset(
        &self,
        session: &mut FileSession,
        descriptor: &DatasetDescriptor<'_>,
    ) -> Result<()> {
        let created = session.create_dataset(
            descriptor.name(),
            descriptor.element_type(),
            descriptor.global_shape(),
        );
        let mut dataset = agree(self.access.group(), created, |ranks| {
            RestartError::resource(
                session.path(),
                format!("dataset '{}' could not be created on {ranks} rank(s)", descriptor.name()),
            )
        })?;

        let outcome = match descriptor.mode() {
            StorageMode::Shard => self.write_shard(&mut dataset, descriptor),
            StorageMode::Global => self.write_global(&mut dataset, descriptor),
        };
        let closed = dataset.close();

        // GLOBAL data is written by one rank only; nobody returns before it
        // is closed, and everybody learns whether it failed.
        agree(self.access.group(), outcome.and(closed), |ranks| {
            RestartError::resource(
                session.path(),
                format!("dataset '{}' was not written on {ranks} rank(s)", descriptor.name()),
            )
        })
    }

    fn write_shard(
        &self,
        dataset: &mut DatasetHandle,
        descriptor: &DatasetDescriptor<'_>,
    ) -> Result<()> {
        let rounds = self.shard_rounds(descriptor);
        let parts = descriptor.parts();

        let mut failures = TransferFailures::new(descriptor.name());
        for round in 0..rounds {
            let result = match parts.get(round) {
                Some(part) => {
                    let selection = part.region().map_or(Selection::None, Selection::Hyperslab);
                    dataset.write(&selection, TransferMode::Collective, part.bytes())
                }
                None => dataset.write(&Selection::None, TransferMode::Collective, &[]),
            };
            failures.record(round, result);
        }
        failures.finish(rounds)
    }

    fn write_global(
        &self,
        dataset: &mut DatasetHandle,
        descriptor: &DatasetDescriptor<'_>,
    ) -> Result<()> {
        if !self.access.is_canonical() {
            return Ok(());
        }

        let parts = descriptor.parts();
        let mut failures = TransferFailures::new(descriptor.name());
        for (index, part) in parts.iter().enumerate() {
            let result = dataset.write(&Selection::All, TransferMode::Independent, part.bytes());
            failures.record(index, result);
        }
        failures.finish(parts.len())
    }

    fn read_dataset(
        &self,
        session: &mut FileSession,
        descriptor: &mut DatasetDescriptor<'_>,
    ) -> Result<()> {
        let opened = session
            .open_dataset(descriptor.name())
            .and_then(|dataset| check_stored(&dataset, descriptor).map(|()| dataset));
        let mut dataset = agree(self.access.group(), opened, |ranks| {
            RestartError::resource(
                session.path(),
                format!("dataset '{}' could not be opened on {ranks} rank(s)", descriptor.name()),
            )
        })?;

        let outcome = match descriptor.mode() {
            StorageMode::Shard => self.read_shard(&mut dataset, descriptor),
            StorageMode::Global => read_global(&mut dataset, descriptor),
        };
        let closed = dataset.close();
        outcome.and(closed)
    }

    fn read_shard(
        &self,
        dataset: &mut DatasetHandle,
        descriptor: &mut DatasetDescriptor<'_>,
    ) -> Result<()> {
        let rounds = self.shard_rounds(descriptor);
        let name = descriptor.name().to_string();
        let parts = descriptor.parts_mut();

        let mut failures = TransferFailures::new(&name);
        for round in 0..rounds {
            let result = match parts.get_mut(round).map(|part| part.split_mut()) {
                Some((region, Some(buf))) => {
                    let selection = region.map_or(Selection::None, Selection::Hyperslab);
                    dataset.read(&selection, TransferMode::Collective, buf)
                }
                Some((_, None)) => {
                    // Read-only parts are refused up front; keep the round
                    // collective all the same.
                    dataset
                        .read(&Selection::None, TransferMode::Collective, &mut [])
                        .and(Err(RestartError::config(format!(
                            "part {round} of '{name}' is read-only"
                        ))))
                }
                None => dataset.read(&Selection::None, TransferMode::Collective, &mut []),
            };
            failures.record(round, result);
        }
        failures.finish(rounds)
    }

    /// Number of collective transfer rounds for a SHARD descriptor: the
    /// largest part count over the group. Collective.
    fn shard_rounds(&self, descriptor: &DatasetDescriptor<'_>) -> usize {
        let rounds = self
            .access
            .group()
            .all_reduce_max(descriptor.num_parts() as u64) as usize;
        debug!(
            dataset = descriptor.name(),
            parts = descriptor.num_parts(),
            rounds,
            rank = self.access.rank(),
            "agreed on transfer rounds"
        );
        rounds
    }
}

impl std::fmt::Debug for RestartIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartIo")
            .field("access", &self.access)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

fn read_global(dataset: &mut DatasetHandle, descriptor: &mut DatasetDescriptor<'_>) -> Result<()> {
    let name = descriptor.name().to_string();
    let parts = descriptor.parts_mut();

    let mut failures = TransferFailures::new(&name);
    for (index, part) in parts.iter_mut().enumerate() {
        let result = match part.bytes_mut() {
            Some(buf) => dataset.read(&Selection::All, TransferMode::Independent, buf),
            None => Err(RestartError::config(format!(
                "part {index} of '{name}' is read-only"
            ))),
        };
        failures.record(index, result);
    }
    failures.finish(parts.len())
}

fn check_names(descriptors: &[DatasetDescriptor<'_>]) -> Result<()> {
    let mut seen = HashSet::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !seen.insert(descriptor.name()) {
            return Err(RestartError::config(format!(
                "dataset '{}' is listed more than once",
                descriptor.name()
            )));
        }
    }
    Ok(())
}

fn check_writable(descriptors: &[DatasetDescriptor<'_>]) -> Result<()> {
    for descriptor in descriptors {
        if let Some(index) = descriptor.parts().iter().position(|p| !p.is_writable()) {
            return Err(RestartError::config(format!(
                "part {index} of '{}' is registered read-only and cannot be restored",
                descriptor.name()
            )));
        }
    }
    Ok(())
}

/// Checks a stored dataset against the descriptor it is restored into.
fn check_stored(dataset: &DatasetHandle, descriptor: &DatasetDescriptor<'_>) -> Result<()> {
    let shape = dataset.shape()?;
    if shape != descriptor.global_shape() {
        return Err(RestartError::config(format!(
            "dataset '{}' is stored with shape {shape:?} but described as {:?}",
            descriptor.name(),
            descriptor.global_shape()
        )));
    }

    let element_type = dataset.element_type()?;
    if element_type != descriptor.element_type() {
        return Err(RestartError::config(format!(
            "dataset '{}' is stored as {element_type} but described as {}",
            descriptor.name(),
            descriptor.element_type()
        )));
    }

    Ok(())
}

/// Failed transfers of one descriptor.
struct TransferFailures<'n> {
    dataset: &'n str,
    first: Option<(usize, RestartError)>,
    failed: usize,
}

impl<'n> TransferFailures<'n> {
    fn new(dataset: &'n str) -> Self {
        Self {
            dataset,
            first: None,
            failed: 0,
        }
    }

    fn record(&mut self, part: usize, result: Result<()>) {
        if let Err(e) = result {
            warn!(dataset = self.dataset, part, error = %e, "transfer failed");
            self.failed += 1;
            if self.first.is_none() {
                self.first = Some((part, e));
            }
        }
    }

    fn finish(self, attempted: usize) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some((part, source)) => Err(RestartError::transfer(
                self.dataset,
                part,
                self.failed,
                attempted,
                source,
            )),
        }
    }
}
