// rust/restart-core/src/group/mod.rs

//! Process-group coordination.
//!
//! The I/O layer needs very little from the group it runs in: its own rank,
//! the group size, a barrier, and two reductions used to agree on how many
//! collective calls every rank will issue.
//!
//! # Implementations
//!
//! - [`SingleProcess`]: a group of one, for serial runs.
//! - [`LocalGroup`]: ranks as threads of one process, sharing an in-memory
//!   barrier. Used by the test-suite and the driver's simulated mode.
//! - `MpiGroup` (feature `mpi`): a communicator from the `mpi` crate.

use crate::error::{RestartError, Result};

mod local;
#[cfg(feature = "mpi")]
mod mpi_group;

pub use local::LocalGroup;
#[cfg(feature = "mpi")]
pub use mpi_group::MpiGroup;

/// Rank that writes GLOBAL-mode datasets unless configured otherwise.
pub const CANONICAL_RANK: usize = 0;

/// The coordination contract consumed by the I/O engine.
///
/// Every method except [`rank`](ProcessGroup::rank) and
/// [`size`](ProcessGroup::size) is collective: all ranks must call it the
/// same number of times in the same order, or the group deadlocks.
pub trait ProcessGroup {
    /// This process's rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self);

    /// Maximum of `value` over all ranks.
    fn all_reduce_max(&self, value: u64) -> u64;

    /// Sum of `value` over all ranks, wrapping on overflow.
    fn all_reduce_sum(&self, value: u64) -> u64;

    /// The MPI communicator behind the group, if there is one. Engines that
    /// open containers through MPI-IO need it.
    #[cfg(feature = "mpi")]
    fn communicator(&self) -> Option<&mpi::topology::SimpleCommunicator> {
        None
    }
}

/// A group consisting of the calling process only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce_max(&self, value: u64) -> u64 {
        value
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        value
    }
}

/// Turns a rank-local outcome into a group-wide one.
///
/// Collective. A rank whose own step failed gets its own error back; ranks
/// whose step succeeded get `elsewhere(failed_ranks)` if any peer failed.
/// Either way every rank leaves with the same success or failure, so none
/// of them goes on to a collective call the others will skip.
pub(crate) fn agree<T>(
    group: &dyn ProcessGroup,
    local: Result<T>,
    elsewhere: impl FnOnce(u64) -> RestartError,
) -> Result<T> {
    let failed_ranks = group.all_reduce_sum(u64::from(local.is_err()));
    match local {
        Ok(_) if failed_ranks > 0 => Err(elsewhere(failed_ranks)),
        outcome => outcome,
    }
}
