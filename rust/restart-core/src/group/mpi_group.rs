// rust/restart-core/src/group/mpi_group.rs

//! Process groups backed by an MPI communicator.

use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::ProcessGroup;

/// Ranks of an MPI communicator, usually `MPI_COMM_WORLD`.
pub struct MpiGroup {
    comm: SimpleCommunicator,
}

impl MpiGroup {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// The world communicator of an initialized MPI universe.
    pub fn world(universe: &mpi::environment::Universe) -> Self {
        Self::new(universe.world())
    }
}

impl ProcessGroup for MpiGroup {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        let mut reduced = 0u64;
        self.comm
            .all_reduce_into(&value, &mut reduced, SystemOperation::max());
        reduced
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        let mut reduced = 0u64;
        self.comm
            .all_reduce_into(&value, &mut reduced, SystemOperation::sum());
        reduced
    }

    fn communicator(&self) -> Option<&SimpleCommunicator> {
        Some(&self.comm)
    }
}
