//! MPI communication backend for the distributed solver.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements `CommunicationBackend` with the rsmpi collectives
//! (`scatter_varcount`, `all_gather_varcount`, `gather`, `broadcast`).
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiComm` and keep the
//! universe alive for the whole run:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use super::comm::{CommunicationBackend, ROOT_RANK};
use super::partition::PartitionDescriptor;

/// MPI-based communication backend.
///
/// Wraps the MPI world communicator. Requires `mpi::initialize()` to have
/// been called before construction.
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts and displacements in the integer type MPI expects.
///
/// Lengths are bounded by `max_message_len`, checked when a layout meets
/// the communicator.
fn counts_and_displs(partition: &PartitionDescriptor) -> (Vec<Count>, Vec<Count>) {
    let counts = partition.lengths().iter().map(|&len| len as Count).collect();
    let displs = partition.offsets().iter().map(|&off| off as Count).collect();
    (counts, displs)
}

impl CommunicationBackend for MpiComm {
    fn rank(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.size() as usize
    }

    fn scatter_varcount(
        &self,
        global: Option<&[f64]>,
        partition: &PartitionDescriptor,
        local: &mut [f64],
    ) {
        let world = SimpleCommunicator::world();
        let root = world.process_at_rank(ROOT_RANK as i32);

        if world.rank() == ROOT_RANK as i32 {
            let (counts, displs) = counts_and_displs(partition);
            let send = Partition::new(global.unwrap_or_default(), &counts[..], &displs[..]);
            root.scatter_varcount_into_root(&send, local);
        } else {
            root.scatter_varcount_into(local);
        }
    }

    fn all_gather_varcount(
        &self,
        local: &[f64],
        partition: &PartitionDescriptor,
        global: &mut [f64],
    ) {
        let world = SimpleCommunicator::world();
        let (counts, displs) = counts_and_displs(partition);
        let mut recv = PartitionMut::new(global, &counts[..], &displs[..]);
        world.all_gather_varcount_into(local, &mut recv);
    }

    fn gather_to_root(&self, local: f64) -> Option<Vec<f64>> {
        let world = SimpleCommunicator::world();
        let root = world.process_at_rank(ROOT_RANK as i32);

        if world.rank() == ROOT_RANK as i32 {
            let mut gathered = vec![0.0f64; world.size() as usize];
            root.gather_into_root(&local, &mut gathered[..]);
            Some(gathered)
        } else {
            root.gather_into(&local);
            None
        }
    }

    fn broadcast(&self, data: &mut [f64]) {
        let world = SimpleCommunicator::world();
        world.process_at_rank(ROOT_RANK as i32).broadcast_into(data);
    }

    fn barrier(&self) {
        let world = SimpleCommunicator::world();
        world.barrier();
    }

    fn max_message_len(&self) -> usize {
        Count::MAX as usize
    }
}
