//! Communication backend abstraction for the distributed solver.
//!
//! Provides a trait for the collectives the solver needs (variable-count
//! scatter and all-gather, scalar gather to the root, broadcast) and a
//! pass-through single-process implementation.

use super::partition::PartitionDescriptor;

/// Rank that owns the full matrix and reduces the step size.
pub const ROOT_RANK: usize = 0;

/// Abstraction over inter-worker communication for the distributed solver.
///
/// Every call is a collective: all ranks must issue the same calls in the
/// same order with the same partition, or the group deadlocks.
///
/// The solver operations (`compute_residual`, `compute_step`,
/// `update_iterate`, `is_converged`) check their arguments before their
/// first collective and fail only on the rank that detects a mismatch.
/// `solve` and `LocalSystem::distribute` agree on such failures across the
/// group before any data moves.
///
/// Implementations: `SingleProcessComm` (no-op), `ThreadComm` (in-process
/// worker threads), `MpiComm` (via mpi crate).
pub trait CommunicationBackend: Send + Sync {
    /// This worker's rank.
    fn rank(&self) -> usize;

    /// Total number of workers.
    fn num_ranks(&self) -> usize;

    /// Split the root's `global` buffer into per-rank blocks.
    ///
    /// `global` is only read on the root and may be `None` elsewhere.
    /// `local` must have length `partition.len_of(self.rank())`.
    fn scatter_varcount(
        &self,
        global: Option<&[f64]>,
        partition: &PartitionDescriptor,
        local: &mut [f64],
    );

    /// Concatenate every rank's `local` block into `global` on all ranks,
    /// placing rank `w`'s block at `partition.offset_of(w)`.
    fn all_gather_varcount(
        &self,
        local: &[f64],
        partition: &PartitionDescriptor,
        global: &mut [f64],
    );

    /// Collect one scalar per rank on the root, in rank order.
    ///
    /// Returns `Some` on the root and `None` on every other rank.
    fn gather_to_root(&self, local: f64) -> Option<Vec<f64>>;

    /// Replicate the root's `data` to every rank, in place.
    fn broadcast(&self, data: &mut [f64]);

    /// Synchronization barrier.
    fn barrier(&self);

    /// Largest buffer, in elements, a single collective can move.
    fn max_message_len(&self) -> usize {
        usize::MAX
    }

    fn is_root(&self) -> bool {
        self.rank() == ROOT_RANK
    }
}

/// No-op communication backend for a single worker.
///
/// Collectives copy straight through because the one worker owns every
/// block.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn scatter_varcount(
        &self,
        global: Option<&[f64]>,
        partition: &PartitionDescriptor,
        local: &mut [f64],
    ) {
        if let Some(global) = global {
            local.copy_from_slice(&global[partition.range_of(0)]);
        }
    }

    fn all_gather_varcount(
        &self,
        local: &[f64],
        partition: &PartitionDescriptor,
        global: &mut [f64],
    ) {
        global[partition.range_of(0)].copy_from_slice(local);
    }

    fn gather_to_root(&self, local: f64) -> Option<Vec<f64>> {
        Some(vec![local])
    }

    fn broadcast(&self, _data: &mut [f64]) {
        // Single process: the root's data is already everywhere.
    }

    fn barrier(&self) {}
}
