//! In-process communication backend: each worker is a thread.
//!
//! Workers share a slot table (one buffer per rank) and a barrier. Every
//! collective publishes into the slots, waits for the group, reads what it
//! needs, then waits again so no rank overwrites a slot that is still being
//! read. Useful for running the distributed solver on one machine without
//! MPI, and for exercising multi-rank behaviour in tests.
//!
//! The barrier can be poisoned: once a worker unwinds (see `run_group`),
//! every rank waiting in a collective, and every rank arriving at a later
//! one, panics instead of blocking forever. There is no recovery beyond
//! tearing the group down.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::comm::{CommunicationBackend, ROOT_RANK};
use super::partition::PartitionDescriptor;

struct BarrierState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

struct Shared {
    barrier: Mutex<BarrierState>,
    released: Condvar,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// One rank's handle on an in-process worker group.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create handles for a group of `size` workers, indexed by rank.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            released: Condvar::new(),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Vec<f64>>> {
        // Slots are plain data; a poisoned lock still holds a usable table.
        self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, data: &[f64]) {
        let mut slots = self.slots();
        let slot = &mut slots[self.rank];
        slot.clear();
        slot.extend_from_slice(data);
    }

    fn barrier_state(&self) -> MutexGuard<'_, BarrierState> {
        self.shared.barrier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) {
        let mut state = self.barrier_state();
        if state.poisoned {
            panic!("rank {}: worker group poisoned by a panic on another rank", self.rank);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.released.notify_all();
            return;
        }

        while state.generation == generation && !state.poisoned {
            state = self
                .shared
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            panic!("rank {}: worker group poisoned by a panic on another rank", self.rank);
        }
    }

    /// Release every waiting rank with a panic and fail all later
    /// collectives of this group.
    pub fn poison(&self) {
        let mut state = self.barrier_state();
        state.poisoned = true;
        self.shared.released.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.barrier_state().poisoned
    }
}

/// Poisons the group if its worker thread unwinds.
struct PoisonOnUnwind<'a>(&'a ThreadComm);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.poison();
        }
    }
}

impl CommunicationBackend for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.size
    }

    fn scatter_varcount(
        &self,
        global: Option<&[f64]>,
        partition: &PartitionDescriptor,
        local: &mut [f64],
    ) {
        if self.is_root() {
            self.publish(global.unwrap_or_default());
        }
        self.wait();
        {
            let slots = self.slots();
            local.copy_from_slice(&slots[ROOT_RANK][partition.range_of(self.rank)]);
        }
        self.wait();
    }

    fn all_gather_varcount(
        &self,
        local: &[f64],
        partition: &PartitionDescriptor,
        global: &mut [f64],
    ) {
        self.publish(local);
        self.wait();
        {
            let slots = self.slots();
            for (w, block) in slots.iter().enumerate() {
                global[partition.range_of(w)].copy_from_slice(block);
            }
        }
        self.wait();
    }

    fn gather_to_root(&self, local: f64) -> Option<Vec<f64>> {
        self.publish(&[local]);
        self.wait();
        let gathered = if self.is_root() {
            Some(self.slots().iter().map(|slot| slot[0]).collect())
        } else {
            None
        };
        self.wait();
        gathered
    }

    fn broadcast(&self, data: &mut [f64]) {
        if self.is_root() {
            self.publish(data);
        }
        self.wait();
        if !self.is_root() {
            data.copy_from_slice(&self.slots()[ROOT_RANK]);
        }
        self.wait();
    }

    fn barrier(&self) {
        self.wait();
    }
}

/// Run `f` on every rank of a fresh `size`-worker group, one scoped thread
/// per rank, and return the results in rank order.
///
/// A panic in any worker poisons the group, so ranks blocked in a
/// collective unwind too, and the first panic in rank order is re-raised on
/// the calling thread.
pub fn run_group<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&ThreadComm) -> T + Sync,
{
    let comms = ThreadComm::group(size);
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                scope.spawn(move || {
                    let _guard = PoisonOnUnwind(comm);
                    f(comm)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
            .collect()
    })
}
