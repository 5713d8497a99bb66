//! Distributed minimal-residual solver for dense systems.

pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod comm_thread;
pub mod convergence;
pub mod minres;
pub mod partition;
pub mod residual;
pub mod step;

pub use minres::{solve, solve_generated, LocalSystem, SolveOutcome, SolveReport};
