//! Multi-process solver tests over MPI.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use dmres::config::SolverConfig;
use dmres::problem::DenseMatrix;
use dmres::solver::comm::CommunicationBackend;
use dmres::solver::comm_mpi::MpiComm;
use dmres::solver::partition::Layout;
use dmres::solver::{solve, LocalSystem, SolveOutcome};

#[test]
fn distributed_reference_system() {
    // Works for any rank count up to 6.
    let _universe = mpi::initialize().expect("MPI init failed");
    let comm = MpiComm::new();

    let a = DenseMatrix::reference(6);
    let b = vec![15.0, 16.0, 17.0, 18.0, 19.0, 20.0];
    let layout = Layout::new(comm.num_ranks(), 6).expect("layout failed");

    let (matrix, rhs) = if comm.is_root() {
        (Some(&a), Some(b.as_slice()))
    } else {
        (None, None)
    };
    let system = LocalSystem::distribute(&comm, layout, matrix, rhs).expect("distribute failed");

    let config = SolverConfig {
        tolerance: 1e-10,
        ..SolverConfig::default()
    };
    let report = solve(&comm, &system, &config, None).expect("solve failed");

    assert_eq!(report.outcome, SolveOutcome::Converged);
    for (i, xi) in report.x.iter().enumerate() {
        assert!((xi - i as f64).abs() < 1e-8, "x[{i}]={xi}, expected {i}");
    }
}
