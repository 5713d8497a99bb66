//! Distributed minimal-residual iteration.
//!
//! Each iteration forms the residual `y = A·x − b`, the step
//! `t = (A·y, y) / (A·y, A·y)`, the new iterate `x − t·y`, and then checks
//! `‖A·x − b‖ / ‖b‖` on the new iterate. Every worker runs the same loop on
//! its own block of rows; collectives keep `x` and `y` identical across the
//! group, so every worker leaves the loop at the same iteration with the
//! same outcome.

use std::fmt;
use std::time::Instant;

use crate::config::{RunConfig, SolverConfig};
use crate::error::{DmresError, Result};
use crate::problem::{build_rhs, DenseMatrix};
use crate::stats::Stats;

use super::comm::CommunicationBackend;
use super::convergence::is_converged;
use super::partition::Layout;
use super::residual::{check_local_shapes, compute_residual, norm};
use super::step::{compute_step, update_iterate};

const STATUS_OK: f64 = 0.0;
const STATUS_INVALID: f64 = 1.0;

/// One worker's share of the system: its matrix rows and a full copy of `b`.
#[derive(Debug, Clone)]
pub struct LocalSystem {
    layout: Layout,
    rank: usize,
    local_rows: Vec<f64>,
    b: Vec<f64>,
    b_norm: f64,
}

impl LocalSystem {
    /// Scatter the root's matrix rows and broadcast its right-hand side.
    ///
    /// `matrix` and `b` are only read on the root. If the root's inputs do
    /// not fit the layout, every rank returns the same error.
    pub fn distribute(
        comm: &dyn CommunicationBackend,
        layout: Layout,
        matrix: Option<&DenseMatrix>,
        b: Option<&[f64]>,
    ) -> Result<Self> {
        let rank = comm.rank();
        let _span = tracing::debug_span!("distribute", rank).entered();
        check_group(comm, &layout)?;
        let n = layout.n();

        let mut status = [STATUS_OK];
        if comm.is_root() {
            let fits = matrix.is_some_and(|m| m.n() == n) && b.is_some_and(|b| b.len() == n);
            if !fits {
                status[0] = STATUS_INVALID;
            }
        }
        comm.broadcast(&mut status);
        if status[0] != STATUS_OK {
            return Err(DmresError::Dimension(format!(
                "root has no {n}x{n} system to distribute"
            )));
        }

        let mut local_rows = vec![0.0; layout.rows().len_of(rank)];
        comm.scatter_varcount(matrix.map(DenseMatrix::data), layout.rows(), &mut local_rows);

        let mut b = match b {
            Some(b) if comm.is_root() => b.to_vec(),
            _ => vec![0.0; n],
        };
        comm.broadcast(&mut b);

        let b_norm = norm(&b);
        Ok(Self {
            layout,
            rank,
            local_rows,
            b,
            b_norm,
        })
    }

    /// Take this rank's block from a matrix every worker already holds.
    pub fn from_global(layout: Layout, rank: usize, matrix: &DenseMatrix, b: Vec<f64>) -> Result<Self> {
        let n = layout.n();
        if matrix.n() != n || b.len() != n {
            return Err(DmresError::Dimension(format!(
                "system is {0}x{0} with rhs of length {1}, layout expects {n}",
                matrix.n(),
                b.len()
            )));
        }
        if rank >= layout.num_workers() {
            return Err(DmresError::Partition(format!(
                "rank {rank} outside a group of {}",
                layout.num_workers()
            )));
        }
        let local_rows = matrix.data()[layout.rows().range_of(rank)].to_vec();
        let b_norm = norm(&b);
        Ok(Self {
            layout,
            rank,
            local_rows,
            b,
            b_norm,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn local_rows(&self) -> &[f64] {
        &self.local_rows
    }

    pub fn b(&self) -> &[f64] {
        &self.b
    }

    pub fn b_norm(&self) -> f64 {
        self.b_norm
    }
}

fn check_group(comm: &dyn CommunicationBackend, layout: &Layout) -> Result<()> {
    if comm.num_ranks() != layout.num_workers() {
        return Err(DmresError::Partition(format!(
            "layout is for {} workers, group has {}",
            layout.num_workers(),
            comm.num_ranks()
        )));
    }
    let matrix_len = layout.rows().capacity();
    if matrix_len > comm.max_message_len() {
        return Err(DmresError::Partition(format!(
            "{0}x{0} matrix ({matrix_len} elements) exceeds the backend's {1}-element collectives",
            layout.n(),
            comm.max_message_len()
        )));
    }
    Ok(())
}

/// This rank's block must be the one the layout assigns it.
fn check_system(comm: &dyn CommunicationBackend, system: &LocalSystem) -> Result<()> {
    if comm.rank() != system.rank {
        return Err(DmresError::Partition(format!(
            "system block belongs to rank {}, called on rank {}",
            system.rank,
            comm.rank()
        )));
    }
    check_local_shapes(&system.layout, system.rank, &system.local_rows, &[("b", &system.b)])
}

/// Share a per-rank validation result: every rank fails if any rank did.
fn agree(comm: &dyn CommunicationBackend, local: Result<()>) -> Result<()> {
    let flags = comm.gather_to_root(if local.is_err() { STATUS_INVALID } else { STATUS_OK });
    let mut status = [STATUS_OK];
    if flags.is_some_and(|flags| flags.iter().any(|&flag| flag != STATUS_OK)) {
        status[0] = STATUS_INVALID;
    }
    comm.broadcast(&mut status);

    match local {
        Err(e) => Err(e),
        Ok(()) if status[0] != STATUS_OK => Err(DmresError::Partition(
            "another rank rejected its share of the system".into(),
        )),
        Ok(()) => Ok(()),
    }
}

/// How a solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// Relative residual fell below the tolerance.
    Converged,
    /// Iteration cap reached first.
    Exhausted,
    /// `A·y` vanished for a non-zero residual; no step can make progress.
    Degenerate,
    /// The residual ratio became NaN or infinite. Only reached through
    /// overflow or non-finite data; the minimal-residual step itself never
    /// increases the residual.
    Diverged,
}

impl fmt::Display for SolveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveOutcome::Converged => "converged",
            SolveOutcome::Exhausted => "exhausted",
            SolveOutcome::Degenerate => "degenerate",
            SolveOutcome::Diverged => "diverged",
        };
        f.write_str(name)
    }
}

/// Result of a solve, identical on every worker.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub outcome: SolveOutcome,
    pub iterations: usize,
    /// Relative residual of `x`.
    pub residual_ratio: f64,
    pub x: Vec<f64>,
    /// Relative residual after each iteration.
    pub history: Vec<f64>,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        self.outcome == SolveOutcome::Converged
    }
}

/// Run the minimal-residual iteration from `x = 0`.
///
/// Configuration and shape errors are returned as `Err`, on every rank if
/// any rank's block does not match the layout; the numerical outcome
/// (including degenerate and exhausted runs) is in the report.
pub fn solve(
    comm: &dyn CommunicationBackend,
    system: &LocalSystem,
    config: &SolverConfig,
    mut stats: Option<&mut Stats>,
) -> Result<SolveReport> {
    config.validate()?;
    let layout = &system.layout;
    check_group(comm, layout)?;
    agree(comm, check_system(comm, system))?;

    let n = layout.n();
    let _span =
        tracing::info_span!("minres_solve", rank = comm.rank(), n, workers = comm.num_ranks()).entered();
    let indexing = config.indexing;
    let rows = system.local_rows.as_slice();
    let b = system.b.as_slice();

    let mut x = vec![0.0; n];
    let mut history = Vec::new();

    if system.b_norm == 0.0 {
        return Ok(SolveReport {
            outcome: SolveOutcome::Converged,
            iterations: 0,
            residual_ratio: 0.0,
            x,
            history,
        });
    }

    for iter in 0..config.max_iterations {
        let started = Instant::now();
        let y = compute_residual(comm, layout, rows, &x, b, indexing)?;
        let residual_done = Instant::now();

        let t = match compute_step(comm, layout, rows, &y, indexing) {
            Ok(t) => t,
            Err(DmresError::Degenerate(reason)) => {
                let ratio = norm(&y) / system.b_norm;
                let outcome = if ratio == 0.0 {
                    SolveOutcome::Converged
                } else {
                    tracing::warn!(iteration = iter + 1, %reason, "stopping on degenerate step");
                    SolveOutcome::Degenerate
                };
                return Ok(SolveReport {
                    outcome,
                    iterations: iter,
                    residual_ratio: ratio,
                    x,
                    history,
                });
            }
            Err(e) => return Err(e),
        };
        let step_done = Instant::now();

        let x_next = update_iterate(comm, layout, &x, &y, t, indexing)?;
        let update_done = Instant::now();

        let check = is_converged(comm, layout, rows, &x_next, b, system.b_norm, config.tolerance, indexing)?;

        if let Some(stats) = stats.as_deref_mut() {
            stats.iterations += 1;
            stats.residual += residual_done - started;
            stats.step_size += step_done - residual_done;
            stats.update += update_done - step_done;
            stats.convergence_check += update_done.elapsed();
        }

        x = x_next;
        history.push(check.ratio);
        if comm.is_root() {
            tracing::info!(iteration = iter + 1, ratio = check.ratio, t, "residual ratio");
        }

        let outcome = if !check.ratio.is_finite() {
            Some(SolveOutcome::Diverged)
        } else if check.converged {
            Some(SolveOutcome::Converged)
        } else {
            None
        };
        if let Some(outcome) = outcome {
            tracing::debug!(iterations = iter + 1, %outcome, "minimal residual finished");
            return Ok(SolveReport {
                outcome,
                iterations: iter + 1,
                residual_ratio: check.ratio,
                x,
                history,
            });
        }
    }

    let residual_ratio = history.last().copied().unwrap_or(1.0);
    tracing::warn!(
        max_iterations = config.max_iterations,
        residual_ratio,
        "iteration cap reached before convergence"
    );
    Ok(SolveReport {
        outcome: SolveOutcome::Exhausted,
        iterations: config.max_iterations,
        residual_ratio,
        x,
        history,
    })
}

/// Generate the configured problem on the root, distribute it and solve.
///
/// Every rank must call this with the same configuration.
pub fn solve_generated(
    comm: &dyn CommunicationBackend,
    config: &RunConfig,
    mut stats: Option<&mut Stats>,
) -> Result<SolveReport> {
    config.validate()?;
    let n = config.problem.size;
    let layout = Layout::new(comm.num_ranks(), n)?;

    let started = Instant::now();
    let (matrix, b) = if comm.is_root() {
        (Some(DenseMatrix::reference(n)), Some(build_rhs(&config.problem)?))
    } else {
        (None, None)
    };
    let system = LocalSystem::distribute(comm, layout, matrix.as_ref(), b.as_deref())?;
    drop(matrix);
    if let Some(stats) = stats.as_deref_mut() {
        stats.add_phase("Setup + distribute", started.elapsed());
    }

    let started = Instant::now();
    let report = solve(comm, &system, &config.solver, stats.as_deref_mut())?;
    if let Some(stats) = stats.as_deref_mut() {
        stats.add_phase("Solve", started.elapsed());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockIndexing;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_thread::run_group;
    use crate::solver::partition::PartitionDescriptor;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One worker whose `nth` all-gather delivers infinities, as an
    /// overflowing product would.
    struct OverflowingGather {
        calls: AtomicUsize,
        nth: usize,
    }

    /// One worker that can only move `limit` elements per collective.
    struct CappedComm {
        limit: usize,
    }

    impl CommunicationBackend for OverflowingGather {
        fn rank(&self) -> usize {
            0
        }

        fn num_ranks(&self) -> usize {
            1
        }

        fn scatter_varcount(&self, global: Option<&[f64]>, partition: &PartitionDescriptor, local: &mut [f64]) {
            SingleProcessComm.scatter_varcount(global, partition, local);
        }

        fn all_gather_varcount(&self, local: &[f64], partition: &PartitionDescriptor, global: &mut [f64]) {
            SingleProcessComm.all_gather_varcount(local, partition, global);
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.nth {
                global.fill(f64::INFINITY);
            }
        }

        fn gather_to_root(&self, local: f64) -> Option<Vec<f64>> {
            SingleProcessComm.gather_to_root(local)
        }

        fn broadcast(&self, _data: &mut [f64]) {}

        fn barrier(&self) {}
    }

    impl CommunicationBackend for CappedComm {
        fn rank(&self) -> usize {
            0
        }

        fn num_ranks(&self) -> usize {
            1
        }

        fn scatter_varcount(&self, global: Option<&[f64]>, partition: &PartitionDescriptor, local: &mut [f64]) {
            SingleProcessComm.scatter_varcount(global, partition, local);
        }

        fn all_gather_varcount(&self, local: &[f64], partition: &PartitionDescriptor, global: &mut [f64]) {
            SingleProcessComm.all_gather_varcount(local, partition, global);
        }

        fn gather_to_root(&self, local: f64) -> Option<Vec<f64>> {
            SingleProcessComm.gather_to_root(local)
        }

        fn broadcast(&self, _data: &mut [f64]) {}

        fn barrier(&self) {}

        fn max_message_len(&self) -> usize {
            self.limit
        }
    }

    fn single(matrix: &DenseMatrix, b: Vec<f64>) -> LocalSystem {
        let layout = Layout::new(1, matrix.n()).unwrap();
        LocalSystem::from_global(layout, 0, matrix, b).unwrap()
    }

    #[test]
    fn identity_converges_in_one_iteration() {
        let a = DenseMatrix::identity(5);
        let b = vec![3.0, -1.0, 0.5, 2.0, 7.0];
        let report = solve(&SingleProcessComm, &single(&a, b.clone()), &SolverConfig::default(), None).unwrap();
        assert_eq!(report.outcome, SolveOutcome::Converged);
        assert_eq!(report.iterations, 1);
        for (xi, bi) in report.x.iter().zip(&b) {
            assert_abs_diff_eq!(xi, bi, epsilon = 1e-14);
        }
    }

    #[test]
    fn zero_rhs_is_solved_by_zero() {
        let a = DenseMatrix::reference(3);
        let report = solve(&SingleProcessComm, &single(&a, vec![0.0; 3]), &SolverConfig::default(), None).unwrap();
        assert!(report.converged());
        assert_eq!(report.iterations, 0);
        assert_eq!(report.x, vec![0.0; 3]);
    }

    #[test]
    fn two_by_two_reaches_solution_in_one_step() {
        let a = DenseMatrix::reference(2);
        let report = solve(&SingleProcessComm, &single(&a, vec![1.0, 1.0]), &SolverConfig::default(), None).unwrap();
        assert!(report.converged());
        assert_eq!(report.iterations, 1);
        assert_abs_diff_eq!(report.x[0], 1.0 / 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(report.x[1], 1.0 / 3.0, epsilon = 1e-15);
    }

    #[test]
    fn iteration_cap_reports_exhausted() {
        let a = DenseMatrix::reference(6);
        let config = SolverConfig {
            tolerance: 1e-10,
            max_iterations: 2,
            ..SolverConfig::default()
        };
        let b = (15..=20).map(f64::from).collect();
        let report = solve(&SingleProcessComm, &single(&a, b), &config, None).unwrap();
        assert_eq!(report.outcome, SolveOutcome::Exhausted);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.history.len(), 2);
        assert!(report.residual_ratio > 1e-10);
    }

    #[test]
    fn singular_matrix_reports_degenerate_on_every_rank() {
        let a = DenseMatrix::from_fn(4, |_, _| 0.0);
        let b = vec![1.0, 2.0, 3.0, 4.0];
        let layout = Layout::new(2, 4).unwrap();
        let reports = run_group(2, |comm| {
            let system = LocalSystem::from_global(layout.clone(), comm.rank(), &a, b.clone()).unwrap();
            solve(comm, &system, &SolverConfig::default(), None).unwrap()
        });
        for report in reports {
            assert_eq!(report.outcome, SolveOutcome::Degenerate);
            assert_eq!(report.iterations, 0);
            assert_abs_diff_eq!(report.residual_ratio, 1.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let a = DenseMatrix::identity(2);
        let config = SolverConfig {
            tolerance: -1.0,
            ..SolverConfig::default()
        };
        let err = solve(&SingleProcessComm, &single(&a, vec![1.0, 1.0]), &config, None).unwrap_err();
        assert!(matches!(err, DmresError::Config(_)));
    }

    #[test]
    fn group_size_must_match_layout() {
        let a = DenseMatrix::identity(4);
        let layout = Layout::new(2, 4).unwrap();
        let system = LocalSystem::from_global(layout, 0, &a, vec![1.0; 4]).unwrap();
        let err = solve(&SingleProcessComm, &system, &SolverConfig::default(), None).unwrap_err();
        assert!(matches!(err, DmresError::Partition(_)));
    }

    #[test]
    fn non_finite_residual_reports_diverged() {
        let a = DenseMatrix::reference(3);
        // Third all-gather of the first iteration is the convergence residual.
        let comm = OverflowingGather {
            calls: AtomicUsize::new(0),
            nth: 2,
        };
        let report = solve(&comm, &single(&a, vec![1.0, 2.0, 3.0]), &SolverConfig::default(), None).unwrap();
        assert_eq!(report.outcome, SolveOutcome::Diverged);
        assert!(!report.converged());
        assert_eq!(report.iterations, 1);
        assert!(report.residual_ratio.is_infinite());
        assert_eq!(report.history.len(), 1);
    }

    #[test]
    fn mismatched_block_fails_on_every_rank() {
        let a = DenseMatrix::reference(4);
        let b = vec![1.0, 2.0, 3.0, 4.0];
        let layout = Layout::new(2, 4).unwrap();
        let results = run_group(2, |comm| {
            // Rank 1 is handed rank 0's block.
            let system = LocalSystem::from_global(layout.clone(), 0, &a, b.clone()).unwrap();
            solve(comm, &system, &SolverConfig::default(), None)
        });
        assert!(matches!(&results[0], Err(DmresError::Partition(msg)) if msg.contains("another rank")));
        assert!(matches!(&results[1], Err(DmresError::Partition(msg)) if msg.contains("belongs to rank 0")));
    }

    #[test]
    fn matrix_larger_than_backend_messages_rejected() {
        let a = DenseMatrix::identity(3);
        let comm = CappedComm { limit: 8 };
        let err = solve(&comm, &single(&a, vec![1.0; 3]), &SolverConfig::default(), None).unwrap_err();
        assert!(matches!(err, DmresError::Partition(_)), "{err}");

        let layout = Layout::new(1, 3).unwrap();
        let err = LocalSystem::distribute(&comm, layout, Some(&a), Some(&[1.0; 3])).unwrap_err();
        assert!(err.to_string().contains("9 elements"), "{err}");

        let roomy = CappedComm { limit: 9 };
        assert!(solve(&roomy, &single(&a, vec![1.0; 3]), &SolverConfig::default(), None)
            .unwrap()
            .converged());
    }

    #[test]
    fn distribute_matches_from_global() {
        let n = 5;
        let a = DenseMatrix::from_fn(n, |i, j| (i * 10 + j) as f64);
        let b: Vec<f64> = (0..n).map(|i| i as f64 + 0.5).collect();
        let layout = Layout::new(3, n).unwrap();
        let systems = run_group(3, |comm| {
            let (m, rhs) = if comm.is_root() { (Some(&a), Some(b.as_slice())) } else { (None, None) };
            LocalSystem::distribute(comm, layout.clone(), m, rhs).unwrap()
        });
        for (rank, system) in systems.iter().enumerate() {
            let expected = LocalSystem::from_global(layout.clone(), rank, &a, b.clone()).unwrap();
            assert_eq!(system.local_rows(), expected.local_rows());
            assert_eq!(system.b(), b.as_slice());
            assert_abs_diff_eq!(system.b_norm(), expected.b_norm(), epsilon = 1e-15);
        }
    }

    #[test]
    fn distribute_without_root_data_fails_everywhere() {
        let layout = Layout::new(2, 3).unwrap();
        let results = run_group(2, |comm| LocalSystem::distribute(comm, layout.clone(), None, None));
        for result in results {
            assert!(matches!(result, Err(DmresError::Dimension(_))));
        }
    }

    #[test]
    fn rank_shifted_solves_like_global_on_one_worker() {
        let a = DenseMatrix::reference(4);
        let b = vec![5.0, 6.0, 7.0, 8.0];
        let global = solve(&SingleProcessComm, &single(&a, b.clone()), &SolverConfig::default(), None).unwrap();
        let config = SolverConfig {
            indexing: BlockIndexing::RankShifted,
            ..SolverConfig::default()
        };
        let shifted = solve(&SingleProcessComm, &single(&a, b), &config, None).unwrap();
        assert_eq!(global.iterations, shifted.iterations);
        assert_eq!(global.x, shifted.x);
    }

    #[test]
    fn stats_count_iterations() {
        let a = DenseMatrix::reference(4);
        let mut stats = Stats::new();
        let report = solve(
            &SingleProcessComm,
            &single(&a, vec![1.0, 2.0, 3.0, 4.0]),
            &SolverConfig::default(),
            Some(&mut stats),
        )
        .unwrap();
        assert_eq!(stats.iterations, report.iterations);
    }

    #[test]
    fn solve_generated_small_reference_problem() {
        let mut config = RunConfig::default();
        config.problem.size = 8;
        config.solver.tolerance = 1e-8;
        let mut stats = Stats::new();
        let report = solve_generated(&SingleProcessComm, &config, Some(&mut stats)).unwrap();
        assert!(report.converged());
        assert_eq!(stats.phases().len(), 2);

        let a = DenseMatrix::reference(8);
        let b = crate::problem::reference_rhs(8);
        let ax = a.mat_vec(&report.x);
        for (l, r) in ax.iter().zip(&b) {
            assert_abs_diff_eq!(l, r, epsilon = 1e-5);
        }
    }
}
