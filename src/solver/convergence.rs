//! Relative residual test `‖A·x − b‖ / ‖b‖ < ε`.
//!
//! The residual of the candidate is recomputed from scratch with the same
//! multiply, subtract and all-gather sequence as the step, so every worker
//! evaluates the ratio on identical data and reaches the same verdict.

use crate::config::BlockIndexing;
use crate::error::Result;

use super::comm::CommunicationBackend;
use super::partition::Layout;
use super::residual::{compute_residual, norm};

/// Outcome of one convergence test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceCheck {
    pub ratio: f64,
    pub converged: bool,
}

/// Relative residual norm of `x_candidate`.
///
/// `b_norm` is `‖b‖₂`, computed once per run. A zero `b_norm` yields the
/// absolute residual norm instead.
pub fn residual_ratio(
    comm: &dyn CommunicationBackend,
    layout: &Layout,
    local_rows: &[f64],
    x_candidate: &[f64],
    b: &[f64],
    b_norm: f64,
    indexing: BlockIndexing,
) -> Result<f64> {
    let residual = compute_residual(comm, layout, local_rows, x_candidate, b, indexing)?;
    let r_norm = norm(&residual);
    Ok(if b_norm > 0.0 { r_norm / b_norm } else { r_norm })
}

/// Test whether `x_candidate` satisfies the relative tolerance `epsilon`.
#[allow(clippy::too_many_arguments)]
pub fn is_converged(
    comm: &dyn CommunicationBackend,
    layout: &Layout,
    local_rows: &[f64],
    x_candidate: &[f64],
    b: &[f64],
    b_norm: f64,
    epsilon: f64,
    indexing: BlockIndexing,
) -> Result<ConvergenceCheck> {
    let _span = tracing::debug_span!("is_converged", rank = comm.rank()).entered();
    let ratio = residual_ratio(comm, layout, local_rows, x_candidate, b, b_norm, indexing)?;
    Ok(ConvergenceCheck {
        ratio,
        converged: ratio < epsilon,
    })
}
