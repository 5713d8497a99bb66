//! Minimal-residual step size and iterate update.
//!
//! `t = (A·y, y) / (A·y, A·y)` minimizes `‖A·(x − t·y) − b‖` along the
//! residual direction `y`. Each worker contributes partial dot products over
//! its rows; the root sums them, forms `t` and broadcasts it together with a
//! status flag so a zero denominator fails on every rank at once.

use crate::config::BlockIndexing;
use crate::error::{DmresError, Result};

use super::comm::CommunicationBackend;
use super::partition::Layout;
use super::residual::{check_local_shapes, local_mat_vec};

const STATUS_OK: f64 = 0.0;
const STATUS_DEGENERATE: f64 = 1.0;

/// Partial dot products of one worker's rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContribution {
    /// Local part of `(A·y, y)`.
    pub numer: f64,
    /// Local part of `(A·y, A·y)`.
    pub denom: f64,
}

/// Local contribution to the step formula for the rows this worker owns.
pub fn local_step_contribution(
    layout: &Layout,
    rank: usize,
    local_rows: &[f64],
    y: &[f64],
    indexing: BlockIndexing,
) -> StepContribution {
    let base = indexing.block_start(layout, rank);
    let ay = local_mat_vec(local_rows, layout.n(), y);
    let denom = ay.iter().map(|v| v * v).sum();
    let numer = ay.iter().enumerate().map(|(r, v)| y[base + r] * v).sum();
    StepContribution { numer, denom }
}

/// Compute the step size `t`, replicated on every worker.
///
/// Returns `DmresError::Degenerate` on all ranks when `(A·y, A·y)` is zero,
/// either reduced sum overflows, or the quotient is not finite.
pub fn compute_step(
    comm: &dyn CommunicationBackend,
    layout: &Layout,
    local_rows: &[f64],
    y: &[f64],
    indexing: BlockIndexing,
) -> Result<f64> {
    let rank = comm.rank();
    let _span = tracing::debug_span!("compute_step", rank).entered();
    check_local_shapes(layout, rank, local_rows, &[("y", y)])?;

    let local = local_step_contribution(layout, rank, local_rows, y, indexing);

    let denoms = comm.gather_to_root(local.denom);
    let numers = comm.gather_to_root(local.numer);

    let mut message = [0.0, STATUS_OK];
    if let (Some(denoms), Some(numers)) = (denoms, numers) {
        let denom: f64 = denoms.iter().sum();
        let numer: f64 = numers.iter().sum();
        let t = numer / denom;
        let usable = denom != 0.0 && denom.is_finite() && numer.is_finite() && t.is_finite();
        message = if !usable {
            tracing::warn!(numer, denom, "step denominator vanished");
            [denom, STATUS_DEGENERATE]
        } else {
            [t, STATUS_OK]
        };
    }
    comm.broadcast(&mut message);

    if message[1] == STATUS_DEGENERATE {
        return Err(DmresError::Degenerate(format!(
            "(A·y, A·y) = {:e}, no progress possible along the residual",
            message[0]
        )));
    }
    Ok(message[0])
}

/// Form the next iterate `x − t·y`, replicated on every worker.
///
/// Each worker updates the slice for its own rows and the slices are
/// all-gathered into a new vector; `x` itself is left untouched.
pub fn update_iterate(
    comm: &dyn CommunicationBackend,
    layout: &Layout,
    x: &[f64],
    y: &[f64],
    t: f64,
    indexing: BlockIndexing,
) -> Result<Vec<f64>> {
    let rank = comm.rank();
    let _span = tracing::debug_span!("update_iterate", rank).entered();
    if x.len() != layout.n() || y.len() != layout.n() {
        return Err(DmresError::Dimension(format!(
            "iterate update needs vectors of length {}, got x={} y={}",
            layout.n(),
            x.len(),
            y.len()
        )));
    }

    let base = indexing.block_start(layout, rank);
    let local_x: Vec<f64> = (base..base + layout.local_rows(rank))
        .map(|i| x[i] - t * y[i])
        .collect();

    let mut x_next = vec![0.0; layout.n()];
    comm.all_gather_varcount(&local_x, layout.vector(), &mut x_next);
    Ok(x_next)
}
