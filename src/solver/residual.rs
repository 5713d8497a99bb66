//! Distributed residual `y = A·x − b`.
//!
//! Each worker multiplies its block of rows by the replicated iterate,
//! subtracts its slice of `b`, and the slices are all-gathered so every
//! worker ends with the same full residual.

use crate::config::BlockIndexing;
use crate::error::{DmresError, Result};

use super::comm::CommunicationBackend;
use super::partition::Layout;

/// Multiply a block of consecutive rows (row-major, `n` columns) by `v`,
/// one dot product per row.
pub fn local_mat_vec(local_rows: &[f64], n: usize, v: &[f64]) -> Vec<f64> {
    local_rows
        .chunks_exact(n)
        .map(|row| row.iter().zip(v).map(|(a, x)| a * x).sum())
        .collect()
}

/// Euclidean norm.
pub fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Check that this worker's buffers match the layout.
pub(crate) fn check_local_shapes(
    layout: &Layout,
    rank: usize,
    local_rows: &[f64],
    vectors: &[(&str, &[f64])],
) -> Result<()> {
    let expected = layout.rows().len_of(rank);
    if local_rows.len() != expected {
        return Err(DmresError::Dimension(format!(
            "rank {rank} holds {} matrix elements, layout assigns {expected}",
            local_rows.len()
        )));
    }
    for (name, v) in vectors {
        if v.len() != layout.n() {
            return Err(DmresError::Dimension(format!(
                "{name} has length {}, system size is {}",
                v.len(),
                layout.n()
            )));
        }
    }
    Ok(())
}

/// Compute the global residual `A·x − b`, replicated on every worker.
pub fn compute_residual(
    comm: &dyn CommunicationBackend,
    layout: &Layout,
    local_rows: &[f64],
    x: &[f64],
    b: &[f64],
    indexing: BlockIndexing,
) -> Result<Vec<f64>> {
    let rank = comm.rank();
    let _span = tracing::debug_span!("compute_residual", rank).entered();
    check_local_shapes(layout, rank, local_rows, &[("x", x), ("b", b)])?;

    let base = indexing.block_start(layout, rank);
    let mut local_y = local_mat_vec(local_rows, layout.n(), x);
    for (r, y) in local_y.iter_mut().enumerate() {
        *y -= b[base + r];
    }

    let mut y = vec![0.0; layout.n()];
    comm.all_gather_varcount(&local_y, layout.vector(), &mut y);
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::DenseMatrix;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_thread::run_group;
    use approx::assert_abs_diff_eq;

    #[test]
    fn local_mat_vec_one_dot_per_row() {
        let rows = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(local_mat_vec(&rows, 3, &[1.0, 0.0, -1.0]), vec![-2.0, -2.0]);
    }

    #[test]
    fn zero_iterate_gives_negated_rhs() {
        let a = DenseMatrix::reference(3);
        let layout = Layout::new(1, 3).unwrap();
        let b = [1.0, 2.0, 3.0];
        let y = compute_residual(
            &SingleProcessComm,
            &layout,
            a.data(),
            &[0.0; 3],
            &b,
            BlockIndexing::Global,
        )
        .unwrap();
        assert_eq!(y, vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn matches_direct_product_single_worker() {
        let a = DenseMatrix::reference(3);
        let layout = Layout::new(1, 3).unwrap();
        let x = [1.0, -1.0, 2.0];
        let b = [0.5, 0.5, 0.5];
        let y = compute_residual(&SingleProcessComm, &layout, a.data(), &x, &b, BlockIndexing::Global)
            .unwrap();
        let ax = a.mat_vec(&x);
        for i in 0..3 {
            assert_abs_diff_eq!(y[i], ax[i] - b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn split_rows_assemble_full_residual() {
        let n = 5;
        let a = DenseMatrix::from_fn(n, |i, j| (i * n + j) as f64 * 0.1 + if i == j { 3.0 } else { 0.0 });
        let x: Vec<f64> = (0..n).map(|i| i as f64 - 2.0).collect();
        let b: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).collect();
        let expected: Vec<f64> = a.mat_vec(&x).iter().zip(&b).map(|(ax, bi)| ax - bi).collect();

        for workers in [2, 3, 5] {
            let layout = Layout::new(workers, n).unwrap();
            let results = run_group(workers, |comm| {
                let local = &a.data()[layout.rows().range_of(comm.rank())];
                compute_residual(comm, &layout, local, &x, &b, BlockIndexing::Global).unwrap()
            });
            for y in results {
                for i in 0..n {
                    assert_abs_diff_eq!(y[i], expected[i], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn wrong_block_length_rejected() {
        let layout = Layout::new(1, 3).unwrap();
        let err = compute_residual(
            &SingleProcessComm,
            &layout,
            &[1.0; 4],
            &[0.0; 3],
            &[0.0; 3],
            BlockIndexing::Global,
        )
        .unwrap_err();
        assert!(matches!(err, DmresError::Dimension(_)));
    }

    #[test]
    fn wrong_vector_length_rejected() {
        let layout = Layout::new(1, 2).unwrap();
        let err = compute_residual(
            &SingleProcessComm,
            &layout,
            &[1.0; 4],
            &[0.0; 3],
            &[0.0; 2],
            BlockIndexing::Global,
        )
        .unwrap_err();
        assert!(err.to_string().contains("x has length 3"), "{err}");
    }
}
