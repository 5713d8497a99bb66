//! Dense test problems generated on the root worker.

use crate::config::{ProblemConfig, RhsSpec};
use crate::error::{DmresError, Result};

/// Square dense matrix in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    n: usize,
    data: Vec<f64>,
}

impl DenseMatrix {
    pub fn new(n: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n * n {
            return Err(DmresError::Dimension(format!(
                "{} values cannot fill a {n}x{n} matrix",
                data.len()
            )));
        }
        Ok(Self { n, data })
    }

    pub fn from_fn(n: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let data = (0..n * n).map(|k| f(k / n, k % n)).collect();
        Self { n, data }
    }

    /// 2 on the diagonal, 1 everywhere else. Symmetric positive definite
    /// with eigenvalues 1 and `n + 1`.
    pub fn reference(n: usize) -> Self {
        Self::from_fn(n, |i, j| if i == j { 2.0 } else { 1.0 })
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, |i, j| if i == j { 1.0 } else { 0.0 })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Row-major storage, `n * n` values.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn mat_vec(&self, x: &[f64]) -> Vec<f64> {
        self.data
            .chunks_exact(self.n)
            .map(|row| row.iter().zip(x).map(|(a, v)| a * v).sum())
            .collect()
    }
}

/// Right-hand side paired with the reference matrix:
/// `b[i] = n + (i % 100) * i / n + i % 1000` in integer arithmetic.
pub fn reference_rhs(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| (n + (i % 100) * i / n + i % 1000) as f64)
        .collect()
}

/// Build the configured right-hand side.
pub fn build_rhs(config: &ProblemConfig) -> Result<Vec<f64>> {
    match &config.rhs {
        RhsSpec::Named(name) if name == "reference" => Ok(reference_rhs(config.size)),
        RhsSpec::Named(name) if name == "ones" => Ok(vec![1.0; config.size]),
        RhsSpec::Named(name) => Err(DmresError::Config(format!("unknown rhs generator '{name}'"))),
        RhsSpec::Values(values) if values.len() == config.size => Ok(values.clone()),
        RhsSpec::Values(values) => Err(DmresError::Config(format!(
            "rhs has {} values, problem size is {}",
            values.len(),
            config.size
        ))),
    }
}
