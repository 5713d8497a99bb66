//! Run configuration, deserialized from TOML and overridable from the CLI.
//!
//! ```toml
//! [problem]
//! size = 4000
//! rhs = "reference"
//!
//! [solver]
//! tolerance = 0.064518
//! max_iterations = 10000
//! indexing = "global"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{DmresError, Result};
use crate::solver::partition::Layout;

/// Which index the local block of a replicated vector starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BlockIndexing {
    /// `offsets[rank] + r`: the worker's first owned row.
    #[default]
    Global,
    /// `rank + r`: legacy indexing kept for comparing against runs of the
    /// older MPI program. Only correct with a single worker.
    RankShifted,
}

impl BlockIndexing {
    /// Index of the first element this rank reads from a replicated vector.
    pub fn block_start(self, layout: &Layout, rank: usize) -> usize {
        match self {
            BlockIndexing::Global => layout.row_offset(rank),
            BlockIndexing::RankShifted => rank,
        }
    }
}

/// Iteration parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Relative residual tolerance `ε`.
    pub tolerance: f64,
    /// Upper bound on iterations before the run is reported exhausted.
    pub max_iterations: usize,
    pub indexing: BlockIndexing,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 10_000,
            indexing: BlockIndexing::Global,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(DmresError::Config(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(DmresError::Config("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

/// Right-hand side of the generated problem.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RhsSpec {
    /// A named generator: `"reference"` or `"ones"`.
    Named(String),
    /// Explicit values, one per row.
    Values(Vec<f64>),
}

impl Default for RhsSpec {
    fn default() -> Self {
        RhsSpec::Named("reference".into())
    }
}

/// Problem generated on the root: the reference matrix of size `size`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProblemConfig {
    pub size: usize,
    pub rhs: RhsSpec,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            size: 4000,
            rhs: RhsSpec::default(),
        }
    }
}

impl ProblemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(DmresError::Config("problem size must be at least 1".into()));
        }
        match &self.rhs {
            RhsSpec::Named(name) if name != "reference" && name != "ones" => Err(
                DmresError::Config(format!("unknown rhs generator '{name}'")),
            ),
            RhsSpec::Values(values) if values.len() != self.size => {
                Err(DmresError::Config(format!(
                    "rhs has {} values, problem size is {}",
                    values.len(),
                    self.size
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub problem: ProblemConfig,
    pub solver: SolverConfig,
}

impl RunConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| DmresError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        self.problem.validate()?;
        self.solver.validate()
    }
}
