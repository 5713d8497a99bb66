//! Results output formatting (CSV).

use crate::error::Result;
use crate::solver::SolveReport;
use std::io::Write;

/// Write the solution vector as CSV.
///
/// Format:
/// ```csv
/// Index,Value
/// 0,0.0
/// 1,1.0
/// ```
pub fn write_solution_csv<W: Write>(report: &SolveReport, writer: &mut W) -> Result<()> {
    writeln!(writer, "Index,Value")?;
    for (i, value) in report.x.iter().enumerate() {
        writeln!(writer, "{},{}", i, value)?;
    }
    Ok(())
}

/// Write the residual ratio after each iteration as CSV.
///
/// Format:
/// ```csv
/// Iteration,ResidualRatio
/// 1,0.25
/// 2,0.0625
/// ```
pub fn write_history_csv<W: Write>(report: &SolveReport, writer: &mut W) -> Result<()> {
    writeln!(writer, "Iteration,ResidualRatio")?;
    for (i, ratio) in report.history.iter().enumerate() {
        writeln!(writer, "{},{}", i + 1, ratio)?;
    }
    Ok(())
}

/// One-line human summary of a finished solve.
pub fn summary(report: &SolveReport) -> String {
    format!(
        "outcome={} iterations={} residual_ratio={:e}",
        report.outcome, report.iterations, report.residual_ratio
    )
}
