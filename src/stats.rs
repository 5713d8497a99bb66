//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

/// Collects phase timings and per-iteration accumulators.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
/// Zero cost when `None`: no timing calls, no counter increments.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub iterations: usize,
    // Per-iteration accumulators
    pub residual: Duration,
    pub step_size: Duration,
    pub update: Duration,
    pub convergence_check: Duration,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            iterations: 0,
            residual: Duration::ZERO,
            step_size: Duration::ZERO,
            update: Duration::ZERO,
            convergence_check: Duration::ZERO,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    /// Wall-clock time since the stats were created.
    pub fn elapsed(&self) -> Duration {
        self.total_start.elapsed()
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.elapsed();
        eprintln!();
        eprintln!("=== dmres Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.iterations > 0 {
            eprintln!("  Iterations:             {}", self.iterations);
            eprintln!("    Residual:             {:>8.3}s", self.residual.as_secs_f64());
            eprintln!("    Step size:            {:>8.3}s", self.step_size.as_secs_f64());
            eprintln!("    Iterate update:       {:>8.3}s", self.update.as_secs_f64());
            eprintln!("    Convergence check:    {:>8.3}s", self.convergence_check.as_secs_f64());
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}
