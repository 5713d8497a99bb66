use clap::{Parser, ValueEnum};
use dmres::config::{BlockIndexing, RunConfig};
use dmres::error::{DmresError, Result};
use dmres::output;
use dmres::solver::comm::{CommunicationBackend, SingleProcessComm};
use dmres::solver::comm_thread::run_group;
use dmres::solver::{solve_generated, SolveReport};
use dmres::stats::Stats;
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dmres=info";

/// Distributed minimal-residual solver for dense linear systems
#[derive(Parser)]
#[command(name = "dmres", version)]
struct Cli {
    /// TOML run configuration; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// System dimension N (matrix is N x N)
    #[arg(long)]
    size: Option<usize>,

    /// Relative residual tolerance
    #[arg(long)]
    tolerance: Option<f64>,

    /// Iteration cap
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Block indexing into replicated vectors
    #[arg(long, value_enum)]
    indexing: Option<BlockIndexing>,

    /// Number of in-process worker threads
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Run as one rank of an MPI job (launch with mpirun)
    #[cfg(feature = "distributed")]
    #[arg(long)]
    mpi: bool,

    /// What to write to stdout
    #[arg(long, value_enum, default_value_t = OutputKind::None)]
    output: OutputKind,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputKind {
    Solution,
    History,
    None,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(size) = self.size {
            config.problem.size = size;
        }
        if let Some(tolerance) = self.tolerance {
            config.solver.tolerance = tolerance;
        }
        if let Some(max_iterations) = self.max_iterations {
            config.solver.max_iterations = max_iterations;
        }
        if let Some(indexing) = self.indexing {
            config.solver.indexing = indexing;
        }
        if self.workers == 0 {
            return Err(DmresError::Config("--workers must be at least 1".into()));
        }
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "distributed")]
    fn use_mpi(&self) -> bool {
        self.mpi
    }

    #[cfg(not(feature = "distributed"))]
    fn use_mpi(&self) -> bool {
        false
    }
}

/// Body run by every rank. Only the root collects stats and reports.
fn run_rank(comm: &dyn CommunicationBackend, config: &RunConfig, cli: &Cli) -> Result<Option<SolveReport>> {
    let started = Instant::now();
    let mut stats = (cli.stats && comm.is_root()).then(Stats::new);
    let report = solve_generated(comm, config, stats.as_mut())?;

    if !comm.is_root() {
        return Ok(None);
    }

    eprintln!("{}", output::summary(&report));
    eprintln!("Time taken: {:.6} sec.", started.elapsed().as_secs_f64());

    let mut stdout = io::stdout();
    match cli.output {
        OutputKind::Solution => output::write_solution_csv(&report, &mut stdout)?,
        OutputKind::History => output::write_history_csv(&report, &mut stdout)?,
        OutputKind::None => {}
    }

    if let Some(ref stats) = stats {
        stats.display();
    }
    Ok(Some(report))
}

#[cfg(feature = "distributed")]
fn run_mpi(config: &RunConfig, cli: &Cli) -> Result<Option<SolveReport>> {
    use dmres::solver::comm_mpi::MpiComm;

    let Some(_universe) = mpi::initialize() else {
        eprintln!("MPI initialization failed");
        std::process::exit(1);
    };
    run_rank(&MpiComm::new(), config, cli)
}

#[cfg(not(feature = "distributed"))]
fn run_mpi(_config: &RunConfig, _cli: &Cli) -> Result<Option<SolveReport>> {
    unreachable!("--mpi requires the `distributed` feature")
}

/// `RUST_LOG` when set and parseable, otherwise per-iteration progress.
fn env_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let config = cli.run_config().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    });

    let result = if cli.use_mpi() {
        run_mpi(&config, &cli)
    } else if cli.workers == 1 {
        run_rank(&SingleProcessComm, &config, &cli)
    } else {
        let mut results = run_group(cli.workers, |comm| run_rank(comm, &config, &cli));
        results.swap_remove(0)
    };

    match result {
        Ok(Some(report)) if !report.converged() => std::process::exit(2),
        Ok(_) => {}
        Err(e) => {
            eprintln!("Solve error: {}", e);
            std::process::exit(1);
        }
    }
}
