//! Calibrates the three-group SIR model against synthetic data generated at
//! known transmission rates and reports convergence diagnostics.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use log::info;

use sir_calibrate::config::SamplerConfig;
use sir_calibrate::diagnostics::{DiagnosticSummary, RHAT_THRESHOLD};
use sir_calibrate::ensemble::{pool, ChainEnsemble, SampleSet};
use sir_calibrate::likelihood::ParameterMapping;
use sir_calibrate::scenario::Scenario;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mapping {
    /// One transmission rate shared by all groups
    Shared,
    /// One transmission rate per group
    PerGroup,
}

impl From<Mapping> for ParameterMapping {
    fn from(m: Mapping) -> Self {
        match m {
            Mapping::Shared => ParameterMapping::Shared,
            Mapping::PerGroup => ParameterMapping::PerGroup,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML file with sampler options; defaults are used when absent
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Base RNG seed (chain i uses seed + i)
    #[arg(long)]
    seed: Option<u64>,

    /// Iterations per chain
    #[arg(long, short = 'n')]
    iterations: Option<usize>,

    /// Samples discarded from the start of each chain
    #[arg(long, short)]
    burnin: Option<usize>,

    /// How sampled values map onto group transmission rates
    #[arg(long, value_enum)]
    mapping: Option<Mapping>,

    /// Draw one progress bar per chain
    #[arg(long, short)]
    progress: bool,

    /// Bins of the printed posterior histograms (0 disables them)
    #[arg(long, default_value_t = 0)]
    bins: usize,

    /// Write post-burn-in samples to this CSV file (needs the `csv` feature)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SamplerConfig::from_toml_file(path)?,
        None => SamplerConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config = config.set_seed(seed);
    }
    if let Some(n) = cli.iterations {
        config.n_iterations = n;
    }
    if let Some(b) = cli.burnin {
        config.burnin = b;
    }
    if let Some(m) = cli.mapping {
        config = config.set_mapping(m.into());
    }

    let scenario = Scenario {
        recovery_rate: config.recovery_rate,
        ..Scenario::default()
    };
    let mapping = config.mapping;
    let likelihood = scenario.likelihood(mapping)?;
    let burnin = config.burnin;
    info!("calibrating against {} time points", likelihood.time_grid().len());

    let ensemble = ChainEnsemble::new(likelihood, config)?;
    let chains = if cli.progress {
        ensemble.run_with_progress()?
    } else {
        ensemble.run()?
    };
    let samples = pool(&chains, burnin)?;
    let summary = DiagnosticSummary::from_sample_set(&samples)?;

    let names = Scenario::parameter_names(mapping);
    let truth = scenario.truth(mapping);
    println!(
        "{} chains x {} samples after burn-in {}",
        summary.n_chains, summary.n_samples, burnin
    );
    println!(
        "{:<8} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "param", "truth", "mean", "sd", "R-hat", "ESS"
    );
    for (j, name) in names.iter().enumerate() {
        println!(
            "{:<8} {:>8.4} {:>8.4} {:>8.4} {:>8.4} {:>10.1}",
            name, truth[j], summary.mean[j], summary.std_dev[j], summary.rhat[j], summary.ess[j]
        );
    }
    for (i, chain) in chains.iter().enumerate() {
        println!(
            "chain {}: acceptance {:.3}, final proposal sd {:.3e}",
            i,
            chain.acceptance_rate(),
            chain.final_proposal_sd()
        );
    }
    if summary.is_converged(RHAT_THRESHOLD) {
        println!("converged (R-hat <= {})", RHAT_THRESHOLD);
    } else {
        println!("not converged (R-hat > {}); run more iterations", RHAT_THRESHOLD);
    }

    if cli.bins > 0 {
        let densities = sir_calibrate::output::posterior_densities(&samples, cli.bins)?;
        for (name, density) in names.iter().zip(&densities) {
            println!("posterior density of {name}:");
            for (x, h) in density.centers.iter().zip(density.density.iter()) {
                println!("  {x:.4} {h:.4}");
            }
        }
    }

    if let Some(path) = &cli.output {
        write_samples(&samples, &names, path)?;
    }

    Ok(())
}

#[cfg(feature = "csv")]
fn write_samples(samples: &SampleSet, names: &[String], path: &Path) -> Result<(), Box<dyn Error>> {
    sir_calibrate::io::csv::save_sample_set(samples, names, path)?;
    info!("wrote samples to {}", path.display());
    Ok(())
}

#[cfg(not(feature = "csv"))]
fn write_samples(_samples: &SampleSet, _names: &[String], path: &Path) -> Result<(), Box<dyn Error>> {
    Err(format!("cannot write {}: built without the `csv` feature", path.display()).into())
}
