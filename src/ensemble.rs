/*!
Runs several independent adaptive Metropolis chains in parallel and pools
their post-burn-in samples.

Each chain gets its own sampler, generator, proposal scale and sample buffer;
the target is only ever read. Chain `i` is seeded with `config.seed + i`, so a
whole ensemble run is reproducible from one number.

# Examples

```rust
use sir_calibrate::config::SamplerConfig;
use sir_calibrate::distributions::Target;
use sir_calibrate::ensemble::{pool, ChainEnsemble};

struct Gamma2;

impl Target for Gamma2 {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        theta[0].ln() - theta[0]
    }

    fn dim(&self) -> Option<usize> {
        Some(1)
    }
}

let config = SamplerConfig::default().set_iterations(500, 100);
let ensemble = ChainEnsemble::new(Gamma2, config).unwrap();
let chains = ensemble.run().unwrap();
let samples = pool(&chains, 100).unwrap();
assert_eq!(samples.per_chain().len(), 3);
assert_eq!(samples.pooled().nrows(), 1200);
```
*/

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::config::SamplerConfig;
use crate::distributions::Target;
use crate::error::{CalibrationError, Result};
use crate::sampler::{AdaptiveMetropolis, CancelToken, Chain};

/// A set of chains sharing one target and one configuration.
#[derive(Debug, Clone)]
pub struct ChainEnsemble<T> {
    target: T,
    config: SamplerConfig,
    n_params: usize,
    cancel: Option<CancelToken>,
}

impl<T: Target + Sync> ChainEnsemble<T> {
    /// Validates `config` and prepares an ensemble over `target`, which must
    /// report its dimension through [`Target::dim`].
    pub fn new(target: T, config: SamplerConfig) -> Result<Self> {
        let n_params = target.dim().ok_or_else(|| {
            CalibrationError::InvalidConfig(
                "target has no fixed dimension; use ChainEnsemble::with_dim".to_string(),
            )
        })?;
        Self::with_dim(target, n_params, config)
    }

    /// Like [`Self::new`] with an explicit number of free parameters.
    pub fn with_dim(target: T, n_params: usize, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        if n_params == 0 {
            return Err(CalibrationError::InvalidConfig(
                "ensemble needs at least one free parameter".to_string(),
            ));
        }
        if let Some(d) = target.dim().filter(|&d| d != n_params) {
            return Err(CalibrationError::ShapeMismatch(format!(
                "target has {d} parameters, ensemble was asked for {n_params}"
            )));
        }
        Ok(Self {
            target,
            config,
            n_params,
            cancel: None,
        })
    }

    /// Shares `token` with every chain; firing it stops all of them.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    fn sampler(&self, i: usize) -> AdaptiveMetropolis<&T> {
        let sampler = AdaptiveMetropolis::new(&self.target)
            .set_seed(self.config.seed.wrapping_add(i as u64))
            .set_warmup(self.config.warmup);
        match &self.cancel {
            Some(token) => sampler.with_cancel(token.clone()),
            None => sampler,
        }
    }

    /// Starting point of chain `i`: its seed value broadcast to every parameter.
    fn start(&self, i: usize) -> Vec<f64> {
        vec![self.config.seed_parameters[i]; self.n_params]
    }

    fn run_chain(&self, i: usize, pb: Option<&ProgressBar>) -> Result<Chain> {
        let mut sampler = self.sampler(i);
        let start = self.start(i);
        let sd = self.config.initial_proposal_sd[i];
        let c = &self.config;
        match pb {
            Some(pb) => sampler.run_with_progress(
                &start,
                c.n_iterations,
                sd,
                c.target_accept_rate,
                c.adapt_rate,
                pb,
            ),
            None => sampler.run(
                &start,
                c.n_iterations,
                sd,
                c.target_accept_rate,
                c.adapt_rate,
            ),
        }
    }

    /**
    Runs every chain to completion in parallel.

    # Returns

    One [`Chain`] of `n_iterations` samples per configured seed, in seed order.
    The first chain error (e.g. cancellation) is returned instead.
    */
    pub fn run(&self) -> Result<Vec<Chain>> {
        info!(
            "running {} chains x {} iterations ({} parameters)",
            self.config.n_chains, self.config.n_iterations, self.n_params
        );
        let chains = (0..self.config.n_chains)
            .into_par_iter()
            .map(|i| self.run_chain(i, None))
            .collect::<Result<Vec<_>>>()?;
        log_acceptance(&chains);
        Ok(chains)
    }

    /// Same as [`Self::run`], drawing one progress bar per chain.
    pub fn run_with_progress(&self) -> Result<Vec<Chain>> {
        info!(
            "running {} chains x {} iterations ({} parameters)",
            self.config.n_chains, self.config.n_iterations, self.n_params
        );
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        let chains = (0..self.config.n_chains)
            .into_par_iter()
            .map(|i| {
                let pb = multi.add(ProgressBar::new(self.config.n_iterations as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());
                let chain = self.run_chain(i, Some(&pb));
                match &chain {
                    Ok(_) => pb.finish_with_message("Done!"),
                    Err(e) => pb.abandon_with_message(e.to_string()),
                }
                chain
            })
            .collect::<Result<Vec<_>>>()?;
        log_acceptance(&chains);
        Ok(chains)
    }

    /// Runs the ensemble and pools it with the configured burn-in.
    pub fn sample(&self) -> Result<SampleSet> {
        let chains = self.run()?;
        pool(&chains, self.config.burnin)
    }
}

fn log_acceptance(chains: &[Chain]) {
    for (i, chain) in chains.iter().enumerate() {
        info!(
            "chain {i} (seed {}): acceptance {:.3}, final sd {:.3e}",
            chain.seed(),
            chain.acceptance_rate(),
            chain.final_proposal_sd()
        );
    }
}

/// Post-burn-in samples of every chain of an ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    chains: Vec<Array2<f64>>,
    burnin: usize,
}

impl SampleSet {
    /// Wraps per-chain sample matrices that already have burn-in removed.
    pub fn from_chains(chains: Vec<Array2<f64>>, burnin: usize) -> Result<Self> {
        let first = chains
            .first()
            .ok_or(CalibrationError::InsufficientChains(0))?;
        let dim = first.dim();
        if dim.0 == 0 {
            return Err(CalibrationError::InsufficientData(
                "chains hold no samples".to_string(),
            ));
        }
        if let Some(other) = chains.iter().find(|c| c.dim() != dim) {
            return Err(CalibrationError::ShapeMismatch(format!(
                "chains have shapes {:?} and {:?}",
                dim,
                other.dim()
            )));
        }
        Ok(Self { chains, burnin })
    }

    pub fn per_chain(&self) -> &[Array2<f64>] {
        &self.chains
    }

    /// Per-chain views, as taken by the diagnostics.
    pub fn views(&self) -> Vec<ArrayView2<'_, f64>> {
        self.chains.iter().map(|c| c.view()).collect()
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Samples kept per chain.
    pub fn n_samples(&self) -> usize {
        self.chains[0].nrows()
    }

    pub fn n_params(&self) -> usize {
        self.chains[0].ncols()
    }

    pub fn burnin(&self) -> usize {
        self.burnin
    }

    /// All chains stacked row-wise into one `(chains * samples) x params` matrix.
    pub fn pooled(&self) -> Array2<f64> {
        let views = self.views();
        concatenate(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, self.n_params())))
    }

    /// Pooled samples of one parameter.
    pub fn pooled_column(&self, param: usize) -> Array1<f64> {
        self.chains
            .iter()
            .flat_map(|c| c.index_axis(Axis(1), param).to_vec())
            .collect()
    }

    /// Samples of one parameter from one chain.
    pub fn chain_column(&self, chain: usize, param: usize) -> ArrayView1<'_, f64> {
        self.chains[chain].index_axis(Axis(1), param)
    }

    /// Pooled posterior mean of every parameter.
    pub fn means(&self) -> Array1<f64> {
        let pooled = self.pooled();
        pooled
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::from_elem(self.n_params(), f64::NAN))
    }

    /// Pooled posterior standard deviation (denominator `N - 1`) of every parameter.
    pub fn std_devs(&self) -> Array1<f64> {
        let pooled = self.pooled();
        let ddof = if pooled.nrows() > 1 { 1.0 } else { 0.0 };
        pooled.std_axis(Axis(0), ddof)
    }
}

/**
Discards the first `burnin` samples of every chain and collects the rest.

# Errors

* [`CalibrationError::InsufficientChains`] for an empty ensemble.
* [`CalibrationError::ShapeMismatch`] if chains differ in length or dimension.
* [`CalibrationError::InsufficientData`] if `burnin` is not smaller than the
  chain length.
*/
pub fn pool(chains: &[Chain], burnin: usize) -> Result<SampleSet> {
    let first = chains
        .first()
        .ok_or(CalibrationError::InsufficientChains(0))?;
    let shape = (first.len(), first.n_params());
    if let Some(other) = chains.iter().find(|c| (c.len(), c.n_params()) != shape) {
        return Err(CalibrationError::ShapeMismatch(format!(
            "chain of {} x {} cannot be pooled with chains of {} x {}",
            other.len(),
            other.n_params(),
            shape.0,
            shape.1
        )));
    }
    let kept = chains
        .iter()
        .map(|c| c.post_burnin(burnin).map(|v| v.to_owned()))
        .collect::<Result<Vec<_>>>()?;
    info!(
        "pooled {} chains: {} samples each after discarding {}",
        kept.len(),
        shape.0 - burnin,
        burnin
    );
    SampleSet::from_chains(kept, burnin)
}
