/*!
Unnormalized posterior log-density of the transmission parameters: a Poisson
count model for every compartment and time point plus a Beta(2, 2) prior on
every free parameter.

Two sentinel values keep the evaluator total:

- [`REJECTED_LOG_DENSITY`] is returned for parameters the model cannot be run
  at (non-positive or non-finite components, zero prior density, failed
  integration). It is smaller than any finite log-density the evaluator can
  otherwise produce, so a proposal carrying it is never preferred.
- [`DEGENERATE_RATE_PENALTY`] replaces the contribution of a single cell whose
  simulated rate is non-positive or non-finite. It is finite, so a sum of
  penalties still ranks above [`REJECTED_LOG_DENSITY`].
*/

use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::distributions::{poisson_log_pmf, Beta, Target};
use crate::error::{CalibrationError, Result};
use crate::forward::{check_same_grid, ForwardModel, InitialState, ModelParameters, Trajectory};
use crate::sir::AgeStructuredSir;

/// Log-density assigned to proposals that must be rejected without evaluation.
pub const REJECTED_LOG_DENSITY: f64 = f64::MIN;

/// Log-likelihood contribution of a cell with a non-positive simulated rate.
pub const DEGENERATE_RATE_PENALTY: f64 = -1e6;

/// How the sampled parameter vector maps onto per-group transmission rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterMapping {
    /// One scalar shared by every group.
    Shared,
    /// One free parameter per group.
    #[default]
    PerGroup,
}

impl ParameterMapping {
    /// Number of free parameters for a model with `n_groups` groups.
    pub fn n_params(&self, n_groups: usize) -> usize {
        match self {
            ParameterMapping::Shared => 1,
            ParameterMapping::PerGroup => n_groups,
        }
    }

    /// Expands `theta` into one transmission rate per group, or `None` if
    /// `theta` has the wrong length.
    pub fn transmission_rates(&self, theta: &[f64], n_groups: usize) -> Option<Vec<f64>> {
        if theta.len() != self.n_params(n_groups) {
            return None;
        }
        Some(match self {
            ParameterMapping::Shared => vec![theta[0]; n_groups],
            ParameterMapping::PerGroup => theta.to_vec(),
        })
    }
}

/// Sum of Poisson log-pmfs of `counts` under `rates`, cell by cell.
pub fn poisson_log_likelihood(counts: &Array2<f64>, rates: &Array2<f64>) -> f64 {
    Zip::from(counts)
        .and(rates)
        .fold(0.0, |acc, &k, &rate| {
            acc + poisson_log_pmf(k, rate).unwrap_or(DEGENERATE_RATE_PENALTY)
        })
}

/**
Posterior log-density of the transmission parameters given observed counts.

Observed values are rounded up to whole counts once, at construction.

# Examples

```rust
use sir_calibrate::forward::ForwardModel;
use sir_calibrate::likelihood::{ParameterMapping, PoissonLikelihood, REJECTED_LOG_DENSITY};
use sir_calibrate::sir::{AgeStructuredSir, N_GROUPS};

let model = AgeStructuredSir::default();
let init = AgeStructuredSir::initial_state(&[198.0; 3], &[2.0; 3]);
let grid: Vec<f64> = (0..=20).map(|t| t as f64).collect();
let truth = AgeStructuredSir::parameters(&[0.4, 0.3, 0.25], 0.1);
let observed = model.integrate(&truth, &init, &grid).unwrap();

let lik = PoissonLikelihood::new(model, observed, init, 0.1, N_GROUPS, ParameterMapping::PerGroup)
    .unwrap();
assert!(lik.evaluate(&[0.4, 0.3, 0.25]) > lik.evaluate(&[0.2, 0.3, 0.25]));
assert_eq!(lik.evaluate(&[-0.1, 0.3, 0.25]), REJECTED_LOG_DENSITY);
```
*/
#[derive(Debug, Clone)]
pub struct PoissonLikelihood<M> {
    model: M,
    counts: Array2<f64>,
    initial_state: InitialState,
    time_grid: Vec<f64>,
    recovery_rate: f64,
    n_groups: usize,
    mapping: ParameterMapping,
    prior: Beta,
}

impl<M: ForwardModel> PoissonLikelihood<M> {
    /// Builds the evaluator; `observed` must list its compartments in the same
    /// order as `initial_state`.
    pub fn new(
        model: M,
        observed: Trajectory,
        initial_state: InitialState,
        recovery_rate: f64,
        n_groups: usize,
        mapping: ParameterMapping,
    ) -> Result<Self> {
        let names: Vec<&String> = initial_state.keys().collect();
        if observed.compartments().iter().collect::<Vec<_>>() != names {
            return Err(CalibrationError::ShapeMismatch(format!(
                "observed compartments {:?} do not match initial state {:?}",
                observed.compartments(),
                names
            )));
        }
        if observed.n_times() == 0 {
            return Err(CalibrationError::InsufficientData(
                "observed data has no time points".to_string(),
            ));
        }
        let counts = observed.values().mapv(f64::ceil);
        Ok(Self {
            model,
            counts,
            initial_state,
            time_grid: observed.times().to_vec(),
            recovery_rate,
            n_groups,
            mapping,
            prior: Beta::default(),
        })
    }

    /// Replaces the default Beta(2, 2) prior.
    pub fn set_prior(mut self, prior: Beta) -> Self {
        self.prior = prior;
        self
    }

    pub fn mapping(&self) -> ParameterMapping {
        self.mapping
    }

    /// Dimension of the parameter vector the sampler explores.
    pub fn n_params(&self) -> usize {
        self.mapping.n_params(self.n_groups)
    }

    pub fn time_grid(&self) -> &[f64] {
        &self.time_grid
    }

    /// Observed values after rounding up to whole counts.
    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }

    /// Forward-model parameter map for `theta`, or `None` for a wrong length.
    pub fn model_parameters(&self, theta: &[f64]) -> Option<ModelParameters> {
        let betas = self.mapping.transmission_rates(theta, self.n_groups)?;
        Some(AgeStructuredSir::parameters(&betas, self.recovery_rate))
    }

    /// Simulates the model at `theta` over the observed time grid.
    pub fn simulate(&self, theta: &[f64]) -> Result<Trajectory> {
        let params = self.model_parameters(theta).ok_or_else(|| {
            CalibrationError::ShapeMismatch(format!(
                "expected {} parameters, got {}",
                self.n_params(),
                theta.len()
            ))
        })?;
        let simulated = self
            .model
            .integrate(&params, &self.initial_state, &self.time_grid)?;
        check_same_grid(simulated.times(), &self.time_grid)?;
        Ok(simulated)
    }

    /// Unnormalized log-posterior at `theta`. Never panics; see the module
    /// docs for the two sentinel values.
    pub fn evaluate(&self, theta: &[f64]) -> f64 {
        if theta.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
            return REJECTED_LOG_DENSITY;
        }
        let log_prior: f64 = theta.iter().map(|&p| self.prior.log_prob(p)).sum();
        if !log_prior.is_finite() {
            return REJECTED_LOG_DENSITY;
        }
        let simulated = match self.simulate(theta) {
            Ok(s) => s,
            Err(e) => {
                debug!("rejecting {theta:?}: {e}");
                return REJECTED_LOG_DENSITY;
            }
        };
        if simulated.values().dim() != self.counts.dim() {
            return REJECTED_LOG_DENSITY;
        }
        poisson_log_likelihood(&self.counts, simulated.values()) + log_prior
    }

    /// Log-density obtained if every simulated rate equalled its observed
    /// count and every parameter sat at the prior mode. No parameter can
    /// exceed it.
    pub fn upper_bound(&self) -> f64 {
        poisson_log_likelihood(&self.counts, &self.counts)
            + self.n_params() as f64 * self.prior.max_log_prob()
    }
}

impl<M: ForwardModel> Target for PoissonLikelihood<M> {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        self.evaluate(theta)
    }

    fn dim(&self) -> Option<usize> {
        Some(self.n_params())
    }
}
