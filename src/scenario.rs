/*!
A synthetic self-consistency scenario: observed data is generated by the
forward model itself at known transmission rates, so a calibration run can be
checked against the truth.
*/

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::forward::{ForwardModel, InitialState, Trajectory};
use crate::likelihood::{ParameterMapping, PoissonLikelihood};
use crate::sir::{AgeStructuredSir, N_GROUPS};

/// Known-truth setup for the three-group SIR model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// True transmission rate of each group.
    pub true_betas: Vec<f64>,
    pub recovery_rate: f64,
    /// Initially susceptible individuals per group.
    pub susceptible: Vec<f64>,
    /// Initially infected individuals per group.
    pub infected: Vec<f64>,
    /// Observation times.
    pub time_grid: Vec<f64>,
    /// RK4 sub-steps per grid interval.
    pub substeps: usize,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            true_betas: vec![0.4, 0.3, 0.25],
            recovery_rate: 0.1,
            susceptible: vec![198.0; N_GROUPS],
            infected: vec![2.0; N_GROUPS],
            time_grid: (0..=30).map(|t| 2.0 * t as f64).collect(),
            substeps: 10,
        }
    }
}

impl Scenario {
    pub fn model(&self) -> AgeStructuredSir {
        AgeStructuredSir::new(self.substeps)
    }

    pub fn initial_state(&self) -> InitialState {
        AgeStructuredSir::initial_state(&self.susceptible, &self.infected)
    }

    fn check(&self) -> Result<()> {
        for (name, v) in [
            ("true_betas", &self.true_betas),
            ("susceptible", &self.susceptible),
            ("infected", &self.infected),
        ] {
            if v.len() != N_GROUPS {
                return Err(CalibrationError::InvalidConfig(format!(
                    "{name} needs {N_GROUPS} values, got {}",
                    v.len()
                )));
            }
        }
        Ok(())
    }

    /// Simulates the observed table at the true parameters.
    pub fn observed(&self) -> Result<Trajectory> {
        self.check()?;
        let params = AgeStructuredSir::parameters(&self.true_betas, self.recovery_rate);
        self.model()
            .integrate(&params, &self.initial_state(), &self.time_grid)
    }

    /// Likelihood evaluator over the scenario's observed data.
    pub fn likelihood(&self, mapping: ParameterMapping) -> Result<PoissonLikelihood<AgeStructuredSir>> {
        PoissonLikelihood::new(
            self.model(),
            self.observed()?,
            self.initial_state(),
            self.recovery_rate,
            N_GROUPS,
            mapping,
        )
    }

    /// The true parameter vector in the sampler's coordinates. A shared
    /// mapping reports the mean of the group rates.
    pub fn truth(&self, mapping: ParameterMapping) -> Vec<f64> {
        match mapping {
            ParameterMapping::PerGroup => self.true_betas.clone(),
            ParameterMapping::Shared => {
                let n = self.true_betas.len().max(1) as f64;
                vec![self.true_betas.iter().sum::<f64>() / n]
            }
        }
    }

    /// Names of the sampled parameters.
    pub fn parameter_names(mapping: ParameterMapping) -> Vec<String> {
        match mapping {
            ParameterMapping::PerGroup => (0..N_GROUPS).map(AgeStructuredSir::beta_name).collect(),
            ParameterMapping::Shared => vec!["beta".to_string()],
        }
    }
}
