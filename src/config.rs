/*!
Run configuration for an ensemble of adaptive Metropolis chains.

All options have defaults matching a three-chain calibration of the
age-structured SIR model, so an empty TOML document is a valid configuration.

# Examples

```rust
use sir_calibrate::config::SamplerConfig;

let config = SamplerConfig::from_toml_str("n_iterations = 2000\nburnin = 500").unwrap();
assert_eq!(config.n_chains, 3);
assert_eq!(config.burnin, 500);
config.validate().unwrap();
```
*/

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CalibrationError, Result};
use crate::likelihood::ParameterMapping;

/// Recognised options for an ensemble run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Total iterations per chain, including the seed sample at iteration 0.
    pub n_iterations: usize,
    /// Number of independent chains.
    pub n_chains: usize,
    /// Samples discarded from the start of every chain. Must be `< n_iterations`.
    pub burnin: usize,
    /// Initial random-walk standard deviation, one per chain.
    pub initial_proposal_sd: Vec<f64>,
    /// Acceptance rate the proposal scale is steered towards.
    pub target_accept_rate: f64,
    /// Robbins-Monro step size for the log proposal scale.
    pub adapt_rate: f64,
    /// Starting value per chain, broadcast to every free parameter.
    pub seed_parameters: Vec<f64>,
    /// Iterations before proposal adaptation starts.
    pub warmup: usize,
    /// Base RNG seed; chain `i` uses `seed + i`.
    pub seed: u64,
    /// How sampled values map onto the per-group transmission rates.
    pub mapping: ParameterMapping,
    /// Fixed, non-estimated recovery rate.
    pub recovery_rate: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_iterations: 5000,
            n_chains: 3,
            burnin: 1000,
            initial_proposal_sd: vec![0.001; 3],
            target_accept_rate: 0.234,
            adapt_rate: 0.01,
            seed_parameters: vec![0.1, 0.15, 0.2],
            warmup: 100,
            seed: 42,
            mapping: ParameterMapping::PerGroup,
            recovery_rate: 0.1,
        }
    }
}

impl SamplerConfig {
    /// Parses a configuration from TOML; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Sets the base seed; chain `i` will be seeded with `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets iteration count and burn-in together.
    pub fn set_iterations(mut self, n_iterations: usize, burnin: usize) -> Self {
        self.n_iterations = n_iterations;
        self.burnin = burnin;
        self
    }

    /// Replaces the per-chain starting values and resizes the per-chain
    /// proposal scales to match, reusing the first configured scale.
    pub fn set_seed_parameters(mut self, seeds: Vec<f64>) -> Self {
        let sd = self.initial_proposal_sd.first().copied().unwrap_or(0.001);
        self.n_chains = seeds.len();
        self.initial_proposal_sd = vec![sd; seeds.len()];
        self.seed_parameters = seeds;
        self
    }

    pub fn set_mapping(mut self, mapping: ParameterMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Checks every option before any sampling starts.
    pub fn validate(&self) -> Result<()> {
        if self.n_iterations == 0 {
            return Err(CalibrationError::InvalidConfig(
                "n_iterations must be at least 1".to_string(),
            ));
        }
        if self.n_chains == 0 {
            return Err(CalibrationError::InvalidConfig(
                "n_chains must be at least 1".to_string(),
            ));
        }
        if self.burnin >= self.n_iterations {
            return Err(CalibrationError::InvalidConfig(format!(
                "burnin ({}) must be strictly less than n_iterations ({})",
                self.burnin, self.n_iterations
            )));
        }
        if self.seed_parameters.len() != self.n_chains {
            return Err(CalibrationError::InvalidConfig(format!(
                "expected {} seed_parameters, got {}",
                self.n_chains,
                self.seed_parameters.len()
            )));
        }
        if self.initial_proposal_sd.len() != self.n_chains {
            return Err(CalibrationError::InvalidConfig(format!(
                "expected {} initial_proposal_sd values, got {}",
                self.n_chains,
                self.initial_proposal_sd.len()
            )));
        }
        if let Some(s) = self
            .seed_parameters
            .iter()
            .find(|s| !s.is_finite() || **s <= 0.0)
        {
            return Err(CalibrationError::InvalidConfig(format!(
                "seed parameters must be strictly positive, got {s}"
            )));
        }
        if let Some(sd) = self
            .initial_proposal_sd
            .iter()
            .find(|sd| !sd.is_finite() || **sd <= 0.0)
        {
            return Err(CalibrationError::InvalidConfig(format!(
                "initial_proposal_sd must be strictly positive, got {sd}"
            )));
        }
        if !(self.target_accept_rate > 0.0 && self.target_accept_rate < 1.0) {
            return Err(CalibrationError::InvalidConfig(format!(
                "target_accept_rate must lie in (0, 1), got {}",
                self.target_accept_rate
            )));
        }
        if !(self.adapt_rate >= 0.0 && self.adapt_rate.is_finite()) {
            return Err(CalibrationError::InvalidConfig(format!(
                "adapt_rate must be non-negative, got {}",
                self.adapt_rate
            )));
        }
        if !(self.recovery_rate > 0.0 && self.recovery_rate.is_finite()) {
            return Err(CalibrationError::InvalidConfig(format!(
                "recovery_rate must be strictly positive, got {}",
                self.recovery_rate
            )));
        }
        Ok(())
    }

    /// Number of samples each chain keeps after burn-in.
    pub fn kept_per_chain(&self) -> usize {
        self.n_iterations.saturating_sub(self.burnin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SamplerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.n_iterations, 5000);
        assert_eq!(config.n_chains, 3);
        assert_eq!(config.burnin, 1000);
        assert_eq!(config.kept_per_chain(), 4000);
        assert_eq!(config.target_accept_rate, 0.234);
        assert_eq!(config.adapt_rate, 0.01);
        assert_eq!(config.initial_proposal_sd, vec![0.001; 3]);
    }

    #[test]
    fn burnin_must_be_below_iterations() {
        let config = SamplerConfig::default().set_iterations(1000, 1000);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn seed_count_must_match_chains() {
        let mut config = SamplerConfig::default();
        config.seed_parameters.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_seed_is_rejected() {
        let config = SamplerConfig::default().set_seed_parameters(vec![0.1, -0.2]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn set_seed_parameters_resizes_chains() {
        let config = SamplerConfig::default().set_seed_parameters(vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(config.n_chains, 4);
        assert_eq!(config.initial_proposal_sd.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_and_defaults() {
        let config = SamplerConfig::from_toml_str(
            r#"
            n_iterations = 300
            burnin = 50
            seed = 7
            mapping = "shared"
            seed_parameters = [0.2, 0.3, 0.4]
            "#,
        )
        .unwrap();
        assert_eq!(config.n_iterations, 300);
        assert_eq!(config.burnin, 50);
        assert_eq!(config.seed, 7);
        assert_eq!(config.mapping, ParameterMapping::Shared);
        assert_eq!(config.adapt_rate, 0.01);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = SamplerConfig::from_toml_str("n_iterations = \"many\"").unwrap_err();
        assert!(matches!(err, CalibrationError::Toml(_)));
    }
}
