/*!
Target and proposal traits for the sampler, plus the two densities the
calibration needs: the Poisson observation model and the Beta prior.

# Examples

```rust
use rand::rngs::SmallRng;
use rand::SeedableRng;
use sir_calibrate::distributions::{Proposal, RandomWalk};

let proposal = RandomWalk::new(0.01);
let mut rng = SmallRng::seed_from_u64(42);
let candidate = proposal.sample(&[0.3, 0.2], &mut rng);
assert_eq!(candidate.len(), 2);
```
*/

use rand::Rng;
use rand_distr::{Distribution, Normal};
use special::Gamma;

/// A continuous distribution we want to sample from, known up to a constant.
pub trait Target {
    /// Returns the log of the unnormalized density at `theta`.
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64;

    /// Length of the parameter vector, if the target has a fixed one.
    fn dim(&self) -> Option<usize> {
        None
    }
}

impl<T: Target + ?Sized> Target for &T {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        (**self).unnorm_log_prob(theta)
    }

    fn dim(&self) -> Option<usize> {
        (**self).dim()
    }
}

/// A proposal kernel q(x' | x). The random-number stream is passed in so that
/// each chain owns its own generator.
pub trait Proposal {
    /// Samples a new point from q(x' | x).
    fn sample<R: Rng + ?Sized>(&self, current: &[f64], rng: &mut R) -> Vec<f64>;

    /// Evaluates log q(x' | x).
    fn log_prob(&self, from: &[f64], to: &[f64]) -> f64;

    /// Whether q(x' | x) = q(x | x'), which lets the acceptance test skip the
    /// proposal correction.
    fn is_symmetric(&self) -> bool {
        false
    }
}

/**
An isotropic Gaussian random walk: each coordinate of the current state is
perturbed by independent `Normal(0, std)` noise.

The scale is mutable so the adaptive sampler can rescale it in place.
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWalk {
    pub std: f64,
}

impl RandomWalk {
    pub fn new(std: f64) -> Self {
        Self { std }
    }
}

impl Proposal for RandomWalk {
    fn sample<R: Rng + ?Sized>(&self, current: &[f64], rng: &mut R) -> Vec<f64> {
        // A zero or non-finite scale cannot move the chain.
        match Normal::new(0.0, self.std) {
            Ok(normal) => current.iter().map(|x| x + normal.sample(rng)).collect(),
            Err(_) => current.to_vec(),
        }
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> f64 {
        let var = self.std * self.std;
        let d = from.len() as f64;
        let sq: f64 = from
            .iter()
            .zip(to)
            .map(|(f, t)| (t - f) * (t - f))
            .sum();
        -sq / (2.0 * var) - 0.5 * d * (2.0 * std::f64::consts::PI * var).ln()
    }

    fn is_symmetric(&self) -> bool {
        true
    }
}

/// `ln(k!)` via the log-gamma function.
pub fn ln_factorial(k: f64) -> f64 {
    if k < 2.0 {
        0.0
    } else {
        Gamma::ln_gamma(k + 1.0).0
    }
}

/// Poisson log-pmf `k ln(rate) - rate - ln(k!)`.
///
/// Returns `None` when the rate cannot define a Poisson distribution for `k`
/// (non-finite, negative, or zero with `k > 0`). A zero rate with `k = 0` is
/// the point mass at zero and has log-pmf 0.
pub fn poisson_log_pmf(k: f64, rate: f64) -> Option<f64> {
    if !rate.is_finite() || rate < 0.0 {
        return None;
    }
    if rate == 0.0 {
        return if k == 0.0 { Some(0.0) } else { None };
    }
    Some(k * rate.ln() - rate - ln_factorial(k))
}

/// A Beta(alpha, beta) density on (0, 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beta {
    pub alpha: f64,
    pub beta: f64,
    ln_norm: f64,
}

impl Beta {
    pub fn new(alpha: f64, beta: f64) -> Self {
        let ln_norm =
            Gamma::ln_gamma(alpha + beta).0 - Gamma::ln_gamma(alpha).0 - Gamma::ln_gamma(beta).0;
        Self {
            alpha,
            beta,
            ln_norm,
        }
    }

    /// Normalized log-density; `NEG_INFINITY` outside the open unit interval.
    pub fn log_prob(&self, x: f64) -> f64 {
        if !(x > 0.0 && x < 1.0) {
            return f64::NEG_INFINITY;
        }
        self.ln_norm + (self.alpha - 1.0) * x.ln() + (self.beta - 1.0) * (1.0 - x).ln()
    }

    /// Largest attainable log-density (at the mode, for alpha, beta > 1).
    pub fn max_log_prob(&self) -> f64 {
        let mode = (self.alpha - 1.0) / (self.alpha + self.beta - 2.0);
        self.log_prob(mode)
    }
}

impl Default for Beta {
    fn default() -> Self {
        Self::new(2.0, 2.0)
    }
}
