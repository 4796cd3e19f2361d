//! Convergence diagnostics over post-burn-in chains: the potential scale
//! reduction factor (R-hat) and the effective sample size.

use log::{info, warn};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::ensemble::SampleSet;
use crate::error::{CalibrationError, Result};

/// Conventional R-hat threshold below which chains are treated as converged.
pub const RHAT_THRESHOLD: f64 = 1.1;

fn check_chains(chains: &[ArrayView2<f64>]) -> Result<(usize, usize)> {
    if chains.len() < 2 {
        return Err(CalibrationError::InsufficientChains(chains.len()));
    }
    let (n, k) = chains[0].dim();
    if let Some(c) = chains.iter().find(|c| c.dim() != (n, k)) {
        return Err(CalibrationError::ShapeMismatch(format!(
            "chains have shapes {:?} and {:?}",
            (n, k),
            c.dim()
        )));
    }
    if n < 2 {
        return Err(CalibrationError::InsufficientData(format!(
            "need at least 2 samples per chain, got {n}"
        )));
    }
    Ok((n, k))
}

/// Per-chain means (`m x k`) and sample variances (`m x k`, denominator `n - 1`).
fn chain_moments(chains: &[ArrayView2<f64>], k: usize) -> (Array2<f64>, Array2<f64>) {
    let m = chains.len();
    let mut means = Array2::<f64>::zeros((m, k));
    let mut vars = Array2::<f64>::zeros((m, k));
    for (i, c) in chains.iter().enumerate() {
        if let Some(mean) = c.mean_axis(Axis(0)) {
            means.row_mut(i).assign(&mean);
        }
        vars.row_mut(i).assign(&c.var_axis(Axis(0), 1.0));
    }
    (means, vars)
}

/**
Potential scale reduction factor for every parameter.

With `m` chains of `n` samples, `W` the mean within-chain variance and `B`
`n` times the variance of the chain means:

```text
var+  = (n - 1) / n * W + B / n
R-hat = sqrt(var+ / W)
```

Identical constant chains (`W = B = 0`) give exactly 1; constant chains at
different values (`W = 0`, `B > 0`) give `+inf`.

# Errors

[`CalibrationError::InsufficientChains`] for fewer than two chains,
[`CalibrationError::InsufficientData`] for fewer than two samples per chain
and [`CalibrationError::ShapeMismatch`] for ragged input.

# Examples

```rust
use ndarray::arr2;
use sir_calibrate::diagnostics::rhat;

let a = arr2(&[[1.0], [2.0], [3.0]]);
let b = arr2(&[[1.0], [2.0], [3.0]]);
let r = rhat(&[a.view(), b.view()]).unwrap();
assert!((r[0] - (2.0_f64 / 3.0).sqrt()).abs() < 1e-12);
```
*/
pub fn rhat(chains: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
    let (n, k) = check_chains(chains)?;
    let nf = n as f64;
    let (means, vars) = chain_moments(chains, k);

    let mut out = Array1::<f64>::zeros(k);
    for j in 0..k {
        let w = vars.column(j).mean().unwrap_or(0.0);
        let b = nf * means.column(j).var(1.0);
        out[j] = if w > 0.0 {
            let var_plus = (nf - 1.0) / nf * w + b / nf;
            (var_plus / w).sqrt()
        } else if b > 0.0 {
            f64::INFINITY
        } else {
            1.0
        };
    }
    Ok(out)
}

/// Biased autocovariance of `x` at every lag `0..n`, computed by FFT.
fn autocovariance(x: ArrayView1<f64>, planner: &mut FftPlanner<f64>) -> Vec<f64> {
    let n = x.len();
    let mean = x.mean().unwrap_or(0.0);
    let size = (2 * n).next_power_of_two();

    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    planner.plan_fft_forward(size).process(&mut buffer);
    for c in buffer.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buffer);

    let scale = (size * n) as f64;
    buffer[..n].iter().map(|c| c.re / scale).collect()
}

fn is_constant(x: ArrayView1<f64>) -> bool {
    match x.first() {
        Some(&first) => x.iter().all(|&v| v == first),
        None => true,
    }
}

/**
Effective sample size of the pooled draws for every parameter.

Autocovariances are computed per chain by FFT and averaged across chains;
the autocorrelation sum is truncated with Geyer's initial positive sequence:
lag pairs `rho_{2t} + rho_{2t+1}` are added while they stay positive. The
result `m n / (1 + 2 sum rho)` is clamped to `[0, m n]`, and a parameter with
zero variance reports `m n`.

Errors follow [`rhat`].
*/
pub fn effective_sample_size(chains: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
    let (n, k) = check_chains(chains)?;
    let m = chains.len();
    let total = (m * n) as f64;
    let mut planner = FftPlanner::<f64>::new();

    let mut out = Array1::<f64>::zeros(k);
    for j in 0..k {
        // Decided before the FFT: its round trip leaves rounding noise in
        // the lag-0 term even for constant input.
        if chains.iter().all(|c| is_constant(c.column(j))) {
            out[j] = total;
            continue;
        }
        let mut acov = vec![0.0; n];
        for c in chains {
            for (acc, v) in acov.iter_mut().zip(autocovariance(c.column(j), &mut planner)) {
                *acc += v / m as f64;
            }
        }
        if !(acov[0] > 0.0) {
            out[j] = total;
            continue;
        }
        let rho: Vec<f64> = acov.iter().map(|a| a / acov[0]).collect();

        // tau = -1 + 2 * sum of positive pair sums, starting at lag 0.
        let mut tau = -1.0;
        let mut t = 0;
        while t + 1 < n {
            let pair = rho[t] + rho[t + 1];
            if pair <= 0.0 {
                break;
            }
            tau += 2.0 * pair;
            t += 2;
        }
        out[j] = if tau > 0.0 {
            (total / tau).clamp(0.0, total)
        } else {
            total
        };
    }
    Ok(out)
}

/// R-hat, ESS and pooled moments of a [`SampleSet`], computed on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSummary {
    pub rhat: Array1<f64>,
    pub ess: Array1<f64>,
    pub mean: Array1<f64>,
    pub std_dev: Array1<f64>,
    pub n_chains: usize,
    pub n_samples: usize,
}

impl DiagnosticSummary {
    pub fn from_sample_set(samples: &SampleSet) -> Result<Self> {
        let views = samples.views();
        let summary = Self {
            rhat: rhat(&views)?,
            ess: effective_sample_size(&views)?,
            mean: samples.means(),
            std_dev: samples.std_devs(),
            n_chains: samples.n_chains(),
            n_samples: samples.n_samples(),
        };
        info!(
            "diagnostics over {} chains x {}: max R-hat {:.4}, min ESS {:.1}",
            summary.n_chains,
            summary.n_samples,
            summary.max_rhat(),
            summary.min_ess()
        );
        if !summary.is_converged(RHAT_THRESHOLD) {
            warn!(
                "R-hat {} exceeds {}; run more iterations",
                summary.rhat, RHAT_THRESHOLD
            );
        }
        Ok(summary)
    }

    /// Largest R-hat, or NaN if it is undefined.
    pub fn max_rhat(&self) -> f64 {
        self.rhat.max().map(|m| *m).unwrap_or(f64::NAN)
    }

    pub fn min_ess(&self) -> f64 {
        self.ess.min().map(|m| *m).unwrap_or(f64::NAN)
    }

    /// True when every parameter's R-hat is at most `threshold`.
    pub fn is_converged(&self, threshold: f64) -> bool {
        self.rhat.iter().all(|&r| r <= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;
    use rand_distr::Normal;

    fn gaussian_chain(seed: u64, n: usize, mean: f64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        Array2::from_shape_fn((n, 1), |_| normal.sample(&mut rng))
    }

    /// AR(1) chain `x_t = phi x_{t-1} + e_t`.
    fn ar1_chain(seed: u64, n: usize, phi: f64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut x = 0.0;
        Array2::from_shape_fn((n, 1), |_| {
            x = phi * x + normal.sample(&mut rng);
            x
        })
    }

    #[test]
    fn rhat_matches_hand_computed_values() {
        // Three chains of two draws over four parameters.
        let c0 = arr2(&[[0.0, 1.0, 0.0, 1.0], [1.0, 2.0, 2.0, 0.0]]);
        let c1 = arr2(&[[1.0, 2.0, 0.0, 2.0], [1.0, 1.0, 1.0, 1.0]]);
        let c2 = arr2(&[[0.0, 0.0, 0.0, 2.0], [0.0, 1.0, 0.0, 0.0]]);
        let r = rhat(&[c0.view(), c1.view(), c2.view()]).unwrap();
        let expected = array![std::f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        for (got, want) in r.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-7);
        }
    }

    #[test]
    fn identical_constant_chains_give_exactly_one() {
        let c = Array2::from_elem((100, 3), 0.25);
        let r = rhat(&[c.view(), c.view(), c.view()]).unwrap();
        assert_eq!(r, Array1::from_elem(3, 1.0));
    }

    #[test]
    fn constant_chains_at_different_values_give_infinity() {
        let a = Array2::from_elem((50, 1), 0.1);
        let b = Array2::from_elem((50, 1), 0.2);
        let r = rhat(&[a.view(), b.view()]).unwrap();
        assert!(r[0].is_infinite() && r[0] > 0.0);
    }

    #[test]
    fn disjoint_chains_exceed_threshold() {
        let a = Array2::from_shape_fn((200, 1), |(i, _)| 0.1 + 0.001 * (i % 10) as f64);
        let b = Array2::from_shape_fn((200, 1), |(i, _)| 0.5 + 0.001 * (i % 10) as f64);
        let r = rhat(&[a.view(), b.view()]).unwrap();
        assert!(r[0] > RHAT_THRESHOLD, "R-hat {}", r[0]);
    }

    #[test]
    fn well_mixed_chains_are_near_one() {
        let chains: Vec<_> = (0..4).map(|s| gaussian_chain(s, 2000, 0.0)).collect();
        let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
        let r = rhat(&views).unwrap();
        assert!(r[0] < 1.01, "R-hat {}", r[0]);
    }

    #[test]
    fn too_few_chains_or_samples_is_an_error() {
        let c = Array2::<f64>::zeros((10, 2));
        assert!(matches!(
            rhat(&[c.view()]),
            Err(CalibrationError::InsufficientChains(1))
        ));
        assert!(matches!(
            effective_sample_size(&[c.view()]),
            Err(CalibrationError::InsufficientChains(1))
        ));
        let short = Array2::<f64>::zeros((1, 2));
        assert!(matches!(
            rhat(&[short.view(), short.view()]),
            Err(CalibrationError::InsufficientData(_))
        ));
        let other = Array2::<f64>::zeros((10, 3));
        assert!(matches!(
            rhat(&[c.view(), other.view()]),
            Err(CalibrationError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn autocovariance_matches_direct_sum() {
        let x = array![1.0, 3.0, 2.0, 5.0, 4.0];
        let mut planner = FftPlanner::new();
        let acov = autocovariance(x.view(), &mut planner);
        let mean = 3.0;
        for lag in 0..x.len() {
            let direct: f64 = (0..x.len() - lag)
                .map(|t| (x[t] - mean) * (x[t + lag] - mean))
                .sum::<f64>()
                / x.len() as f64;
            assert_abs_diff_eq!(acov[lag], direct, epsilon = 1e-10);
        }
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_total() {
        let chains: Vec<_> = (0..4).map(|s| gaussian_chain(10 + s, 2000, 0.0)).collect();
        let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
        let ess = effective_sample_size(&views).unwrap();
        assert!(ess[0] > 6000.0 && ess[0] <= 8000.0, "ESS {}", ess[0]);
    }

    #[test]
    fn ess_drops_for_autocorrelated_chains() {
        // AR(1) with phi = 0.9 has integrated autocorrelation time 19.
        let chains: Vec<_> = (0..4).map(|s| ar1_chain(20 + s, 5000, 0.9)).collect();
        let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
        let ess = effective_sample_size(&views).unwrap();
        let expected = 20000.0 / 19.0;
        assert!(
            ess[0] > 0.5 * expected && ess[0] < 2.0 * expected,
            "ESS {} vs {}",
            ess[0],
            expected
        );
    }

    #[test]
    fn ess_of_constant_parameter_is_total() {
        let c = Array2::from_elem((30, 1), 0.3);
        let ess = effective_sample_size(&[c.view(), c.view()]).unwrap();
        assert_eq!(ess[0], 60.0);
    }

    #[test]
    fn ess_of_stuck_chains_is_total() {
        // Chains that rejected every proposal stay at their seed.
        for value in [0.1, 0.15, 0.2, 0.3] {
            let c = Array2::from_elem((4000, 1), value);
            let views = [c.view(), c.view(), c.view()];
            assert_eq!(effective_sample_size(&views).unwrap()[0], 12000.0);
            assert_eq!(rhat(&views).unwrap()[0], 1.0);
        }
        let stuck: Vec<_> = [0.1, 0.15, 0.2]
            .iter()
            .map(|&v| Array2::from_elem((4000, 2), v))
            .collect();
        let views: Vec<_> = stuck.iter().map(|c| c.view()).collect();
        let ess = effective_sample_size(&views).unwrap();
        assert_eq!(ess, Array1::from_elem(2, 12000.0));
    }

    #[test]
    fn one_moving_chain_is_not_treated_as_constant() {
        let stuck = Array2::from_elem((2000, 1), 0.0);
        let moving = ar1_chain(3, 2000, 0.9);
        let ess = effective_sample_size(&[stuck.view(), moving.view()]).unwrap();
        assert!(ess[0] > 0.0 && ess[0] < 1000.0, "ESS {}", ess[0]);
    }

    #[test]
    fn summary_flags_non_convergence() {
        let a = Array2::from_shape_fn((100, 1), |(i, _)| 0.1 + 0.001 * (i % 7) as f64);
        let b = Array2::from_shape_fn((100, 1), |(i, _)| 0.9 + 0.001 * (i % 7) as f64);
        let set = SampleSet::from_chains(vec![a, b], 0).unwrap();
        let summary = DiagnosticSummary::from_sample_set(&set).unwrap();
        assert!(!summary.is_converged(RHAT_THRESHOLD));
        assert!(summary.max_rhat() > RHAT_THRESHOLD);
        assert_abs_diff_eq!(summary.mean[0], 0.503, epsilon = 1e-3);
        assert_eq!(summary.n_chains, 2);
        assert_eq!(summary.n_samples, 100);
    }
}
