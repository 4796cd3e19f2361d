//! Numeric series for trace and posterior-density plots. Rendering is left to
//! the caller.

use ndarray::{Array1, ArrayView1};
use ndarray_stats::QuantileExt;

use crate::ensemble::SampleSet;
use crate::error::{CalibrationError, Result};
use crate::sampler::Chain;

/// `(iteration, value)` pairs of one parameter of one chain.
pub fn trace(chain: &Chain, param: usize) -> Result<Vec<(usize, f64)>> {
    if param >= chain.n_params() {
        return Err(CalibrationError::ShapeMismatch(format!(
            "parameter {} requested from a chain with {} parameters",
            param,
            chain.n_params()
        )));
    }
    Ok(chain.trace(param).iter().copied().enumerate().collect())
}

/// A histogram normalised to integrate to one.
#[derive(Debug, Clone, PartialEq)]
pub struct DensitySeries {
    /// Bin centres.
    pub centers: Array1<f64>,
    /// Density at each bin.
    pub density: Array1<f64>,
    pub bin_width: f64,
}

/**
Histogram density estimate of `samples` over `n_bins` equal-width bins
spanning the sample range.

A sample set with zero spread collapses into a single bin of unit width
centred on the common value.

# Examples

```rust
use ndarray::array;
use sir_calibrate::output::posterior_density;

let d = posterior_density(array![0.1, 0.2, 0.2, 0.3].view(), 2).unwrap();
let area: f64 = d.density.iter().map(|h| h * d.bin_width).sum();
assert!((area - 1.0).abs() < 1e-12);
```
*/
pub fn posterior_density(samples: ArrayView1<f64>, n_bins: usize) -> Result<DensitySeries> {
    if n_bins == 0 {
        return Err(CalibrationError::InvalidConfig(
            "n_bins must be at least 1".to_string(),
        ));
    }
    if samples.is_empty() {
        return Err(CalibrationError::InsufficientData(
            "no samples to estimate a density from".to_string(),
        ));
    }
    let lo = *samples
        .min()
        .map_err(|e| CalibrationError::InsufficientData(format!("{e}")))?;
    let hi = *samples
        .max()
        .map_err(|e| CalibrationError::InsufficientData(format!("{e}")))?;
    let n = samples.len() as f64;

    if hi == lo {
        return Ok(DensitySeries {
            centers: Array1::from_elem(1, lo),
            density: Array1::from_elem(1, 1.0),
            bin_width: 1.0,
        });
    }

    let width = (hi - lo) / n_bins as f64;
    let mut counts = Array1::<f64>::zeros(n_bins);
    for &x in samples.iter() {
        let bin = (((x - lo) / width) as usize).min(n_bins - 1);
        counts[bin] += 1.0;
    }
    Ok(DensitySeries {
        centers: Array1::from_shape_fn(n_bins, |b| lo + (b as f64 + 0.5) * width),
        density: counts / (n * width),
        bin_width: width,
    })
}

/// Density series for every parameter of a pooled sample set.
pub fn posterior_densities(samples: &SampleSet, n_bins: usize) -> Result<Vec<DensitySeries>> {
    (0..samples.n_params())
        .map(|j| posterior_density(samples.pooled_column(j).view(), n_bins))
        .collect()
}
