/*!
The forward-model seam: a deterministic simulator mapping named parameters and
an ordered initial state onto compartment trajectories over a fixed time grid.

Observed data uses the same [`Trajectory`] type, so the likelihood can check
that both tables share a time grid and compartment ordering.
*/

use indexmap::IndexMap;
use ndarray::{Array2, ArrayView1, Axis};

use crate::error::{CalibrationError, Result};

/// Named model parameters, e.g. `beta1`, `beta2`, `beta3`, `gamma`.
pub type ModelParameters = IndexMap<String, f64>;

/// Compartment name to initial count, in output column order.
pub type InitialState = IndexMap<String, f64>;

/// A deterministic compartmental simulator.
pub trait ForwardModel {
    /// Integrates the model and returns one row per entry of `time_grid`,
    /// one column per compartment of `initial_state` (same order).
    fn integrate(
        &self,
        parameters: &ModelParameters,
        initial_state: &InitialState,
        time_grid: &[f64],
    ) -> Result<Trajectory>;
}

/// A `time × compartment` table of counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    times: Vec<f64>,
    compartments: Vec<String>,
    values: Array2<f64>,
}

impl Trajectory {
    /// Builds a table, checking that `values` is `times.len() × compartments.len()`.
    pub fn new(times: Vec<f64>, compartments: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.dim() != (times.len(), compartments.len()) {
            return Err(CalibrationError::ShapeMismatch(format!(
                "values have shape {:?}, expected ({}, {})",
                values.dim(),
                times.len(),
                compartments.len()
            )));
        }
        Ok(Self {
            times,
            compartments,
            values,
        })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn compartments(&self) -> &[String] {
        &self.compartments
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    /// Column for one compartment, if it exists.
    pub fn column(&self, compartment: &str) -> Option<ArrayView1<'_, f64>> {
        self.compartments
            .iter()
            .position(|c| c == compartment)
            .map(|j| self.values.index_axis(Axis(1), j))
    }

    /// Errors unless `other` has the same time grid and compartment ordering.
    pub fn check_compatible(&self, other: &Trajectory) -> Result<()> {
        if self.compartments != other.compartments {
            return Err(CalibrationError::ShapeMismatch(format!(
                "compartments differ: {:?} vs {:?}",
                self.compartments, other.compartments
            )));
        }
        check_same_grid(&self.times, &other.times)
    }
}

/// Errors unless both grids have the same length and (numerically) equal points.
pub fn check_same_grid(a: &[f64], b: &[f64]) -> Result<()> {
    if a.len() != b.len() {
        return Err(CalibrationError::ShapeMismatch(format!(
            "time grids have {} and {} points",
            a.len(),
            b.len()
        )));
    }
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        if (x - y).abs() > 1e-9 * x.abs().max(1.0) {
            return Err(CalibrationError::ShapeMismatch(format!(
                "time grids differ at index {i}: {x} vs {y}"
            )));
        }
    }
    Ok(())
}
