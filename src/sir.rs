/*!
A three-group SIR model with a pooled force of infection.

For groups `g = 1..3` with transmission rates `beta_g`, recovery rate `gamma`
and total population `N`:

```text
lambda_g = beta_g * (I_1 + I_2 + I_3) / N
dS_g/dt  = -lambda_g * S_g
dI_g/dt  =  lambda_g * S_g - gamma * I_g
dR_g/dt  =  gamma * I_g
```

Integration is delegated to [`ode_solvers::Rk4`], run separately over each
interval of the time grid so every output row lands exactly on a grid point.

# Examples

```rust
use sir_calibrate::forward::ForwardModel;
use sir_calibrate::sir::AgeStructuredSir;

let model = AgeStructuredSir::default();
let params = AgeStructuredSir::parameters(&[0.4, 0.3, 0.25], 0.1);
let init = AgeStructuredSir::initial_state(&[99.0, 99.0, 99.0], &[1.0, 1.0, 1.0]);
let grid: Vec<f64> = (0..=10).map(|t| t as f64).collect();

let traj = model.integrate(&params, &init, &grid).unwrap();
assert_eq!(traj.values().dim(), (11, 9));
```
*/

use log::trace;
use nalgebra::SVector;
use ndarray::Array2;
use ode_solvers::{Rk4, System};

use crate::error::{CalibrationError, Result};
use crate::forward::{ForwardModel, InitialState, ModelParameters, Trajectory};

/// Number of age groups the model resolves.
pub const N_GROUPS: usize = 3;
const N_COMPARTMENTS: usize = 3 * N_GROUPS;

type SirState = SVector<f64, N_COMPARTMENTS>;

/// Right-hand side of the SIR system for one parameter set.
#[derive(Debug, Clone, Copy)]
struct SirDynamics {
    betas: [f64; N_GROUPS],
    gamma: f64,
    population: f64,
}

impl System<f64, SirState> for SirDynamics {
    fn system(&self, _t: f64, y: &SirState, dy: &mut SirState) {
        let infected: f64 = (0..N_GROUPS).map(|g| y[N_GROUPS + g]).sum();
        for g in 0..N_GROUPS {
            let s = y[g];
            let i = y[N_GROUPS + g];
            let force = self.betas[g] * infected / self.population;
            dy[g] = -force * s;
            dy[N_GROUPS + g] = force * s - self.gamma * i;
            dy[2 * N_GROUPS + g] = self.gamma * i;
        }
    }
}

/// Age-structured SIR simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeStructuredSir {
    substeps: usize,
}

impl Default for AgeStructuredSir {
    fn default() -> Self {
        Self { substeps: 10 }
    }
}

impl AgeStructuredSir {
    pub fn new(substeps: usize) -> Self {
        Self {
            substeps: substeps.max(1),
        }
    }

    /// RK4 steps taken between consecutive grid points, at least 1.
    pub fn substeps(&self) -> usize {
        self.substeps
    }

    /// Compartment names in canonical order: `S1..S3, I1..I3, R1..R3`.
    pub fn compartment_names() -> Vec<String> {
        ["S", "I", "R"]
            .iter()
            .flat_map(|c| (1..=N_GROUPS).map(move |g| format!("{c}{g}")))
            .collect()
    }

    /// Name of the transmission rate for 0-based group `g`.
    pub fn beta_name(g: usize) -> String {
        format!("beta{}", g + 1)
    }

    /// Builds the parameter map from per-group betas and gamma.
    pub fn parameters(betas: &[f64], gamma: f64) -> ModelParameters {
        let mut params: ModelParameters = betas
            .iter()
            .enumerate()
            .map(|(g, &b)| (Self::beta_name(g), b))
            .collect();
        params.insert("gamma".to_string(), gamma);
        params
    }

    /// Initial state with nobody recovered.
    pub fn initial_state(susceptible: &[f64], infected: &[f64]) -> InitialState {
        let mut state = InitialState::new();
        for (g, s) in susceptible.iter().enumerate() {
            state.insert(format!("S{}", g + 1), *s);
        }
        for (g, i) in infected.iter().enumerate() {
            state.insert(format!("I{}", g + 1), *i);
        }
        for g in 0..N_GROUPS {
            state.insert(format!("R{}", g + 1), 0.0);
        }
        state
    }

    fn dynamics(parameters: &ModelParameters, population: f64) -> Result<SirDynamics> {
        let lookup = |name: &str| {
            parameters.get(name).copied().ok_or_else(|| {
                CalibrationError::InvalidConfig(format!("missing model parameter `{name}`"))
            })
        };
        let mut betas = [0.0; N_GROUPS];
        for (g, beta) in betas.iter_mut().enumerate() {
            *beta = lookup(&Self::beta_name(g))?;
        }
        Ok(SirDynamics {
            betas,
            gamma: lookup("gamma")?,
            population,
        })
    }

    /// Reads the initial state into canonical order and returns, for every
    /// output column, its canonical index.
    fn canonical_state(initial_state: &InitialState) -> Result<(SirState, Vec<usize>)> {
        let names = Self::compartment_names();
        if initial_state.len() != N_COMPARTMENTS {
            return Err(CalibrationError::ShapeMismatch(format!(
                "expected {} compartments, got {}",
                N_COMPARTMENTS,
                initial_state.len()
            )));
        }
        let mut y0 = SirState::zeros();
        let mut columns = Vec::with_capacity(N_COMPARTMENTS);
        for (name, value) in initial_state {
            let idx = names.iter().position(|n| n == name).ok_or_else(|| {
                CalibrationError::ShapeMismatch(format!("unknown compartment `{name}`"))
            })?;
            y0[idx] = *value;
            columns.push(idx);
        }
        Ok((y0, columns))
    }
}

impl ForwardModel for AgeStructuredSir {
    fn integrate(
        &self,
        parameters: &ModelParameters,
        initial_state: &InitialState,
        time_grid: &[f64],
    ) -> Result<Trajectory> {
        if time_grid.is_empty() {
            return Err(CalibrationError::InsufficientData(
                "time grid is empty".to_string(),
            ));
        }
        let (mut y, columns) = Self::canonical_state(initial_state)?;
        let population: f64 = y.iter().sum();
        if !(population > 0.0) {
            return Err(CalibrationError::InvalidConfig(format!(
                "total population must be positive, got {population}"
            )));
        }
        let dynamics = Self::dynamics(parameters, population)?;

        let mut values = Array2::<f64>::zeros((time_grid.len(), N_COMPARTMENTS));
        let write_row = |values: &mut Array2<f64>, row: usize, y: &SirState| {
            for (col, &idx) in columns.iter().enumerate() {
                values[[row, col]] = y[idx];
            }
        };
        write_row(&mut values, 0, &y);

        for (row, window) in time_grid.windows(2).enumerate() {
            let (t0, t1) = (window[0], window[1]);
            if !(t1 > t0) {
                return Err(CalibrationError::ShapeMismatch(format!(
                    "time grid must be strictly increasing, got {t0} then {t1}"
                )));
            }
            let step = (t1 - t0) / self.substeps as f64;
            let mut stepper = Rk4::new(dynamics, t0, y, t1, step);
            stepper
                .integrate()
                .map_err(|e| CalibrationError::Integration(format!("{e:?}")))?;
            let (_, states) = stepper.results().get();
            y = *states.last().ok_or_else(|| {
                CalibrationError::Integration(format!("no output between t={t0} and t={t1}"))
            })?;
            write_row(&mut values, row + 1, &y);
        }
        trace!(
            "integrated SIR over {} grid points with {:?}",
            time_grid.len(),
            dynamics.betas
        );

        let compartments = initial_state.keys().cloned().collect();
        Trajectory::new(time_grid.to_vec(), compartments, values)
    }
}
