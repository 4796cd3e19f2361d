//! # sir-calibrate
//!
//! Bayesian calibration of a three-group SIR model with adaptive
//! random-walk Metropolis-Hastings.
//!
//! Observed compartment counts are scored with a Poisson likelihood and a
//! Beta(2, 2) prior ([`likelihood`]). Several independent chains
//! ([`sampler`]) run in parallel ([`ensemble`]), their post-burn-in samples
//! are pooled, and convergence is judged with R-hat and the effective sample
//! size ([`diagnostics`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use sir_calibrate::config::SamplerConfig;
//! use sir_calibrate::diagnostics::DiagnosticSummary;
//! use sir_calibrate::ensemble::ChainEnsemble;
//! use sir_calibrate::scenario::Scenario;
//!
//! let config = SamplerConfig::default();
//! let likelihood = Scenario::default().likelihood(config.mapping).unwrap();
//! let samples = ChainEnsemble::new(likelihood, config).unwrap().sample().unwrap();
//! let summary = DiagnosticSummary::from_sample_set(&samples).unwrap();
//! println!("means {}, R-hat {}", summary.mean, summary.rhat);
//! ```

pub mod config;
pub mod diagnostics;
pub mod distributions;
pub mod ensemble;
pub mod error;
pub mod forward;
pub mod io;
pub mod likelihood;
pub mod output;
pub mod sampler;
pub mod scenario;
pub mod sir;

pub use error::{CalibrationError, Result};
