//! Error type shared by every stage of a calibration run.

use thiserror::Error;

/// Everything that can go wrong while configuring, sampling or diagnosing.
///
/// Rejected proposals and degenerate forward-model rates are *not* errors;
/// they are folded into the log-density (see [`crate::likelihood`]).
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not enough chains: got {0}")]
    InsufficientChains(usize),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("forward model integration failed: {0}")]
    Integration(String),

    #[error("sampling cancelled at iteration {iteration}")]
    Cancelled { iteration: usize },

    #[error("sampler has already been run; create a new instance per chain")]
    SamplerReused,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
