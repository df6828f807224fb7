//! Error types for the detector environment.

use thiserror::Error;

/// Errors that can occur while querying the detector environment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// PDG code not present in the particle table
    #[error("Unknown particle: PDG code {0}")]
    UnknownParticle(i32),

    /// Beam spot covariance is not a usable error matrix
    #[error("Invalid beam spot: {0}")]
    InvalidBeamSpot(String),

    /// Detector constant outside its physical range
    #[error("Invalid detector configuration: {0}")]
    InvalidConfiguration(String),
}

impl EnvError {
    /// Creates a beam spot error.
    pub fn beam_spot(msg: impl Into<String>) -> Self {
        Self::InvalidBeamSpot(msg.into())
    }

    /// Creates a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
