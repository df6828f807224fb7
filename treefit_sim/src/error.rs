//! Errors of the simulation harness.

use thiserror::Error;
use treefit_core::FitError;
use treefit_env::EnvError;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    /// Decay the generator cannot produce
    #[error("Unsupported decay: {0}")]
    UnsupportedDecay(String),

    /// Random distribution built with an unusable parameter
    #[error("Invalid distribution: {0}")]
    Distribution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
