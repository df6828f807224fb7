//! Error handling for the fitter.
//!
//! Two layers:
//! - [`ErrCode`]: a bit-flag status that every filter step returns and that
//!   accumulates with `|` over a whole pass. Some flags are informational.
//! - [`FitError`]: hard errors returned through `Result` when a fit cannot be
//!   set up or driven at all.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;
use treefit_env::EnvError;

/// Combinable status of a filter step, pass or fit.
///
/// The empty code is success. Codes merge with `|`; merging never loses a
/// flag, so the order in which constraints report does not matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ErrCode(u32);

impl ErrCode {
    pub const SUCCESS: ErrCode = ErrCode(0);
    /// No point of closest approach between two trajectories
    pub const POCA_FAILURE: ErrCode = ErrCode(1 << 0);
    /// Distance between trajectories or vertices is unphysical
    pub const BAD_DISTANCE: ErrCode = ErrCode(1 << 1);
    /// Residual covariance could not be inverted
    pub const INVERSION_ERROR: ErrCode = ErrCode(1 << 2);
    /// Tree or constraint list is malformed
    pub const BAD_SETUP: ErrCode = ErrCode(1 << 3);
    /// A constraint's inner iterations increased its chi-square
    pub const DIVERGING_CONSTRAINT: ErrCode = ErrCode(1 << 4);
    /// Total chi-square increased on several consecutive passes
    pub const SLOW_DIVERGENCE: ErrCode = ErrCode(1 << 5);
    /// Chi-square became non-finite during a pass
    pub const FAST_DIVERGENCE: ErrCode = ErrCode(1 << 6);
    /// Filter produced a non-finite state
    pub const FILTER_ERROR: ErrCode = ErrCode(1 << 7);
    /// Pass cap reached before convergence
    pub const NON_CONVERGENCE: ErrCode = ErrCode(1 << 8);
    /// Converged with a chi-square per degree of freedom above the limit
    pub const LARGE_CHI_SQUARE: ErrCode = ErrCode(1 << 9);

    const INFORMATIONAL: u32 = Self::DIVERGING_CONSTRAINT.0
        | Self::NON_CONVERGENCE.0
        | Self::SLOW_DIVERGENCE.0
        | Self::LARGE_CHI_SQUARE.0;

    const NAMES: [(ErrCode, &'static str); 10] = [
        (Self::POCA_FAILURE, "poca_failure"),
        (Self::BAD_DISTANCE, "bad_distance"),
        (Self::INVERSION_ERROR, "inversion_error"),
        (Self::BAD_SETUP, "bad_setup"),
        (Self::DIVERGING_CONSTRAINT, "diverging_constraint"),
        (Self::SLOW_DIVERGENCE, "slow_divergence"),
        (Self::FAST_DIVERGENCE, "fast_divergence"),
        (Self::FILTER_ERROR, "filter_error"),
        (Self::NON_CONVERGENCE, "non_convergence"),
        (Self::LARGE_CHI_SQUARE, "large_chi_square"),
    ];

    /// Raw flag bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if no flag is set.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Returns true if any flag other than the informational ones is set.
    pub fn is_failure(self) -> bool {
        self.0 & !Self::INFORMATIONAL != 0
    }

    /// Returns true if every flag of `other` is set.
    pub fn contains(self, other: ErrCode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Merges two codes.
    pub fn combine(self, other: ErrCode) -> ErrCode {
        ErrCode(self.0 | other.0)
    }

    /// Names of the set flags.
    pub fn flag_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for ErrCode {
    type Output = ErrCode;

    fn bitor(self, rhs: ErrCode) -> ErrCode {
        self.combine(rhs)
    }
}

impl BitOrAssign for ErrCode {
    fn bitor_assign(&mut self, rhs: ErrCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "success")
        } else {
            write!(f, "{}", self.flag_names().join("|"))
        }
    }
}

/// Hard errors of the fitter.
#[derive(Debug, Error)]
pub enum FitError {
    /// Decay tree or configuration cannot be fitted
    #[error("Bad setup: {0}")]
    BadSetup(String),

    /// PDG code has no entry in the particle table
    #[error("Unknown particle: PDG code {0}")]
    UnknownParticle(i32),

    /// Operation not allowed in the current fit state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Filtering failed with the given status
    #[error("Filter failed: {0}")]
    Filter(ErrCode),

    /// Detector environment lookup failed
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),
}

impl FitError {
    /// Creates a setup error.
    pub fn bad_setup(msg: impl Into<String>) -> Self {
        Self::BadSetup(msg.into())
    }

    /// Creates a state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
