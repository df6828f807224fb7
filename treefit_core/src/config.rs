//! Fit configuration.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::constraint::{ConstraintOrdering, FilterStrategy};
use crate::error::FitError;

/// Constraint tying the head of the tree to the interaction region.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeamConstraint {
    #[default]
    None,

    /// Head produced inside the detector's beam spot
    BeamSpot,

    /// Same, constraining only x and y
    BeamSpotTransverse,

    /// Head produced at a user-supplied point
    Origin {
        position: Vector3<f64>,
        covariance: Matrix3<f64>,
    },
}

impl BeamConstraint {
    pub fn is_none(&self) -> bool {
        matches!(self, BeamConstraint::None)
    }
}

/// Tuning of a decay-tree fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Maximum number of global passes
    pub max_passes: usize,

    /// Relative chi-square change that counts as converged
    pub precision: f64,

    /// Absolute chi-square change that counts as converged, for the global
    /// passes and for each constraint's inner loop
    pub dchisq_converged: f64,

    /// Consecutive passes with growing chi-square before the fit gives up
    pub max_diverging_passes: usize,

    /// Chi-square per degree of freedom above which a converged fit is
    /// flagged `LARGE_CHI_SQUARE`
    pub max_chi2_per_ndf: f64,

    pub ordering: ConstraintOrdering,

    /// Linearisation used by passes after the first
    pub strategy: FilterStrategy,

    /// Filter all non-linear constraints as one block
    pub merge_nonlinear: bool,

    /// Overrides every constraint's inner iteration cap
    pub max_constraint_iterations: Option<usize>,

    /// Refit composites that already carry a fit result
    pub force_fit_all: bool,

    pub beam_constraint: BeamConstraint,

    /// Constrain the head four-momentum to the beam
    pub beam_energy_constraint: bool,

    /// Make momenta add up exactly at every vertex after the fit
    pub force_p4_sum: bool,

    /// Write fitted values back to every particle, not just the head
    pub update_daughters: bool,

    /// 0 quiet, 1 per fit, 2 per pass, 3 per constraint iteration
    pub verbosity: u8,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_passes: 10,
            precision: 0.01,
            dchisq_converged: 1e-3,
            max_diverging_passes: 3,
            max_chi2_per_ndf: 100.0,
            ordering: ConstraintOrdering::default(),
            strategy: FilterStrategy::default(),
            merge_nonlinear: false,
            max_constraint_iterations: None,
            force_fit_all: false,
            beam_constraint: BeamConstraint::None,
            beam_energy_constraint: false,
            force_p4_sum: true,
            update_daughters: false,
            verbosity: 0,
        }
    }
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, FitError> {
        let config: FitConfig = serde_json::from_str(json)
            .map_err(|e| FitError::bad_setup(format!("invalid fit configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the driver cannot run with.
    pub fn validate(&self) -> Result<(), FitError> {
        if self.max_passes == 0 {
            return Err(FitError::bad_setup("max_passes must be at least 1"));
        }
        if !(self.precision > 0.0) || !(self.dchisq_converged > 0.0) {
            return Err(FitError::bad_setup("convergence thresholds must be positive"));
        }
        if !(self.max_chi2_per_ndf > 0.0) {
            return Err(FitError::bad_setup("max_chi2_per_ndf must be positive"));
        }
        if self.max_diverging_passes == 0 {
            return Err(FitError::bad_setup("max_diverging_passes must be at least 1"));
        }
        if let BeamConstraint::Origin { covariance, .. } = &self.beam_constraint {
            if covariance.cholesky().is_none() {
                return Err(FitError::bad_setup("origin covariance is not positive definite"));
            }
        }
        Ok(())
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_dchisq_converged(mut self, dchisq: f64) -> Self {
        self.dchisq_converged = dchisq;
        self
    }

    pub fn with_max_diverging_passes(mut self, passes: usize) -> Self {
        self.max_diverging_passes = passes;
        self
    }

    pub fn with_max_chi2_per_ndf(mut self, limit: f64) -> Self {
        self.max_chi2_per_ndf = limit;
        self
    }

    pub fn with_ordering(mut self, ordering: ConstraintOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_strategy(mut self, strategy: FilterStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_merge_nonlinear(mut self, merge: bool) -> Self {
        self.merge_nonlinear = merge;
        self
    }

    pub fn with_max_constraint_iterations(mut self, iterations: usize) -> Self {
        self.max_constraint_iterations = Some(iterations);
        self
    }

    pub fn with_force_fit_all(mut self, force: bool) -> Self {
        self.force_fit_all = force;
        self
    }

    pub fn with_beam_constraint(mut self, beam: BeamConstraint) -> Self {
        self.beam_constraint = beam;
        self
    }

    pub fn with_beam_energy_constraint(mut self, enabled: bool) -> Self {
        self.beam_energy_constraint = enabled;
        self
    }

    pub fn with_force_p4_sum(mut self, enabled: bool) -> Self {
        self.force_p4_sum = enabled;
        self
    }

    pub fn with_update_daughters(mut self, enabled: bool) -> Self {
        self.update_daughters = enabled;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FitConfig::default();
        assert_eq!(config.max_passes, 10);
        assert_eq!(config.ordering, ConstraintOrdering::DepthThenType);
        assert_eq!(config.strategy, FilterStrategy::Relinearize);
        assert!(config.beam_constraint.is_none());
        assert!(config.force_p4_sum);
        assert_eq!(config.max_chi2_per_ndf, 100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_keeps_missing_defaults() {
        let config = FitConfig::from_json(
            r#"{ "max_passes": 4, "ordering": "external_by_type", "beam_constraint": "beam_spot" }"#,
        )
        .unwrap();
        assert_eq!(config.max_passes, 4);
        assert_eq!(config.ordering, ConstraintOrdering::ExternalByType);
        assert_eq!(config.beam_constraint, BeamConstraint::BeamSpot);
        assert_eq!(config.precision, 0.01);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            FitConfig::from_json(r#"{ "max_passes": 0 }"#),
            Err(FitError::BadSetup(_))
        ));
        assert!(FitConfig::from_json(r#"{ "max_chi2_per_ndf": 0.0 }"#).is_err());
        assert!(FitConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_builders() {
        let config = FitConfig::new()
            .with_merge_nonlinear(true)
            .with_max_constraint_iterations(5)
            .with_beam_constraint(BeamConstraint::BeamSpotTransverse)
            .with_verbosity(3);
        assert!(config.merge_nonlinear);
        assert_eq!(config.max_constraint_iterations, Some(5));
        assert_eq!(config.verbosity, 3);
    }
}
