//! Global state vector and covariance of a decay-tree fit.
//!
//! Every node of the tree owns a fixed sub-range of the state:
//!
//! ```text
//!   index:  0 1 2 | 3 4 5 6 | 7 8 9 | 10 11 12 13 14 15 16 17
//!           track | resonance| track |  vertex |tau| momentum
//!           p(3)  |  p(4)    | p(3)  |   x(3)  |   |  p(4)
//! ```
//!
//! Positions are in cm, momenta and energies in GeV, the flight parameter
//! `tau` in cm/GeV (decay length divided by momentum).

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

/// State vector, covariance and running fit statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParams {
    /// Parameters of every node in the tree
    state: DVector<f64>,

    /// Covariance of `state`
    covariance: DMatrix<f64>,

    /// Chi-square accumulated during the current pass
    chi_square: f64,

    /// Number of constraint equations applied during the current pass
    n_constraints: usize,

    /// Identifier of this copy when used as a linearisation reference
    reference_id: u64,

    /// Variances right after the last covariance reset
    variance_scale: DVector<f64>,
}

impl FitParams {
    /// Creates a zero state of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            state: DVector::zeros(dim),
            covariance: DMatrix::zeros(dim, dim),
            chi_square: 0.0,
            n_constraints: 0,
            reference_id: 0,
            variance_scale: DVector::zeros(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.state.len()
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DVector<f64> {
        &mut self.state
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn covariance_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.covariance
    }

    /// Parameter value at `index`.
    pub fn par(&self, index: usize) -> f64 {
        self.state[index]
    }

    /// Three consecutive parameters starting at `index`.
    pub fn vector3(&self, index: usize) -> Vector3<f64> {
        self.state.fixed_rows::<3>(index).into_owned()
    }

    /// Overwrites three consecutive parameters starting at `index`.
    pub fn set_vector3(&mut self, index: usize, value: &Vector3<f64>) {
        self.state.fixed_rows_mut::<3>(index).copy_from(value);
    }

    /// Uncertainty of the parameter at `index`.
    pub fn error(&self, index: usize) -> f64 {
        self.covariance[(index, index)].max(0.0).sqrt()
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Number of constraint equations applied in the current pass.
    pub fn n_constraints(&self) -> usize {
        self.n_constraints
    }

    /// Degrees of freedom: constraint equations minus free parameters.
    pub fn ndf(&self) -> i64 {
        self.n_constraints as i64 - self.dim() as i64
    }

    /// Records the chi-square and dimension of one filtered constraint.
    pub fn add_chi_square(&mut self, chi_square: f64, dim: usize) {
        self.chi_square += chi_square;
        self.n_constraints += dim;
    }

    /// Clears the pass statistics.
    pub fn reset_chi_square(&mut self) {
        self.chi_square = 0.0;
        self.n_constraints = 0;
    }

    /// Drops all correlations and inflates the variances by `scale`.
    ///
    /// Also clears the pass statistics.
    pub fn reset_covariance(&mut self, scale: f64) {
        let dim = self.dim();
        for row in 0..dim {
            for col in 0..row {
                self.covariance[(row, col)] = 0.0;
                self.covariance[(col, row)] = 0.0;
            }
            self.covariance[(row, row)] *= scale;
        }
        self.chi_square = 0.0;
        self.n_constraints = 0;
    }

    /// Remembers the current variances as the scale of later roundoff.
    pub fn record_variance_scale(&mut self) {
        self.variance_scale = self.covariance.diagonal();
    }

    /// Per-parameter variance scale: the recorded variance, or the current
    /// one where that is larger.
    pub fn variance_scale(&self) -> DVector<f64> {
        self.variance_scale
            .zip_map(&self.covariance.diagonal(), |recorded, current| recorded.max(current.abs()))
    }

    /// Returns true if every variance is positive and finite.
    pub fn test_covariance(&self) -> bool {
        (0..self.dim()).all(|i| {
            let v = self.covariance[(i, i)];
            v.is_finite() && v > 0.0
        })
    }

    /// Returns true if the state holds only finite numbers.
    pub fn is_finite(&self) -> bool {
        self.state.iter().all(|x| x.is_finite())
    }

    /// Replaces each off-diagonal pair by its mean.
    pub fn symmetrize(&mut self) {
        let dim = self.dim();
        for row in 0..dim {
            for col in 0..row {
                let avg = 0.5 * (self.covariance[(row, col)] + self.covariance[(col, row)]);
                self.covariance[(row, col)] = avg;
                self.covariance[(col, row)] = avg;
            }
        }
    }

    /// Returns true if the `len` parameters starting at `index` are all zero.
    pub fn is_zero_block(&self, index: usize, len: usize) -> bool {
        self.state.rows(index, len).iter().all(|&x| x == 0.0)
    }

    /// Copies this state as a new linearisation reference.
    pub fn snapshot(&mut self) -> FitParams {
        self.reference_id = self.reference_id.wrapping_add(1);
        self.clone()
    }

    /// Identifier distinguishing successive reference snapshots.
    pub fn reference_id(&self) -> u64 {
        self.reference_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_new_is_zero() {
        let fp = FitParams::new(7);
        assert_eq!(fp.dim(), 7);
        assert!(fp.is_zero_block(0, 7));
        assert!(!fp.test_covariance());
        assert_eq!(fp.ndf(), -7);
    }

    #[test]
    fn test_chi_square_bookkeeping() {
        let mut fp = FitParams::new(6);
        fp.add_chi_square(1.5, 5);
        fp.add_chi_square(0.5, 5);

        assert_relative_eq!(fp.chi_square(), 2.0);
        assert_eq!(fp.n_constraints(), 10);
        assert_eq!(fp.ndf(), 4);

        fp.reset_chi_square();
        assert_eq!(fp.chi_square(), 0.0);
        assert_eq!(fp.n_constraints(), 0);
    }

    #[test]
    fn test_reset_covariance_drops_correlations() {
        let mut fp = FitParams::new(2);
        *fp.covariance_mut() = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);

        fp.reset_covariance(1000.0);

        assert_relative_eq!(fp.covariance()[(0, 0)], 2000.0);
        assert_relative_eq!(fp.covariance()[(1, 1)], 1000.0);
        assert_eq!(fp.covariance()[(0, 1)], 0.0);
        assert_eq!(fp.covariance()[(1, 0)], 0.0);
        assert!(fp.test_covariance());
    }

    #[test]
    fn test_variance_scale_keeps_reset_variances() {
        let mut fp = FitParams::new(2);
        *fp.covariance_mut() = DMatrix::from_diagonal(&DVector::from_vec(vec![400.0, 1.0]));
        fp.record_variance_scale();

        fp.covariance_mut()[(0, 0)] = 1e-14;
        fp.covariance_mut()[(1, 1)] = 9.0;
        assert_eq!(fp.variance_scale(), DVector::from_vec(vec![400.0, 9.0]));
    }

    #[test]
    fn test_snapshot_gets_new_reference_id() {
        let mut fp = FitParams::new(3);
        let first = fp.snapshot();
        let second = fp.snapshot();
        assert_ne!(first.reference_id(), second.reference_id());
        assert_eq!(second.reference_id(), fp.reference_id());
    }
}
