//! Kalman update engine.
//!
//! For a constraint linearised as `r(x) ≈ r + H δx` with measurement
//! covariance `V`:
//!
//! ```text
//!   R  = H C Hᵀ + w·V
//!   K  = C Hᵀ R⁻¹
//!   x' = x − K r
//!   χ² = rᵀ R⁻¹ r
//!   C' = C − C Hᵀ R⁻¹ H C
//! ```
//!
//! The residual convention is "zero at the solution", hence the minus sign in
//! the state update.
//!
//! Exact measurements make `R` rank deficient as soon as they over-determine
//! part of the state. `R` is then replaced by a pseudo-inverse: residual
//! components in its null space get no gain and add nothing to χ². Rank is
//! judged row by row against the variances at the last covariance reset.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::error::ErrCode;
use crate::fit_params::FitParams;

/// Eigenvalues of the normalised `R` below this count as zero.
const RANK_TOLERANCE: f64 = 1e-12;

/// Eigenvalues of the normalised `R` below minus this make it indefinite.
const NEGATIVE_TOLERANCE: f64 = 1e-9;

/// Holds the intermediate products of one gain calculation so that the state
/// and covariance updates reuse them.
#[derive(Debug, Clone, Default)]
pub struct KalmanCalculator {
    residual: DVector<f64>,
    c_ht: DMatrix<f64>,
    r_inv: DMatrix<f64>,
    gain: DMatrix<f64>,
    chi_square: f64,
}

impl KalmanCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the gain for the given projection at the current covariance.
    ///
    /// Returns `INVERSION_ERROR` if a row of the projection carries no
    /// variance at all, or `R` is indefinite or not finite; the calculator is
    /// then left unchanged. A constraint already fixed by earlier exact ones
    /// gets a zero gain.
    pub fn calculate_gain_matrix(
        &mut self,
        residual: &DVector<f64>,
        h: &DMatrix<f64>,
        fitparams: &FitParams,
        v: Option<&DMatrix<f64>>,
        weight: f64,
    ) -> ErrCode {
        let c_ht = fitparams.covariance() * h.transpose();
        let mut r = h * &c_ht;
        if let Some(v) = v {
            r += v * weight;
        }
        let r = (&r + r.transpose()) * 0.5;

        // Scale of each row before any update: roundoff left in R by
        // earlier exact constraints is relative to this.
        let mut scale = h.map(|x| x * x) * fitparams.variance_scale();
        for i in 0..scale.len() {
            if let Some(v) = v {
                scale[i] += (v[(i, i)] * weight).abs();
            }
            scale[i] = scale[i].max(r[(i, i)].abs());
        }

        let Some(r_inv) = invert_residual_covariance(&r, &scale) else {
            return ErrCode::INVERSION_ERROR;
        };

        if r_inv.iter().any(|x| !x.is_finite()) {
            return ErrCode::INVERSION_ERROR;
        }

        self.gain = &c_ht * &r_inv;
        self.residual = residual.clone();
        self.c_ht = c_ht;
        self.r_inv = r_inv;
        ErrCode::SUCCESS
    }

    /// Applies `x -= K r` and computes the chi-square of the residual.
    pub fn update_state(&mut self, fitparams: &mut FitParams) {
        *fitparams.state_mut() -= &self.gain * &self.residual;
        self.chi_square = self.residual.dot(&(&self.r_inv * &self.residual));
    }

    /// Applies `C -= C Hᵀ R⁻¹ H C` using the products of the last gain
    /// calculation.
    pub fn update_covariance(&self, fitparams: &mut FitParams) {
        let delta = &self.gain * self.c_ht.transpose();
        *fitparams.covariance_mut() -= delta;
        fitparams.symmetrize();
    }

    /// Chi-square of the last state update.
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }
}

/// Inverts a symmetric `R` whose rows have the variance scales `scale`.
///
/// `R` is normalised to `N = D R D` with `D = diag(scale)^-1/2`. A
/// well-conditioned `N` goes through Cholesky; otherwise eigenvalues of `N`
/// below the rank tolerance are dropped and `D N⁺ D` is returned.
fn invert_residual_covariance(r: &DMatrix<f64>, scale: &DVector<f64>) -> Option<DMatrix<f64>> {
    if scale.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
        return None;
    }
    let d = scale.map(|s| s.sqrt().recip());
    let n = r.nrows();
    let rescale = |m: &DMatrix<f64>| DMatrix::from_fn(n, n, |i, j| d[i] * m[(i, j)] * d[j]);
    let normalised = rescale(r);

    if let Some(chol) = normalised.clone().cholesky() {
        let min_pivot = chol.l_dirty().diagonal().iter().fold(f64::INFINITY, |m, &x| m.min(x * x));
        if min_pivot >= RANK_TOLERANCE {
            return Some(rescale(&chol.inverse()));
        }
    }

    let eigen = normalised.symmetric_eigen();
    if eigen.eigenvalues.iter().any(|&l| !l.is_finite() || l < -NEGATIVE_TOLERANCE) {
        return None;
    }
    let mut inverse = DMatrix::zeros(n, n);
    let mut rank = 0;
    for (i, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda > RANK_TOLERANCE {
            let v = eigen.eigenvectors.column(i).into_owned();
            inverse += (&v * v.transpose()) / lambda;
            rank += 1;
        }
    }
    trace!("residual covariance has rank {} of {}, using pseudo-inverse", rank, n);
    Some(rescale(&inverse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_params(dim: usize) -> FitParams {
        let mut fp = FitParams::new(dim);
        *fp.covariance_mut() = DMatrix::identity(dim, dim);
        fp
    }

    #[test]
    fn test_scalar_measurement_update() {
        // r = x - 2 measured with unit variance
        let mut fp = unit_params(1);
        let r = DVector::from_vec(vec![fp.par(0) - 2.0]);
        let h = DMatrix::from_element(1, 1, 1.0);
        let v = DMatrix::from_element(1, 1, 1.0);

        let mut kalman = KalmanCalculator::new();
        let status = kalman.calculate_gain_matrix(&r, &h, &fp, Some(&v), 1.0);
        assert!(status.is_success());

        kalman.update_state(&mut fp);
        kalman.update_covariance(&mut fp);

        assert_relative_eq!(fp.par(0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(kalman.chi_square(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(fp.covariance()[(0, 0)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_exact_constraint_is_satisfied_after_update() {
        // x0 + x1 = 3 with no measurement error
        let mut fp = unit_params(2);
        let r = DVector::from_vec(vec![fp.par(0) + fp.par(1) - 3.0]);
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);

        let mut kalman = KalmanCalculator::new();
        assert!(kalman.calculate_gain_matrix(&r, &h, &fp, None, 1.0).is_success());
        kalman.update_state(&mut fp);
        kalman.update_covariance(&mut fp);

        assert_relative_eq!(fp.par(0) + fp.par(1), 3.0, epsilon = 1e-12);
        assert_relative_eq!(fp.par(0), 1.5, epsilon = 1e-12);

        // The constrained combination has no variance left
        let c = fp.covariance();
        let var_sum = c[(0, 0)] + c[(1, 1)] + 2.0 * c[(0, 1)];
        assert!(var_sum.abs() < 1e-12);
    }

    #[test]
    fn test_zero_residual_leaves_state_unchanged() {
        let mut fp = unit_params(3);
        fp.state_mut()[1] = 4.0;
        let before = fp.state().clone();

        let r = DVector::zeros(1);
        let h = DMatrix::from_row_slice(1, 3, &[0.0, 1.0, 0.0]);
        let mut kalman = KalmanCalculator::new();
        assert!(kalman.calculate_gain_matrix(&r, &h, &fp, None, 1.0).is_success());
        kalman.update_state(&mut fp);

        assert_eq!(fp.state(), &before);
        assert_eq!(kalman.chi_square(), 0.0);
    }

    #[test]
    fn test_repeated_exact_constraint_uses_pseudo_inverse() {
        // x0 = 1 stated twice without error: R = [[1, 1], [1, 1]]
        let mut fp = unit_params(2);
        let r = DVector::from_vec(vec![fp.par(0) - 1.0, fp.par(0) - 1.0]);
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 0.0]);

        let mut kalman = KalmanCalculator::new();
        assert!(kalman.calculate_gain_matrix(&r, &h, &fp, None, 1.0).is_success());
        kalman.update_state(&mut fp);
        kalman.update_covariance(&mut fp);

        assert_relative_eq!(fp.par(0), 1.0, epsilon = 1e-10);
        assert_eq!(fp.par(1), 0.0);
        assert_relative_eq!(kalman.chi_square(), 1.0, epsilon = 1e-10);
        assert!(fp.covariance()[(0, 0)].abs() < 1e-10);
        assert_relative_eq!(fp.covariance()[(1, 1)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constraint_on_fixed_parameter_has_no_gain() {
        // x0 was pinned exactly earlier; its variance is roundoff below zero
        let mut fp = unit_params(2);
        fp.record_variance_scale();
        fp.covariance_mut()[(0, 0)] = -1e-16;
        fp.state_mut()[0] = 1.0;
        let before = fp.state().clone();

        let r = DVector::from_vec(vec![fp.par(0) - 1.0 + 1e-13]);
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let mut kalman = KalmanCalculator::new();
        assert!(kalman.calculate_gain_matrix(&r, &h, &fp, None, 1.0).is_success());
        kalman.update_state(&mut fp);
        kalman.update_covariance(&mut fp);

        assert_eq!(fp.state(), &before);
        assert_eq!(kalman.chi_square(), 0.0);
        assert_eq!(fp.covariance()[(1, 1)], 1.0);
    }

    #[test]
    fn test_indefinite_residual_covariance() {
        let fp = unit_params(1);
        let r = DVector::from_vec(vec![1.0]);
        let h = DMatrix::zeros(1, 1);
        let v = DMatrix::from_element(1, 1, -1.0);

        let mut kalman = KalmanCalculator::new();
        let status = kalman.calculate_gain_matrix(&r, &h, &fp, Some(&v), 1.0);
        assert_eq!(status, ErrCode::INVERSION_ERROR);
    }

    #[test]
    fn test_singular_residual_covariance() {
        let fp = unit_params(2);
        let r = DVector::from_vec(vec![1.0]);
        let h = DMatrix::zeros(1, 2);

        let mut kalman = KalmanCalculator::new();
        let status = kalman.calculate_gain_matrix(&r, &h, &fp, None, 1.0);
        assert_eq!(status, ErrCode::INVERSION_ERROR);
    }
}
