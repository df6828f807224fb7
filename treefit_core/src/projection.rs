//! Linearised constraint: residual, Jacobian and measurement covariance.

use nalgebra::{DMatrix, DVector};

/// Output buffer of a constraint projection.
///
/// `r` is the residual of the constraint at the current state (zero when the
/// constraint is satisfied), `h` its Jacobian with respect to the full state
/// and `v` the covariance of whatever measurement enters `r`.
#[derive(Debug, Clone)]
pub struct Projection {
    pub r: DVector<f64>,
    pub h: DMatrix<f64>,
    pub v: DMatrix<f64>,
}

impl Projection {
    /// Creates a zeroed projection for a constraint of dimension `dim`.
    pub fn new(state_dim: usize, dim: usize) -> Self {
        Self {
            r: DVector::zeros(dim),
            h: DMatrix::zeros(dim, state_dim),
            v: DMatrix::zeros(dim, dim),
        }
    }

    /// Constraint dimension.
    pub fn dim(&self) -> usize {
        self.r.len()
    }

    /// Clears residual, Jacobian and covariance.
    pub fn reset(&mut self) {
        self.r.fill(0.0);
        self.h.fill(0.0);
        self.v.fill(0.0);
    }

    /// Returns true if the measurement covariance is identically zero.
    pub fn is_exact(&self) -> bool {
        self.v.iter().all(|&x| x == 0.0)
    }

    /// Copies `other` into rows `offset..offset + other.dim()`.
    pub fn insert(&mut self, other: &Projection, offset: usize) {
        let n = other.dim();
        self.r.rows_mut(offset, n).copy_from(&other.r);
        self.h.rows_mut(offset, n).copy_from(&other.h);
        self.v.view_mut((offset, offset), (n, n)).copy_from(&other.v);
    }

    /// Returns true if every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.r.iter().chain(self.h.iter()).chain(self.v.iter()).all(|x| x.is_finite())
    }
}
