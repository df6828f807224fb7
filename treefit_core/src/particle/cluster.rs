//! Neutral particles measured by a calorimeter cluster.
//!
//! The momentum must point from the production vertex to the cluster. With
//! `i1` the largest momentum component and `d = x_cluster − x_vertex`, the
//! pointing condition is written as
//!
//! ```text
//!   d[i2] − p[i2]·d[i1]/p[i1] = 0
//!   d[i3] − p[i3]·d[i1]/p[i1] = 0
//! ```
//!
//! which stays well conditioned in every direction.

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3};
use tracing::warn;

use crate::error::ErrCode;
use crate::fit_params::FitParams;
use crate::projection::Projection;

use super::Node;

/// Momentum magnitude used when a K-long comes without a usable seed (GeV).
const DEFAULT_KLONG_MOMENTUM: f64 = 1.0;

/// Photon: cluster position and energy.
#[derive(Debug, Clone)]
pub struct PhotonNode {
    position: Vector3<f64>,
    energy: f64,
    /// Covariance of (x, y, z, E)
    covariance: Matrix4<f64>,
}

/// K-long: cluster position only.
#[derive(Debug, Clone)]
pub struct KlongNode {
    position: Vector3<f64>,
    covariance: Matrix3<f64>,
    seed_momentum: f64,
}

/// Unit vector from `vertex` to `cluster`, falling back to the cluster
/// direction seen from the origin.
fn pointing(vertex: &Vector3<f64>, cluster: &Vector3<f64>) -> Option<Vector3<f64>> {
    let d = cluster - vertex;
    if d.norm() > 0.0 {
        Some(d.normalize())
    } else if cluster.norm() > 0.0 {
        Some(cluster.normalize())
    } else {
        None
    }
}

/// Fills the two pointing rows. Returns the Jacobian of those rows with
/// respect to the cluster position.
fn project_pointing(
    cluster: &Vector3<f64>,
    pos: usize,
    mom: usize,
    fp: &FitParams,
    p: &mut Projection,
) -> Option<SMatrix<f64, 2, 3>> {
    let vertex = fp.vector3(pos);
    let momentum = fp.vector3(mom);
    let d = cluster - vertex;

    let i1 = momentum.iamax();
    if momentum[i1] == 0.0 {
        return None;
    }
    let elim = d[i1] / momentum[i1];

    let mut jacobian = SMatrix::<f64, 2, 3>::zeros();
    for (row, ik) in [(0, (i1 + 1) % 3), (1, (i1 + 2) % 3)] {
        let ratio = momentum[ik] / momentum[i1];
        p.r[row] = d[ik] - momentum[ik] * elim;

        p.h[(row, pos + ik)] = -1.0;
        p.h[(row, pos + i1)] = ratio;
        p.h[(row, mom + ik)] = -elim;
        p.h[(row, mom + i1)] = ratio * elim;

        jacobian[(row, ik)] = 1.0;
        jacobian[(row, i1)] = -ratio;
    }
    Some(jacobian)
}

impl PhotonNode {
    pub fn new(position: Vector3<f64>, energy: f64, covariance: Matrix4<f64>) -> Self {
        Self { position, energy, covariance }
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    /// Points the momentum at the cluster with the measured energy.
    pub(crate) fn init_momentum(&self, node: &Node, fp: &mut FitParams) -> ErrCode {
        let (Some(pos), Some(mom)) = (node.pos_index, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let Some(direction) = pointing(&fp.vector3(pos), &self.position) else {
            return ErrCode::BAD_SETUP;
        };
        fp.set_vector3(mom, &(direction * self.energy));
        ErrCode::SUCCESS
    }

    /// Two pointing rows and `E − |p|`.
    pub(crate) fn project(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let (Some(pos), Some(mom)) = (node.pos_index, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let Some(pointing) = project_pointing(&self.position, pos, mom, fp, p) else {
            return ErrCode::FILTER_ERROR;
        };

        let momentum = fp.vector3(mom);
        let norm = momentum.norm();
        p.r[2] = self.energy - norm;
        for i in 0..3 {
            p.h[(2, mom + i)] = -momentum[i] / norm;
        }

        // Propagate the cluster covariance through the residuals
        let mut jacobian = SMatrix::<f64, 3, 4>::zeros();
        jacobian.fixed_view_mut::<2, 3>(0, 0).copy_from(&pointing);
        jacobian[(2, 3)] = 1.0;
        let v = jacobian * self.covariance * jacobian.transpose();
        for i in 0..3 {
            for j in 0..3 {
                p.v[(i, j)] = v[(i, j)];
            }
        }
        ErrCode::SUCCESS
    }
}

impl KlongNode {
    pub fn new(position: Vector3<f64>, covariance: Matrix3<f64>, seed_momentum: f64) -> Self {
        Self { position, covariance, seed_momentum }
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    /// Points the seed momentum at the cluster.
    pub(crate) fn init_momentum(&self, node: &Node, fp: &mut FitParams) -> ErrCode {
        let (Some(pos), Some(mom)) = (node.pos_index, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let Some(direction) = pointing(&fp.vector3(pos), &self.position) else {
            return ErrCode::BAD_SETUP;
        };
        let magnitude = if self.seed_momentum > 1e-6 {
            self.seed_momentum
        } else {
            warn!(
                "K-long without momentum seed, using {} GeV",
                DEFAULT_KLONG_MOMENTUM
            );
            DEFAULT_KLONG_MOMENTUM
        };
        fp.set_vector3(mom, &(direction * magnitude));
        ErrCode::SUCCESS
    }

    /// Two pointing rows; the magnitude is left to the other constraints.
    pub(crate) fn project(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let (Some(pos), Some(mom)) = (node.pos_index, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let Some(jacobian) = project_pointing(&self.position, pos, mom, fp, p) else {
            return ErrCode::FILTER_ERROR;
        };
        let v = jacobian * self.covariance * jacobian.transpose();
        for i in 0..2 {
            for j in 0..2 {
                p.v[(i, j)] = v[(i, j)];
            }
        }
        ErrCode::SUCCESS
    }
}
