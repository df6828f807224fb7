//! Charged track measured as a helix.

use nalgebra::{Matrix5, Vector3};

use crate::error::ErrCode;
use crate::fit_params::FitParams;
use crate::helix::{helix_from_vertex, wrap_angle, Helix};
use crate::projection::Projection;

use super::Node;

/// Final-state charged particle.
///
/// Its momentum at the production vertex is a parameter; the vertex belongs
/// to the mother. The measured helix is compared with the helix through that
/// vertex with that momentum.
#[derive(Debug, Clone)]
pub struct TrackNode {
    helix: Helix,
    covariance: Matrix5<f64>,
    kappa: f64,
    flight_length: f64,
}

impl TrackNode {
    pub fn new(helix: Helix, covariance: Matrix5<f64>, kappa: f64) -> Self {
        Self { helix, covariance, kappa, flight_length: 0.0 }
    }

    pub fn helix(&self) -> &Helix {
        &self.helix
    }

    pub fn covariance(&self) -> &Matrix5<f64> {
        &self.covariance
    }

    /// Transverse arc length from the perigee to the production vertex.
    pub fn flight_length(&self) -> f64 {
        self.flight_length
    }

    pub fn set_flight_length(&mut self, flight_length: f64) {
        self.flight_length = flight_length;
    }

    /// Moves the flight length to the point of the helix nearest `vertex`.
    pub fn update_flight_length(&mut self, vertex: &Vector3<f64>) {
        self.flight_length = self.helix.arc_length_to(vertex.x, vertex.y);
    }

    pub fn transverse_momentum(&self) -> f64 {
        self.helix.transverse_momentum(self.kappa)
    }

    /// Position and momentum on the measured helix at the flight length.
    pub fn trajectory_point(&self) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.helix.position_at(self.flight_length),
            self.helix.momentum_at(self.flight_length, self.kappa),
        )
    }

    /// Seeds the momentum from the measured helix at the flight length.
    pub(crate) fn init_momentum(&self, node: &Node, fp: &mut FitParams) -> ErrCode {
        let Some(mom) = node.mom_index else {
            return ErrCode::BAD_SETUP;
        };
        let (_, momentum) = self.trajectory_point();
        fp.set_vector3(mom, &momentum);
        ErrCode::SUCCESS
    }

    /// Residual `h(x, p) − h_measured` with the Jacobian of the helix
    /// parameters on the production vertex and the momentum.
    pub(crate) fn project(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let (Some(pos), Some(mom)) = (node.pos_index, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let vertex = fp.vector3(pos);
        let momentum = fp.vector3(mom);
        if momentum.x == 0.0 && momentum.y == 0.0 {
            return ErrCode::FILTER_ERROR;
        }

        let (helix, _, jacobian) = helix_from_vertex(&vertex, &momentum, self.kappa);
        let mut residual = helix.to_vector() - self.helix.to_vector();
        residual[1] = wrap_angle(residual[1]);

        for row in 0..5 {
            p.r[row] = residual[row];
            for col in 0..3 {
                p.h[(row, pos + col)] = jacobian[(row, col)];
                p.h[(row, mom + col)] = jacobian[(row, col + 3)];
            }
            for col in 0..5 {
                p.v[(row, col)] = self.covariance[(row, col)];
            }
        }
        ErrCode::SUCCESS
    }
}
