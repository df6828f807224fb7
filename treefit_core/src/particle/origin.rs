//! Production point of the head particle.

use nalgebra::{Matrix3, Vector3};
use treefit_env::BeamSpot;

use super::{Node, NodeId, Role, Tree};
use crate::config::BeamConstraint;
use crate::constraint::ConstraintType;
use crate::error::ErrCode;
use crate::fit_params::FitParams;
use crate::projection::Projection;

/// Root pseudo-particle tied to the beam spot or a user-supplied point.
#[derive(Debug, Clone)]
pub struct OriginNode {
    position: Vector3<f64>,
    covariance: Matrix3<f64>,
    transverse: bool,
    ctype: ConstraintType,
}

impl OriginNode {
    /// Creates the origin requested by `beam`, or `None` if no beam
    /// constraint is configured.
    pub fn from_config(beam: &BeamConstraint, beam_spot: &BeamSpot) -> Option<Self> {
        match beam {
            BeamConstraint::None => None,
            BeamConstraint::BeamSpot => Some(Self {
                position: beam_spot.position,
                covariance: beam_spot.covariance,
                transverse: false,
                ctype: ConstraintType::Beamspot,
            }),
            BeamConstraint::BeamSpotTransverse => Some(Self {
                position: beam_spot.position,
                covariance: beam_spot.covariance,
                transverse: true,
                ctype: ConstraintType::Beamspot,
            }),
            BeamConstraint::Origin { position, covariance } => Some(Self {
                position: *position,
                covariance: *covariance,
                transverse: false,
                ctype: ConstraintType::Origin,
            }),
        }
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn constraint_type(&self) -> ConstraintType {
        self.ctype
    }

    /// Number of constrained coordinates.
    pub fn dim(&self) -> usize {
        if self.transverse {
            2
        } else {
            3
        }
    }

    pub(crate) fn project(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let Some(pos) = node.own_pos else {
            return ErrCode::BAD_SETUP;
        };
        let n = self.dim();
        for i in 0..n {
            p.r[i] = fp.par(pos + i) - self.position[i];
            p.h[(i, pos + i)] = 1.0;
            for j in 0..n {
                p.v[(i, j)] = self.covariance[(i, j)];
            }
        }
        ErrCode::SUCCESS
    }
}

impl Tree {
    /// Places the origin at its nominal point and seeds the head.
    pub(super) fn init_origin(&mut self, id: NodeId, fp: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        let (Some(pos), Role::Origin(origin)) = (node.own_pos, &node.role) else {
            return ErrCode::BAD_SETUP;
        };
        let position = origin.position;
        fp.set_vector3(pos, &position);

        let daughters = node.daughters.clone();
        let mut status = ErrCode::SUCCESS;
        for &d in &daughters {
            status |= self.init_par1(d, fp);
        }
        for &d in &daughters {
            status |= self.init_par2(d, fp);
        }
        status
    }
}
