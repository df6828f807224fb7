//! Composite carrying the result of an earlier vertex fit.

use crate::candidate::{Matrix7, Vector7};
use crate::constraint::ConstraintType;
use crate::error::ErrCode;
use crate::fit_params::FitParams;
use crate::projection::Projection;

use super::Node;

/// Pre-fitted composite, used as a measurement of its vertex and
/// four-momentum.
///
/// Short-lived composites have no vertex of their own and only their
/// four-momentum is constrained.
#[derive(Debug, Clone)]
pub struct MeasuredNode {
    params: Vector7,
    covariance: Matrix7,
    has_position: bool,
}

impl MeasuredNode {
    pub fn new(params: Vector7, covariance: Matrix7, has_position: bool) -> Self {
        Self { params, covariance, has_position }
    }

    pub fn has_position(&self) -> bool {
        self.has_position
    }

    pub fn params(&self) -> &Vector7 {
        &self.params
    }

    pub fn constraint_type(&self) -> ConstraintType {
        if self.has_position {
            ConstraintType::Composite
        } else {
            ConstraintType::Resonance
        }
    }

    pub fn dim(&self) -> usize {
        if self.has_position {
            7
        } else {
            4
        }
    }

    /// Copies the measured vertex and four-momentum into the state. A
    /// composite without its own vertex seeds the shared vertex if nothing
    /// else has.
    pub(crate) fn init_par(&self, node: &Node, fp: &mut FitParams) -> ErrCode {
        let Some(mom) = node.mom_index else {
            return ErrCode::BAD_SETUP;
        };
        let vertex = self.params.fixed_rows::<3>(0).into_owned();
        match (node.own_pos, node.pos_index) {
            (Some(pos), _) => fp.set_vector3(pos, &vertex),
            (None, Some(shared)) if fp.is_zero_block(shared, 3) => fp.set_vector3(shared, &vertex),
            _ => {}
        }
        for i in 0..4 {
            fp.state_mut()[mom + i] = self.params[3 + i];
        }
        ErrCode::SUCCESS
    }

    pub(crate) fn project(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let Some(mom) = node.mom_index else {
            return ErrCode::BAD_SETUP;
        };

        // Rows of the state that are measured, in measurement order
        let mut rows: Vec<(usize, usize)> = Vec::with_capacity(7);
        if self.has_position {
            let Some(pos) = node.own_pos else {
                return ErrCode::BAD_SETUP;
            };
            rows.extend((0..3).map(|i| (i, pos + i)));
        }
        rows.extend((0..4).map(|i| (3 + i, mom + i)));

        for (row, &(meas, state)) in rows.iter().enumerate() {
            p.r[row] = fp.par(state) - self.params[meas];
            p.h[(row, state)] = 1.0;
            for (col, &(meas_col, _)) in rows.iter().enumerate() {
                p.v[(row, col)] = self.covariance[(meas, meas_col)];
            }
        }
        ErrCode::SUCCESS
    }
}
