//! Constraints: the unit of work of the fit.
//!
//! Every node of the decay tree contributes a handful of constraints (its
//! measurement, momentum conservation at its vertex, its flight direction,
//! an optional mass hypothesis...). The driver sorts them once and then
//! filters them one after the other into the global state.
//!
//! # Processing order
//!
//! Order matters for a sequential non-linear filter: a constraint is
//! linearised at the state left behind by the previous ones. Two orderings
//! are provided:
//!
//! ```text
//!   DepthThenType   (depth, type)           deepest vertices first, types break ties
//!   ExternalByType  external: (type, depth)  beam/measurements early,
//!                   internal: (depth, type)  mass/lifetime late
//! ```
//!
//! The depth key of a constraint is minus the tree depth of its node, so
//! leaves are filtered before their mothers and the head comes last.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ErrCode, FitError};
use crate::fit_params::FitParams;
use crate::kalman::KalmanCalculator;
use crate::particle::NodeId;
use crate::projection::Projection;

/// Default absolute chi-square change that ends a constraint's inner loop.
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

/// Kind of constraint, in processing-priority order.
///
/// `Unknown` and `NTypes` are sentinels and never reach the filter.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintType {
    Unknown = 0,
    Beamspot,
    Beamenergy,
    Origin,
    Composite,
    Resonance,
    Track,
    Photon,
    Klong,
    Kinematic,
    Geometric,
    Mass,
    MassEnergy,
    Lifetime,
    Merged,
    Conversion,
    Helix,
    NTypes,
}

impl ConstraintType {
    /// Returns true for the `Unknown` and `NTypes` markers.
    pub fn is_sentinel(self) -> bool {
        self == ConstraintType::Unknown || self == ConstraintType::NTypes
    }

    /// Beam, measurement-of-composite and hypothesis constraints, which
    /// `ExternalByType` orders by type before depth.
    pub fn is_external(self) -> bool {
        self <= ConstraintType::Composite || self >= ConstraintType::Mass
    }

    /// Inner iterations allowed when nothing overrides it.
    pub fn default_max_iterations(self) -> usize {
        match self {
            ConstraintType::Geometric
            | ConstraintType::Conversion
            | ConstraintType::Photon
            | ConstraintType::Klong => 3,
            ConstraintType::Mass | ConstraintType::MassEnergy => 10,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConstraintType::Unknown => "unknown",
            ConstraintType::Beamspot => "beamspot",
            ConstraintType::Beamenergy => "beamenergy",
            ConstraintType::Origin => "origin",
            ConstraintType::Composite => "composite",
            ConstraintType::Resonance => "resonance",
            ConstraintType::Track => "track",
            ConstraintType::Photon => "photon",
            ConstraintType::Klong => "klong",
            ConstraintType::Kinematic => "kinematic",
            ConstraintType::Geometric => "geometric",
            ConstraintType::Mass => "mass",
            ConstraintType::MassEnergy => "mass_energy",
            ConstraintType::Lifetime => "lifetime",
            ConstraintType::Merged => "merged",
            ConstraintType::Conversion => "conversion",
            ConstraintType::Helix => "helix",
            ConstraintType::NTypes => "ntypes",
        }
    }
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Source of projections: evaluates a constraint owned by a tree node.
pub trait Projector {
    /// Fills `projection` with the residual, Jacobian and measurement
    /// covariance of `constraint` at `fitparams`.
    fn project_constraint(
        &self,
        constraint: &Constraint,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode;
}

/// How passes after the first linearise the constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStrategy {
    /// Re-project every constraint at the running state, iterating the
    /// non-linear ones.
    #[default]
    Relinearize,

    /// Project every constraint once at the state the pass started from.
    Reference,
}

/// One constraint equation block.
#[derive(Debug, Clone)]
pub struct Constraint {
    ctype: ConstraintType,
    node: Option<NodeId>,
    depth: i32,
    dim: usize,
    max_iterations: usize,
    tolerance: f64,
    chi_square: f64,
    iterations: usize,
    members: Vec<Constraint>,
    last_reference: Option<u64>,
    trace_iterations: bool,
}

impl Constraint {
    /// Creates a constraint owned by `node` with the type's default
    /// iteration cap.
    pub fn new(ctype: ConstraintType, node: NodeId, depth: i32, dim: usize) -> Self {
        Self {
            ctype,
            node: Some(node),
            depth,
            dim,
            max_iterations: ctype.default_max_iterations(),
            tolerance: DEFAULT_TOLERANCE,
            chi_square: 0.0,
            iterations: 0,
            members: Vec::new(),
            last_reference: None,
            trace_iterations: false,
        }
    }

    /// Stacks several constraints into one block that is filtered with a
    /// single gain calculation.
    pub fn merged(members: Vec<Constraint>) -> Self {
        let dim = members.iter().map(|c| c.dim).sum();
        let max_iterations = members.iter().map(|c| c.max_iterations).max().unwrap_or(1);
        let tolerance = members
            .iter()
            .map(|c| c.tolerance)
            .reduce(f64::min)
            .unwrap_or(DEFAULT_TOLERANCE);
        let trace_iterations = members.iter().any(|c| c.trace_iterations);
        Self {
            ctype: ConstraintType::Merged,
            node: None,
            depth: 0,
            dim,
            max_iterations,
            tolerance,
            chi_square: 0.0,
            iterations: 0,
            members,
            last_reference: None,
            trace_iterations,
        }
    }

    /// Overrides the inner iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Overrides the inner-loop convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Logs every inner iteration at trace level.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_iterations = enabled;
        self
    }

    pub fn constraint_type(&self) -> ConstraintType {
        self.ctype
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Sort key: minus the tree depth of the owning node.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Chi-square recorded by the last filter call.
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Inner iterations run by the last filter call.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Constraints stacked into a merged constraint.
    pub fn members(&self) -> &[Constraint] {
        &self.members
    }

    /// A constraint is treated as linear if one iteration suffices.
    pub fn is_linear(&self) -> bool {
        self.max_iterations <= 1
    }

    /// Evaluates the constraint at `fitparams`.
    pub fn project<P: Projector + ?Sized>(
        &self,
        projector: &P,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        if self.ctype.is_sentinel() {
            return ErrCode::BAD_SETUP;
        }

        if self.ctype == ConstraintType::Merged {
            let mut status = ErrCode::SUCCESS;
            let mut offset = 0;
            for member in &self.members {
                let mut sub = Projection::new(fitparams.dim(), member.dim);
                status |= member.project(projector, fitparams, &mut sub);
                if status.is_failure() {
                    return status;
                }
                projection.insert(&sub, offset);
                offset += member.dim;
            }
            return status;
        }

        if self.node.is_none() {
            return ErrCode::BAD_SETUP;
        }
        projector.project_constraint(self, fitparams, projection)
    }

    /// Evaluates the constraint at `reference` and moves the linearisation
    /// to `current`: `r += H (x − x_ref)`.
    pub fn project_with_reference<P: Projector + ?Sized>(
        &self,
        projector: &P,
        reference: &FitParams,
        current: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let status = self.project(projector, reference, projection);
        if !status.is_failure() {
            let delta = current.state() - reference.state();
            projection.r += &projection.h * delta;
        }
        status
    }

    /// Filters the constraint into the state, re-projecting at the updated
    /// state until the chi-square settles, starts to grow or the iteration
    /// cap is reached.
    pub fn filter<P: Projector + ?Sized>(
        &mut self,
        projector: &P,
        fitparams: &mut FitParams,
    ) -> ErrCode {
        let mut projection = Projection::new(fitparams.dim(), self.dim);
        let mut kalman = KalmanCalculator::new();
        let mut status = ErrCode::SUCCESS;

        let mut chisq = 0.0;
        let mut accumulated = 0.0;
        let mut iter = 0;
        let mut finished = false;

        self.last_reference = None;

        while !finished && !status.is_failure() {
            projection.reset();
            status |= self.project(projector, fitparams, &mut projection);
            if status.is_failure() {
                break;
            }

            status |= kalman.calculate_gain_matrix(
                &projection.r,
                &projection.h,
                fitparams,
                Some(&projection.v),
                1.0,
            );
            if status.is_failure() {
                break;
            }

            kalman.update_state(fitparams);
            if !fitparams.is_finite() {
                status |= ErrCode::FILTER_ERROR;
            }

            let new_chisq = kalman.chi_square();
            let dchisq = new_chisq - chisq;
            let diverging = iter > 0 && dchisq > 0.0;
            let converged = dchisq.abs() < self.tolerance;
            iter += 1;
            finished = iter >= self.max_iterations || diverging || converged;

            if diverging {
                status |= ErrCode::DIVERGING_CONSTRAINT;
            }
            if self.trace_iterations {
                trace!(
                    "{} node={:?} iter={} chi2={:.6} dchi2={:.6}",
                    self.ctype,
                    self.node,
                    iter,
                    new_chisq,
                    dchisq
                );
            }

            chisq = new_chisq;
            accumulated += new_chisq;
        }

        self.iterations = iter;
        self.chi_square = accumulated;
        fitparams.add_chi_square(accumulated, self.dim);

        if iter > 0 {
            kalman.update_covariance(fitparams);
        }
        status
    }

    /// Filters the constraint once, linearised at `reference`.
    ///
    /// Each constraint is applied at most once per reference; take a new
    /// snapshot before the next pass.
    pub fn filter_with_reference<P: Projector + ?Sized>(
        &mut self,
        projector: &P,
        reference: &FitParams,
        fitparams: &mut FitParams,
    ) -> ErrCode {
        debug_assert!(
            self.last_reference != Some(reference.reference_id()),
            "{} constraint filtered twice against the same reference",
            self.ctype
        );
        self.last_reference = Some(reference.reference_id());

        let mut projection = Projection::new(fitparams.dim(), self.dim);
        let mut status = self.project_with_reference(projector, reference, fitparams, &mut projection);
        if status.is_failure() {
            return status;
        }

        let mut kalman = KalmanCalculator::new();
        status |= kalman.calculate_gain_matrix(
            &projection.r,
            &projection.h,
            fitparams,
            Some(&projection.v),
            1.0,
        );
        if status.is_failure() {
            return status;
        }

        kalman.update_state(fitparams);
        if !fitparams.is_finite() {
            status |= ErrCode::FILTER_ERROR;
        }

        self.iterations = 1;
        self.chi_square = kalman.chi_square();
        fitparams.add_chi_square(self.chi_square, self.dim);
        kalman.update_covariance(fitparams);
        status
    }
}

/// Comparator deciding the processing order of constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOrdering {
    /// Shallow constraints first, ties broken by type.
    #[default]
    DepthThenType,

    /// Beam and hypothesis constraints by type, the rest by depth.
    ExternalByType,
}

impl ConstraintOrdering {
    pub fn compare(self, a: &Constraint, b: &Constraint) -> Ordering {
        let by_depth = (a.depth, a.ctype).cmp(&(b.depth, b.ctype));
        match self {
            ConstraintOrdering::DepthThenType => by_depth,
            ConstraintOrdering::ExternalByType => {
                if a.ctype.is_external() || b.ctype.is_external() {
                    (a.ctype, a.depth).cmp(&(b.ctype, b.depth))
                } else {
                    by_depth
                }
            }
        }
    }

    /// Strict "processed before" relation.
    pub fn less(self, a: &Constraint, b: &Constraint) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    /// Stable sort; equal keys keep their collection order.
    pub fn sort(self, constraints: &mut [Constraint]) -> Result<(), FitError> {
        if let Some(bad) = constraints.iter().find(|c| c.ctype.is_sentinel()) {
            return Err(FitError::bad_setup(format!(
                "constraint of type {} cannot be processed",
                bad.ctype
            )));
        }
        constraints.sort_by(|a, b| self.compare(a, b));
        Ok(())
    }
}

/// Keeps the linear constraints in place and stacks the non-linear ones into
/// one merged constraint filtered last.
pub fn merge_nonlinear(constraints: Vec<Constraint>) -> Vec<Constraint> {
    let (mut linear, nonlinear): (Vec<_>, Vec<_>) =
        constraints.into_iter().partition(|c| c.is_linear());
    if !nonlinear.is_empty() {
        linear.push(Constraint::merged(nonlinear));
    }
    linear
}
