//! Decay chain: the node tree together with its sorted constraint list.

use tracing::debug;
use treefit_env::DetectorContext;

use crate::candidate::Particle;
use crate::config::FitConfig;
use crate::constraint::{merge_nonlinear, Constraint};
use crate::error::{ErrCode, FitError};
use crate::fit_params::FitParams;
use crate::particle::{NodeId, Tree};

/// Variance inflation applied at the start of every pass.
const COVARIANCE_RESET_SCALE: f64 = 1000.0;

/// Tree plus constraints in processing order.
#[derive(Debug, Clone)]
pub struct DecayChain {
    tree: Tree,
    constraints: Vec<Constraint>,
}

impl DecayChain {
    /// Builds the tree, collects its constraints and sorts them.
    pub fn new(
        candidate: &Particle,
        ctx: &dyn DetectorContext,
        config: &FitConfig,
    ) -> Result<Self, FitError> {
        let tree = Tree::build(candidate, ctx, config)?;
        let mut constraints = tree.constraints(config);
        config.ordering.sort(&mut constraints)?;
        if config.merge_nonlinear {
            constraints = merge_nonlinear(constraints);
        }

        if config.verbosity >= 1 {
            for c in &constraints {
                debug!(
                    "constraint {} node={:?} depth={} dim={} max_iter={}",
                    c.constraint_type(),
                    c.node(),
                    c.depth(),
                    c.dim(),
                    c.max_iterations()
                );
            }
        }

        Ok(Self { tree, constraints })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Constraints in processing order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Size of the state vector.
    pub fn dim(&self) -> usize {
        self.tree.dim()
    }

    /// Constraint equations minus free parameters.
    pub fn ndf(&self) -> i64 {
        let equations: usize = self.constraints.iter().map(Constraint::dim).sum();
        equations as i64 - self.dim() as i64
    }

    /// Seeds the state from the measurements.
    pub fn init_par(&mut self, fp: &mut FitParams) -> ErrCode {
        self.tree.init_par(fp)
    }

    fn reset_covariance(&self, fp: &mut FitParams, first_pass: bool) {
        fp.reset_covariance(COVARIANCE_RESET_SCALE);
        if first_pass || !fp.test_covariance() {
            self.tree.init_cov(fp);
        }
        fp.record_variance_scale();
    }

    /// One pass, re-linearising every constraint at the running state.
    pub fn filter(&mut self, fp: &mut FitParams, first_pass: bool) -> ErrCode {
        self.reset_covariance(fp, first_pass);

        let mut status = ErrCode::SUCCESS;
        for constraint in &mut self.constraints {
            status |= constraint.filter(&self.tree, fp);
            if status.is_failure() {
                debug!("{} constraint failed: {}", constraint.constraint_type(), status);
                break;
            }
        }
        status
    }

    /// One pass, linearising every constraint at `reference`.
    pub fn filter_with_reference(&mut self, reference: &FitParams, fp: &mut FitParams) -> ErrCode {
        self.reset_covariance(fp, false);

        let mut status = ErrCode::SUCCESS;
        for constraint in &mut self.constraints {
            status |= constraint.filter_with_reference(&self.tree, reference, fp);
            if status.is_failure() {
                debug!("{} constraint failed: {}", constraint.constraint_type(), status);
                break;
            }
        }
        status
    }

    /// Enforces exact momentum sums at every vertex.
    pub fn force_p4_sum(&self, fp: &mut FitParams) {
        self.tree.force_p4_sum(fp);
    }

    /// Measurement chi-square of the subtree of `id`.
    pub fn chi_square(&self, id: NodeId, fp: &FitParams) -> f64 {
        self.tree.node_chi_square(id, fp)
    }
}
