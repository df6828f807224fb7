//! Global fit driver.
//!
//! ```text
//!   Uninitialized ──build──▶ TreeBuilt ──fit──▶ Iterating(1..n)
//!                                                  │
//!        ┌──────────────┬──────────────────┬───────┴──────┐
//!        ▼              ▼                  ▼              ▼
//!    Converged  MaxIterationsReached    Diverged        Failed
//! ```
//!
//! Every pass filters all constraints once. The fit has converged when the
//! total chi-square changes by less than `dchisq_converged`, or by less than
//! `precision` relative to its value.

use nalgebra::{DMatrix, Matrix3, Matrix4, SMatrix, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, warn};
use treefit_env::{DetectorContext, PdgCode};

use crate::candidate::{FitQuality, Matrix7, Particle};
use crate::config::FitConfig;
use crate::constraint::FilterStrategy;
use crate::decay_chain::DecayChain;
use crate::error::{ErrCode, FitError};
use crate::fit_params::FitParams;
use crate::particle::{Node, NodeId, RoleKind};

/// Speed of light in cm/ps.
const SPEED_OF_LIGHT: f64 = 0.029_979_245_8;

/// Where the fit is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Uninitialized,
    TreeBuilt,
    /// Running the given pass (1-based)
    Iterating(usize),
    Converged,
    MaxIterationsReached,
    Diverged,
    Failed,
}

impl FitStatus {
    /// Returns true once the fit has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FitStatus::Converged
                | FitStatus::MaxIterationsReached
                | FitStatus::Diverged
                | FitStatus::Failed
        )
    }

    /// Returns true if the fitted values can be used.
    pub fn has_result(self) -> bool {
        self.is_terminal() && self != FitStatus::Failed
    }
}

/// Fitted quantities of one particle.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    pub id: NodeId,
    pub pdg: PdgCode,
    pub name: String,
    pub kind: RoleKind,

    /// Decay vertex, or production vertex for particles without their own
    pub vertex: Option<Vector3<f64>>,
    pub vertex_covariance: Option<Matrix3<f64>>,

    /// (px, py, pz, E)
    pub momentum: Vector4<f64>,
    pub momentum_covariance: Matrix4<f64>,

    /// Covariance of (x, y, z, px, py, pz, E)
    pub covariance: Matrix7,

    pub mass: f64,
    pub mass_error: f64,

    /// Distance between production and decay vertex (cm)
    pub decay_length: Option<f64>,
    pub decay_length_error: Option<f64>,

    /// Proper decay time (ps)
    pub proper_time: Option<f64>,
    pub proper_time_error: Option<f64>,

    /// Chi-square of the measurements in this subtree
    pub chi_square: f64,
}

/// Variance of a linear combination of state parameters.
fn propagate(cov: &DMatrix<f64>, gradient: &[(usize, f64)]) -> f64 {
    gradient
        .iter()
        .flat_map(|&(i, gi)| gradient.iter().map(move |&(j, gj)| gi * gj * cov[(i, j)]))
        .sum()
}

/// Decay-tree fitter for one candidate.
#[derive(Debug)]
pub struct Fitter {
    candidate: Particle,
    config: FitConfig,
    chain: Option<DecayChain>,
    fitparams: Option<FitParams>,
    status: FitStatus,
    err_code: ErrCode,
    chi_square: f64,
    passes: usize,
    history: Vec<f64>,
}

impl Fitter {
    pub fn new(candidate: Particle, config: FitConfig) -> Self {
        Self {
            candidate,
            config,
            chain: None,
            fitparams: None,
            status: FitStatus::Uninitialized,
            err_code: ErrCode::SUCCESS,
            chi_square: 0.0,
            passes: 0,
            history: Vec::new(),
        }
    }

    /// Builds the decay chain without fitting.
    pub fn build(&mut self, ctx: &dyn DetectorContext) -> Result<(), FitError> {
        if self.status != FitStatus::Uninitialized {
            return Err(FitError::invalid_state(format!(
                "tree already built (status {:?})",
                self.status
            )));
        }
        self.config.validate()?;
        let chain = DecayChain::new(&self.candidate, ctx, &self.config)?;
        debug!(
            "{}: {} parameters, {} constraints, ndf {}",
            self.candidate.pdg,
            chain.dim(),
            chain.constraints().len(),
            chain.ndf()
        );
        self.chain = Some(chain);
        self.status = FitStatus::TreeBuilt;
        Ok(())
    }

    /// Runs the fit. Can be called once per fitter.
    pub fn fit(&mut self, ctx: &dyn DetectorContext) -> Result<FitStatus, FitError> {
        match self.status {
            FitStatus::Uninitialized => self.build(ctx)?,
            FitStatus::TreeBuilt => {}
            other => {
                return Err(FitError::invalid_state(format!(
                    "fit already run (status {:?})",
                    other
                )))
            }
        }
        let Some(chain) = self.chain.as_mut() else {
            return Err(FitError::invalid_state("decay chain missing after build"));
        };

        let mut fp = FitParams::new(chain.dim());
        let mut status = chain.init_par(&mut fp);
        if status.is_failure() {
            warn!("{}: initialisation failed: {}", self.candidate.pdg, status);
            self.err_code = status;
            self.status = FitStatus::Failed;
            self.fitparams = Some(fp);
            return Ok(self.status);
        }

        let mut outcome = FitStatus::MaxIterationsReached;
        let mut previous = 0.0;
        let mut diverging_passes = 0;

        for pass in 0..self.config.max_passes {
            self.status = FitStatus::Iterating(pass + 1);

            let pass_status = if pass == 0 || self.config.strategy == FilterStrategy::Relinearize {
                chain.filter(&mut fp, pass == 0)
            } else {
                let reference = fp.snapshot();
                chain.filter_with_reference(&reference, &mut fp)
            };
            status |= pass_status;

            let chisq = fp.chi_square();
            self.history.push(chisq);
            self.passes = pass + 1;

            if !chisq.is_finite() {
                status |= ErrCode::FAST_DIVERGENCE;
            }
            if status.is_failure() {
                outcome = FitStatus::Failed;
                break;
            }

            let dchisq = chisq - previous;
            if self.config.verbosity >= 2 {
                debug!("pass {}: chi2 {:.6} dchi2 {:.6} status {}", pass + 1, chisq, dchisq, pass_status);
            }

            // A stable chi-square converges whatever its size; the
            // per-ndf limit below catches fits stuck at a large value.
            if dchisq.abs() < self.config.dchisq_converged
                || (chisq > 0.0 && dchisq.abs() < self.config.precision * chisq)
            {
                outcome = FitStatus::Converged;
                break;
            }
            if pass > 0 && dchisq > 0.0 {
                diverging_passes += 1;
                if diverging_passes >= self.config.max_diverging_passes {
                    status |= ErrCode::SLOW_DIVERGENCE;
                    outcome = FitStatus::Diverged;
                    break;
                }
            } else {
                diverging_passes = 0;
            }
            previous = chisq;
        }

        if outcome == FitStatus::MaxIterationsReached {
            status |= ErrCode::NON_CONVERGENCE;
        }
        let ndf = chain.ndf();
        if outcome == FitStatus::Converged
            && ndf > 0
            && fp.chi_square() > self.config.max_chi2_per_ndf * ndf as f64
        {
            warn!(
                "{}: converged with chi2 {:.1} for {} degrees of freedom",
                self.candidate.pdg,
                fp.chi_square(),
                ndf
            );
            status |= ErrCode::LARGE_CHI_SQUARE;
        }
        if outcome != FitStatus::Failed && self.config.force_p4_sum {
            chain.force_p4_sum(&mut fp);
        }

        self.chi_square = fp.chi_square();
        self.err_code = status;
        self.status = outcome;
        self.fitparams = Some(fp);

        if self.config.verbosity >= 1 {
            debug!(
                "{}: {:?} after {} passes, chi2 {:.4} ndf {} ({})",
                self.candidate.pdg, outcome, self.passes, self.chi_square, self.ndf(), status
            );
        }
        Ok(outcome)
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    /// Flags accumulated over the fit.
    pub fn err_code(&self) -> ErrCode {
        self.err_code
    }

    /// Total chi-square of the last pass.
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Chi-square after each pass.
    pub fn chi_square_history(&self) -> &[f64] {
        &self.history
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Degrees of freedom, available once the tree is built.
    pub fn ndf(&self) -> i64 {
        self.chain.as_ref().map_or(0, DecayChain::ndf)
    }

    /// Upper tail probability of the chi-square, if the fit has a result
    /// and positive degrees of freedom.
    pub fn p_value(&self) -> Option<f64> {
        if !self.status.has_result() || self.ndf() <= 0 {
            return None;
        }
        let dist = ChiSquared::new(self.ndf() as f64).ok()?;
        Some(dist.sf(self.chi_square))
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn candidate(&self) -> &Particle {
        &self.candidate
    }

    pub fn chain(&self) -> Option<&DecayChain> {
        self.chain.as_ref()
    }

    /// Final state vector and covariance.
    pub fn fit_params(&self) -> Option<&FitParams> {
        self.fitparams.as_ref()
    }

    /// Fitted quantities of one node.
    pub fn result(&self, id: NodeId) -> Option<NodeResult> {
        let chain = self.chain.as_ref()?;
        let fp = self.fitparams.as_ref()?;
        let node = chain.tree().node(id)?;
        let mom = node.mom_index()?;

        let mut jacobian = DMatrix::<f64>::zeros(7, fp.dim());
        if let Some(pos) = node.pos_index() {
            for i in 0..3 {
                jacobian[(i, pos + i)] = 1.0;
            }
        }
        for i in 0..3 {
            jacobian[(3 + i, mom + i)] = 1.0;
        }
        let momentum = node.four_momentum(fp)?;
        if node.has_energy() {
            jacobian[(6, mom + 3)] = 1.0;
        } else if momentum[3] > 0.0 {
            for i in 0..3 {
                jacobian[(6, mom + i)] = momentum[i] / momentum[3];
            }
        }
        let full = &jacobian * fp.covariance() * jacobian.transpose();
        let covariance = Matrix7::from_fn(|r, c| full[(r, c)]);
        let momentum_covariance: Matrix4<f64> = covariance.fixed_view::<4, 4>(3, 3).into_owned();

        let vertex = node.pos_index().map(|pos| fp.vector3(pos));
        let vertex_covariance = vertex.map(|_| covariance.fixed_view::<3, 3>(0, 0).into_owned());

        let (mass, mass_error) = invariant_mass(&momentum, &momentum_covariance);
        let (decay_length, decay_length_error) = match decay_length(node, fp) {
            Some((l, e)) => (Some(l), Some(e)),
            None => (None, None),
        };
        let (proper_time, proper_time_error) = match node.tau_index() {
            Some(tau) if node.mass() > 0.0 => (
                Some(fp.par(tau) * node.mass() / SPEED_OF_LIGHT),
                Some(fp.error(tau) * node.mass() / SPEED_OF_LIGHT),
            ),
            _ => (None, None),
        };

        Some(NodeResult {
            id,
            pdg: node.pdg(),
            name: node.name().to_string(),
            kind: node.kind(),
            vertex,
            vertex_covariance,
            momentum,
            momentum_covariance,
            covariance,
            mass,
            mass_error,
            decay_length,
            decay_length_error,
            proper_time,
            proper_time_error,
            chi_square: chain.chi_square(id, fp),
        })
    }

    /// Fitted quantities of the head particle.
    pub fn head_result(&self) -> Option<NodeResult> {
        self.result(self.chain.as_ref()?.tree().head())
    }

    /// Fitted quantities of every particle, in tree order.
    pub fn results(&self) -> Vec<NodeResult> {
        let Some(chain) = self.chain.as_ref() else {
            return Vec::new();
        };
        chain
            .tree()
            .nodes()
            .iter()
            .filter_map(|n| self.result(n.id()))
            .collect()
    }

    /// Copies the fitted vertex, momentum and covariance back into
    /// `candidate`: the head only, or every particle with
    /// `update_daughters`.
    pub fn update_candidate(&self, candidate: &mut Particle) -> Result<(), FitError> {
        if !self.status.has_result() {
            return Err(match self.status {
                FitStatus::Failed => FitError::Filter(self.err_code),
                other => FitError::invalid_state(format!("no fit result (status {:?})", other)),
            });
        }
        let Some(chain) = self.chain.as_ref() else {
            return Err(FitError::invalid_state("decay chain missing"));
        };
        let tree = chain.tree();

        let targets: Vec<&Node> = if self.config.update_daughters {
            tree.nodes().iter().filter(|n| n.candidate_path().is_some()).collect()
        } else {
            tree.node(tree.head()).into_iter().collect()
        };

        for node in targets {
            let Some(path) = node.candidate_path() else {
                continue;
            };
            let Some(result) = self.result(node.id()) else {
                continue;
            };
            let particle = candidate.descendant_mut(path).ok_or_else(|| {
                FitError::bad_setup(format!("candidate has no particle at {:?}", path))
            })?;
            particle.vertex = result.vertex;
            particle.momentum = result.momentum;
            particle.error_matrix = Some(result.covariance);
        }

        candidate.fit_quality = Some(FitQuality {
            chi_square: self.chi_square,
            ndf: self.ndf(),
            p_value: self.p_value(),
        });
        Ok(())
    }
}

/// Invariant mass and its error.
fn invariant_mass(p: &Vector4<f64>, cov: &Matrix4<f64>) -> (f64, f64) {
    let m2 = p[3] * p[3] - p.fixed_rows::<3>(0).norm_squared();
    let gradient = SMatrix::<f64, 1, 4>::new(-2.0 * p[0], -2.0 * p[1], -2.0 * p[2], 2.0 * p[3]);
    let var_m2 = (gradient * cov * gradient.transpose())[(0, 0)].max(0.0);
    if m2 > 0.0 {
        let m = m2.sqrt();
        (m, var_m2.sqrt() / (2.0 * m))
    } else {
        (-(-m2).sqrt(), 0.0)
    }
}

/// Decay length `tau·|p|` and its error.
fn decay_length(node: &Node, fp: &FitParams) -> Option<(f64, f64)> {
    let tau_index = node.tau_index()?;
    let mom = node.mom_index()?;
    let p = fp.vector3(mom);
    let norm = p.norm();
    let tau = fp.par(tau_index);
    if norm == 0.0 {
        return None;
    }

    let mut gradient = vec![(tau_index, norm)];
    gradient.extend((0..3).map(|i| (mom + i, tau * p[i] / norm)));
    let variance = propagate(fp.covariance(), &gradient).max(0.0);
    Some((tau * norm, variance.sqrt()))
}
