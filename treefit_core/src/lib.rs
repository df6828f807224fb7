//! TreeFit Core - global Kalman-filter fit of particle decay trees
//!
//! Fits a whole reconstructed decay chain at once: every vertex, momentum
//! and flight length of the tree lives in one state vector, and every
//! physical requirement is a constraint filtered into it.
//!
//! 1. **Tree**: the candidate becomes an arena of nodes, each owning a block
//!    of the state ([`particle`])
//! 2. **Constraints**: measurements, momentum conservation, vertex
//!    displacement and mass hypotheses, filtered in a fixed order
//!    ([`constraint`], [`kalman`])
//! 3. **Driver**: repeated passes until the chi-square settles ([`fitter`])
//!
//! # Example
//!
//! ```ignore
//! use treefit_core::{FitConfig, Fitter, Particle};
//! use treefit_env::{PdgCode, StaticDetector};
//!
//! let detector = StaticDetector::new();
//! let ks = Particle::composite(PdgCode::K_SHORT, vec![pi_plus, pi_minus]);
//! let mut fitter = Fitter::new(ks, FitConfig::default());
//! fitter.fit(&detector)?;
//! let head = fitter.head_result().unwrap();
//! println!("m = {:.4} ± {:.4} GeV", head.mass, head.mass_error);
//! ```

pub mod candidate;
pub mod config;
pub mod constraint;
pub mod decay_chain;
pub mod error;
pub mod fit_params;
pub mod fitter;
pub mod helix;
pub mod kalman;
pub mod particle;
pub mod projection;

pub use candidate::{FitQuality, Matrix7, Measurement, Particle, Vector7};
pub use config::{BeamConstraint, FitConfig};
pub use constraint::{Constraint, ConstraintOrdering, ConstraintType, FilterStrategy};
pub use decay_chain::DecayChain;
pub use error::{ErrCode, FitError};
pub use fit_params::FitParams;
pub use fitter::{FitStatus, Fitter, NodeResult};
pub use helix::Helix;
pub use particle::{NodeId, RoleKind};
