//! TreeFit Environment Layer
//!
//! Everything the fitter needs to know about the world outside the decay
//! tree lives behind the [`DetectorContext`] trait:
//! - Magnetic field along the solenoid axis (Tesla)
//! - Beam spot position and size (cm)
//! - Beam four-momentum (GeV)
//! - Particle properties keyed by PDG code
//!
//! The fitter never reads detector constants directly, so the same fit runs
//! against a real conditions source or the fixed [`StaticDetector`] used by
//! the simulation harness and the tests.
//!
//! # Example
//!
//! ```ignore
//! use treefit_env::{DetectorContext, PdgCode, StaticDetector};
//!
//! let detector = StaticDetector::new().with_bfield(1.5);
//! let ks = detector.particle(PdgCode::K_SHORT)?;
//! assert!(ks.ctau > 2.0);
//! ```

mod context;
mod error;
mod particle_table;
mod static_impl;
mod types;

pub use context::DetectorContext;
pub use error::EnvError;
pub use particle_table::ParticleTable;
pub use static_impl::StaticDetector;
pub use types::{BeamKinematics, BeamSpot, ParticleProperties, PdgCode};

/// Curvature constant: transverse momentum in GeV per Tesla per cm of radius
/// for unit charge.
pub const BFIELD_CONVERSION: f64 = 0.00299792458;
