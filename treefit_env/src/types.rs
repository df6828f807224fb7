//! Common types for the detector environment.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::EnvError;

/// Particle Data Group Monte Carlo particle code.
///
/// Negative codes denote antiparticles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PdgCode(pub i32);

impl PdgCode {
    pub const ELECTRON: PdgCode = PdgCode(11);
    pub const MUON: PdgCode = PdgCode(13);
    pub const PHOTON: PdgCode = PdgCode(22);
    pub const PI0: PdgCode = PdgCode(111);
    pub const RHO0: PdgCode = PdgCode(113);
    pub const K_LONG: PdgCode = PdgCode(130);
    pub const PION: PdgCode = PdgCode(211);
    pub const ETA: PdgCode = PdgCode(221);
    pub const OMEGA: PdgCode = PdgCode(223);
    pub const K_SHORT: PdgCode = PdgCode(310);
    pub const K_STAR0: PdgCode = PdgCode(313);
    pub const KAON: PdgCode = PdgCode(321);
    pub const PHI: PdgCode = PdgCode(333);
    pub const D_PLUS: PdgCode = PdgCode(411);
    pub const D_STAR_PLUS: PdgCode = PdgCode(413);
    pub const D0: PdgCode = PdgCode(421);
    pub const DS_PLUS: PdgCode = PdgCode(431);
    pub const JPSI: PdgCode = PdgCode(443);
    pub const B0: PdgCode = PdgCode(511);
    pub const B_PLUS: PdgCode = PdgCode(521);
    pub const PROTON: PdgCode = PdgCode(2212);
    pub const LAMBDA: PdgCode = PdgCode(3122);
    pub const UPSILON_4S: PdgCode = PdgCode(300553);

    /// Returns the code of the charge-conjugate particle.
    pub fn conjugate(self) -> Self {
        PdgCode(-self.0)
    }

    /// Returns the unsigned code shared by particle and antiparticle.
    pub fn abs(self) -> Self {
        PdgCode(self.0.abs())
    }

    /// Returns true for antiparticle codes.
    pub fn is_anti(self) -> bool {
        self.0 < 0
    }
}

impl From<i32> for PdgCode {
    fn from(code: i32) -> Self {
        PdgCode(code)
    }
}

impl std::fmt::Display for PdgCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static properties of a particle species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleProperties {
    /// PDG code (sign selects particle or antiparticle)
    pub pdg: PdgCode,

    /// Human readable name, e.g. "K_S0"
    pub name: String,

    /// Nominal mass in GeV
    pub mass: f64,

    /// Total width in GeV (zero for weakly decaying or stable particles)
    pub width: f64,

    /// Mean decay length c·tau in cm (infinite for stable particles)
    pub ctau: f64,

    /// Electric charge in units of e
    pub charge: i32,
}

impl ParticleProperties {
    /// Returns true if the particle does not decay inside the detector.
    pub fn is_stable(&self) -> bool {
        !self.ctau.is_finite()
    }

    /// Returns true if the particle is charged.
    pub fn is_charged(&self) -> bool {
        self.charge != 0
    }
}

/// Luminous region: mean interaction point and its size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSpot {
    /// Mean interaction point [x, y, z] in cm
    pub position: Vector3<f64>,

    /// Spread of the interaction point in cm²
    pub covariance: Matrix3<f64>,
}

impl BeamSpot {
    /// Creates a beam spot, rejecting covariances that are not usable as an
    /// error matrix.
    pub fn new(position: Vector3<f64>, covariance: Matrix3<f64>) -> Result<Self, EnvError> {
        if (covariance - covariance.transpose()).abs().max() > 1e-12 * covariance.abs().max() {
            return Err(EnvError::beam_spot("covariance is not symmetric"));
        }
        if (0..3).any(|i| !(covariance[(i, i)] > 0.0)) {
            return Err(EnvError::beam_spot("covariance diagonal must be positive"));
        }
        if covariance.cholesky().is_none() {
            return Err(EnvError::beam_spot("covariance is not positive definite"));
        }
        Ok(Self { position, covariance })
    }

    /// Creates an uncorrelated beam spot from its Gaussian widths (cm).
    pub fn from_widths(position: Vector3<f64>, sigma: Vector3<f64>) -> Result<Self, EnvError> {
        Self::new(position, Matrix3::from_diagonal(&sigma.component_mul(&sigma)))
    }
}

/// Four-momentum of the colliding-beam system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamKinematics {
    /// [px, py, pz, E] in GeV
    pub four_momentum: Vector4<f64>,

    /// Covariance of the four-momentum in GeV²
    pub covariance: Matrix4<f64>,
}

impl BeamKinematics {
    /// Creates beam kinematics from a four-momentum and its covariance.
    pub fn new(four_momentum: Vector4<f64>, covariance: Matrix4<f64>) -> Self {
        Self {
            four_momentum,
            covariance,
        }
    }

    /// Centre-of-mass energy of the collision.
    pub fn invariant_mass(&self) -> f64 {
        let p = &self.four_momentum;
        let m2 = p[3] * p[3] - p.xyz().norm_squared();
        m2.max(0.0).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pdg_conjugate() {
        assert_eq!(PdgCode::KAON.conjugate(), PdgCode(-321));
        assert!(PdgCode(-211).is_anti());
        assert_eq!(PdgCode(-211).abs(), PdgCode::PION);
    }

    #[test]
    fn test_beam_spot_rejects_bad_covariance() {
        let bad = Matrix3::from_diagonal(&Vector3::new(1e-6, 0.0, 1e-3));
        assert!(BeamSpot::new(Vector3::zeros(), bad).is_err());

        let good = BeamSpot::from_widths(Vector3::zeros(), Vector3::new(1e-3, 1e-4, 3.5e-2));
        assert!(good.is_ok());
    }

    #[test]
    fn test_beam_invariant_mass() {
        let beam = BeamKinematics::new(Vector4::new(0.0, 0.0, 3.0, 5.0), Matrix4::identity());
        assert_relative_eq!(beam.invariant_mass(), 4.0, epsilon = 1e-12);
    }
}
