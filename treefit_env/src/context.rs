//! Detector context trait consumed by the fitter.

use crate::types::{BeamKinematics, BeamSpot, ParticleProperties, PdgCode};
use crate::{EnvError, ParticleTable, BFIELD_CONVERSION};

/// The fitter's view of the detector.
///
/// # Implementations
///
/// - **Fixed constants**: `StaticDetector` - values set once at construction
///
/// A conditions-database backed implementation only needs to answer the same
/// four questions for the run being processed.
pub trait DetectorContext: Send + Sync {
    /// Solenoid field along +z in Tesla.
    fn bfield(&self) -> f64;

    /// Luminous region used by the beam spot constraint.
    fn beam_spot(&self) -> &BeamSpot;

    /// Four-momentum of the colliding system used by the beam energy
    /// constraint.
    fn beam_kinematics(&self) -> &BeamKinematics;

    /// Particle property table.
    fn particle_table(&self) -> &ParticleTable;

    /// Looks up the properties of a particle species.
    fn particle(&self, pdg: PdgCode) -> Result<ParticleProperties, EnvError> {
        self.particle_table().lookup(pdg)
    }

    /// Bending constant `a·B·q` in GeV/cm for a particle of the given charge.
    ///
    /// A charged particle's transverse momentum direction turns by this many
    /// radians per GeV⁻¹·cm of flight parameter.
    fn bending_constant(&self, charge: f64) -> f64 {
        BFIELD_CONVERSION * self.bfield() * charge
    }
}
