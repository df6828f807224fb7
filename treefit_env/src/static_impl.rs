//! Fixed-constant implementation of DetectorContext.

use nalgebra::{Matrix4, Vector3, Vector4};

use crate::types::{BeamKinematics, BeamSpot};
use crate::{DetectorContext, EnvError, ParticleTable};

/// Detector with constants fixed at construction.
///
/// Defaults describe a Belle II-like nano-beam collider: 1.5 T solenoid,
/// a flat luminous region centred on the origin and asymmetric 7 GeV / 4 GeV
/// beams colliding at the Upsilon(4S).
#[derive(Debug, Clone)]
pub struct StaticDetector {
    /// Solenoid field in Tesla
    bfield: f64,

    /// Luminous region
    beam_spot: BeamSpot,

    /// Colliding system four-momentum
    beam: BeamKinematics,

    /// Particle properties
    table: ParticleTable,
}

impl StaticDetector {
    /// Creates a detector with the default constants.
    pub fn new() -> Self {
        let beam_spot = BeamSpot {
            position: Vector3::zeros(),
            // 10 µm x 1 µm x 350 µm
            covariance: nalgebra::Matrix3::from_diagonal(&Vector3::new(1.0e-6, 1.0e-8, 1.225e-3)),
        };

        let beam = BeamKinematics::new(
            Vector4::new(0.4563, 0.0, 2.9959, 11.0),
            Matrix4::from_diagonal(&Vector4::new(1.0e-6, 1.0e-6, 2.5e-5, 2.5e-5)),
        );

        Self {
            bfield: 1.5,
            beam_spot,
            beam,
            table: ParticleTable::with_defaults(),
        }
    }

    /// Sets the solenoid field.
    pub fn with_bfield(mut self, tesla: f64) -> Self {
        self.bfield = tesla;
        self
    }

    /// Sets the beam spot.
    pub fn with_beam_spot(mut self, beam_spot: BeamSpot) -> Self {
        self.beam_spot = beam_spot;
        self
    }

    /// Sets the beam four-momentum.
    pub fn with_beam(mut self, beam: BeamKinematics) -> Self {
        self.beam = beam;
        self
    }

    /// Replaces the particle table.
    pub fn with_particle_table(mut self, table: ParticleTable) -> Self {
        self.table = table;
        self
    }

    /// Checks that the constants are physical.
    pub fn validate(&self) -> Result<(), EnvError> {
        if !self.bfield.is_finite() {
            return Err(EnvError::configuration("B field must be finite"));
        }
        BeamSpot::new(self.beam_spot.position, self.beam_spot.covariance)?;
        if self.beam.four_momentum[3] <= 0.0 {
            return Err(EnvError::configuration("beam energy must be positive"));
        }
        Ok(())
    }
}

impl Default for StaticDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorContext for StaticDetector {
    fn bfield(&self) -> f64 {
        self.bfield
    }

    fn beam_spot(&self) -> &BeamSpot {
        &self.beam_spot
    }

    fn beam_kinematics(&self) -> &BeamKinematics {
        &self.beam
    }

    fn particle_table(&self) -> &ParticleTable {
        &self.table
    }
}
