//! Reconstructed decay-tree candidates: fitter input and output.
//!
//! A [`Particle`] is one node of the reconstructed decay tree. Final-state
//! particles carry a detector [`Measurement`]; composites carry daughters and
//! optionally the result of an earlier vertex fit.

use nalgebra::{Matrix3, Matrix4, Matrix5, SMatrix, SVector, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use treefit_env::PdgCode;

use crate::helix::Helix;

/// 7×7 matrix over (x, y, z, px, py, pz, E).
pub type Matrix7 = SMatrix<f64, 7, 7>;

/// Vertex and four-momentum (x, y, z, px, py, pz, E).
pub type Vector7 = SVector<f64, 7>;

/// Detector information attached to a particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    /// Composite to be reconstructed from its daughters
    None,

    /// Charged track: perigee helix and its covariance
    Track { helix: Helix, covariance: Matrix5<f64> },

    /// Calorimeter cluster of a photon. Covariance order is (x, y, z, E).
    Photon {
        position: Vector3<f64>,
        energy: f64,
        covariance: Matrix4<f64>,
    },

    /// Cluster of a K-long: position only
    Klong {
        position: Vector3<f64>,
        covariance: Matrix3<f64>,
    },

    /// Result of an earlier fit of a composite
    Composite {
        params: Vector7,
        covariance: Matrix7,
    },
}

/// Goodness of fit written back by the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub chi_square: f64,
    pub ndf: i64,
    pub p_value: Option<f64>,
}

/// One node of a reconstructed decay tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Particle species
    pub pdg: PdgCode,

    /// Detector information
    pub measurement: Measurement,

    /// Decay (composites) or production (final state) vertex in cm
    pub vertex: Option<Vector3<f64>>,

    /// Four-momentum (px, py, pz, E) in GeV
    pub momentum: Vector4<f64>,

    /// Covariance of (vertex, momentum) after a fit
    pub error_matrix: Option<Matrix7>,

    pub daughters: Vec<Particle>,

    /// Constrain the invariant mass to the nominal mass
    pub mass_constraint: bool,

    /// Constrain the flight parameter to the nominal lifetime
    pub lifetime_constraint: bool,

    /// Set by the fitter on the fitted candidates
    pub fit_quality: Option<FitQuality>,
}

impl Particle {
    fn with_measurement(pdg: PdgCode, measurement: Measurement) -> Self {
        Self {
            pdg,
            measurement,
            vertex: None,
            momentum: Vector4::zeros(),
            error_matrix: None,
            daughters: Vec::new(),
            mass_constraint: false,
            lifetime_constraint: false,
            fit_quality: None,
        }
    }

    /// Creates a charged track from its measured helix.
    pub fn track(pdg: impl Into<PdgCode>, helix: Helix, covariance: Matrix5<f64>) -> Self {
        Self::with_measurement(pdg.into(), Measurement::Track { helix, covariance })
    }

    /// Creates a photon from its calorimeter cluster.
    pub fn photon(position: Vector3<f64>, energy: f64, covariance: Matrix4<f64>) -> Self {
        let mut particle = Self::with_measurement(
            PdgCode::PHOTON,
            Measurement::Photon { position, energy, covariance },
        );
        particle.momentum = Vector4::new(0.0, 0.0, 0.0, energy);
        particle
    }

    /// Creates a K-long from its cluster position and a momentum seed.
    pub fn klong(position: Vector3<f64>, covariance: Matrix3<f64>, momentum: Vector4<f64>) -> Self {
        let mut particle =
            Self::with_measurement(PdgCode::K_LONG, Measurement::Klong { position, covariance });
        particle.momentum = momentum;
        particle
    }

    /// Creates a composite to be fitted from its daughters.
    pub fn composite(pdg: impl Into<PdgCode>, daughters: Vec<Particle>) -> Self {
        let mut particle = Self::with_measurement(pdg.into(), Measurement::None);
        particle.momentum = daughters.iter().map(|d| d.momentum).sum();
        particle.daughters = daughters;
        particle
    }

    /// Creates an already fitted composite.
    pub fn measured_composite(
        pdg: impl Into<PdgCode>,
        params: Vector7,
        covariance: Matrix7,
        daughters: Vec<Particle>,
    ) -> Self {
        let mut particle =
            Self::with_measurement(pdg.into(), Measurement::Composite { params, covariance });
        particle.vertex = Some(params.fixed_rows::<3>(0).into_owned());
        particle.momentum = params.fixed_rows::<4>(3).into_owned();
        particle.error_matrix = Some(covariance);
        particle.daughters = daughters;
        particle
    }

    pub fn with_mass_constraint(mut self) -> Self {
        self.mass_constraint = true;
        self
    }

    pub fn with_lifetime_constraint(mut self) -> Self {
        self.lifetime_constraint = true;
        self
    }

    /// Sets the vertex used to seed the fit.
    pub fn with_vertex(mut self, vertex: Vector3<f64>) -> Self {
        self.vertex = Some(vertex);
        self
    }

    /// Sets the four-momentum seed.
    pub fn with_momentum(mut self, momentum: Vector4<f64>) -> Self {
        self.momentum = momentum;
        self
    }

    /// Returns true if the particle has no daughters.
    pub fn is_final_state(&self) -> bool {
        self.daughters.is_empty()
    }

    /// Number of particles in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.daughters.iter().map(Particle::count).sum::<usize>()
    }

    /// Invariant mass of the four-momentum.
    pub fn mass(&self) -> f64 {
        let m2 = self.momentum[3].powi(2) - self.momentum.fixed_rows::<3>(0).norm_squared();
        m2.signum() * m2.abs().sqrt()
    }

    /// Follows a path of daughter indices down the tree.
    pub fn descendant(&self, path: &[usize]) -> Option<&Particle> {
        path.iter().try_fold(self, |p, &i| p.daughters.get(i))
    }

    /// Mutable counterpart of [`Particle::descendant`].
    pub fn descendant_mut(&mut self, path: &[usize]) -> Option<&mut Particle> {
        path.iter().try_fold(self, |p, &i| p.daughters.get_mut(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pion(px: f64) -> Particle {
        Particle::track(211, Helix::new(0.0, 0.0, 0.01, 0.0, 0.0), Matrix5::identity())
            .with_momentum(Vector4::new(px, 0.0, 0.0, (px * px + 0.0195).sqrt()))
    }

    #[test]
    fn test_composite_sums_daughter_momenta() {
        let ks = Particle::composite(PdgCode::K_SHORT, vec![pion(1.0), pion(-0.5)]);
        assert_relative_eq!(ks.momentum.x, 0.5, epsilon = 1e-12);
        assert_eq!(ks.count(), 3);
        assert!(!ks.is_final_state());
        assert!(ks.daughters[0].is_final_state());
    }

    #[test]
    fn test_descendant_paths() {
        let mut ks = Particle::composite(PdgCode::K_SHORT, vec![pion(1.0), pion(-0.5)]);
        let b = Particle::composite(PdgCode::B0, vec![ks.clone(), pion(2.0)]);

        assert_eq!(b.descendant(&[]).map(|p| p.pdg), Some(PdgCode::B0));
        assert_eq!(b.descendant(&[0, 1]).map(|p| p.momentum.x), Some(-0.5));
        assert!(b.descendant(&[1, 0]).is_none());

        ks.descendant_mut(&[0]).unwrap().mass_constraint = true;
        assert!(ks.daughters[0].mass_constraint);
    }

    #[test]
    fn test_measured_composite_splits_params() {
        let params = Vector7::from_column_slice(&[0.1, 0.2, 0.3, 1.0, 0.0, 0.0, 2.0]);
        let d0 = Particle::measured_composite(PdgCode::D0, params, Matrix7::identity(), vec![]);
        assert_eq!(d0.vertex, Some(Vector3::new(0.1, 0.2, 0.3)));
        assert_relative_eq!(d0.mass(), 3.0f64.sqrt(), epsilon = 1e-12);
    }
}
