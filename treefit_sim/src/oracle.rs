//! Truth-level event generator.
//!
//! The Oracle knows what really happened in every event:
//! - Production point inside the beam spot
//! - Exponential flight of weakly decaying particles, curved by the field
//! - Phase-space decays
//! - Smeared measurements of the final state with their covariances
//!
//! All randomness comes from one seeded `ChaCha8Rng`, so a seed fixes the
//! whole event sequence.

use nalgebra::{Matrix3, Matrix4, Matrix5, Vector3, Vector4, Vector5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use treefit_core::particle::RESONANCE_CTAU;
use treefit_core::{Helix, Particle};
use treefit_env::{DetectorContext, ParticleProperties, PdgCode};

use crate::error::SimError;

/// Attempts of the three-body accept-reject before taking the last mass.
const MAX_PHASE_SPACE_TRIES: usize = 1000;

/// Decay tree to generate, with the constraints the fit should apply.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayDescriptor {
    pub pdg: PdgCode,
    pub daughters: Vec<DecayDescriptor>,
    pub mass_constraint: bool,
    pub lifetime_constraint: bool,
}

impl DecayDescriptor {
    /// Final-state particle.
    pub fn stable(pdg: impl Into<PdgCode>) -> Self {
        Self::decay(pdg, Vec::new())
    }

    /// Particle decaying into `daughters` (two or three).
    pub fn decay(pdg: impl Into<PdgCode>, daughters: Vec<DecayDescriptor>) -> Self {
        Self {
            pdg: pdg.into(),
            daughters,
            mass_constraint: false,
            lifetime_constraint: false,
        }
    }

    pub fn with_mass_constraint(mut self) -> Self {
        self.mass_constraint = true;
        self
    }

    pub fn with_lifetime_constraint(mut self) -> Self {
        self.lifetime_constraint = true;
        self
    }
}

/// Detector resolution used for smearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Helix impact parameter (cm)
    pub d0: f64,
    pub phi0: f64,
    /// Curvature error relative to the curvature
    pub relative_pt: f64,
    /// Helix z at perigee (cm)
    pub z0: f64,
    pub tan_lambda: f64,

    /// Photon cluster position (cm)
    pub cluster_position: f64,
    /// Photon energy error: constant term relative to E, plus noise (GeV)
    pub photon_energy_constant: f64,
    pub photon_energy_noise: f64,

    /// K-long cluster position (cm)
    pub klong_position: f64,
    /// Spread of the K-long momentum seed relative to the truth
    pub klong_momentum: f64,

    /// Radius of the electromagnetic calorimeter (cm)
    pub calorimeter_radius: f64,
    /// Radius of the K-long detector (cm)
    pub klm_radius: f64,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            d0: 0.002,
            phi0: 0.001,
            relative_pt: 0.005,
            z0: 0.003,
            tan_lambda: 0.001,
            cluster_position: 0.5,
            photon_energy_constant: 0.02,
            photon_energy_noise: 0.005,
            klong_position: 3.0,
            klong_momentum: 0.2,
            calorimeter_radius: 125.0,
            klm_radius: 200.0,
        }
    }
}

impl Resolution {
    /// No smearing at all; covariances are zero.
    pub fn perfect() -> Self {
        Self {
            d0: 0.0,
            phi0: 0.0,
            relative_pt: 0.0,
            z0: 0.0,
            tan_lambda: 0.0,
            cluster_position: 0.0,
            photon_energy_constant: 0.0,
            photon_energy_noise: 0.0,
            klong_position: 0.0,
            klong_momentum: 0.0,
            ..Self::default()
        }
    }
}

/// What really happened to one particle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TruthParticle {
    pub pdg: PdgCode,
    pub production_vertex: Vector3<f64>,

    /// Where it decayed; the production vertex for resonances and
    /// final-state particles
    pub decay_vertex: Vector3<f64>,

    /// Four-momentum at the decay vertex (at production for final state)
    pub momentum: Vector4<f64>,

    /// Decay length over momentum (cm/GeV), zero if it does not fly
    pub tau: f64,

    pub daughters: Vec<TruthParticle>,
}

/// One generated event: the truth and the reconstructed candidate.
#[derive(Debug, Clone)]
pub struct GeneratedEvent {
    pub truth: TruthParticle,
    pub candidate: Particle,
}

/// The Oracle - generates decays and their measurements.
pub struct Oracle {
    seed: u64,
    rng: ChaCha8Rng,
    resolution: Resolution,
}

impl Oracle {
    /// Creates an oracle with the default resolution.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            resolution: Resolution::default(),
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Generates one event. The head momentum is uniform in
    /// `momentum_range` (GeV) and points away from the beam pipe.
    pub fn generate(
        &mut self,
        decay: &DecayDescriptor,
        ctx: &dyn DetectorContext,
        momentum_range: (f64, f64),
    ) -> Result<GeneratedEvent, SimError> {
        let props = ctx.particle(decay.pdg)?;
        let production = self.sample_beam_spot(ctx)?;

        let (lo, hi) = momentum_range;
        let magnitude = if hi > lo { self.rng.gen_range(lo..hi) } else { lo };
        let p = self.random_direction(-0.8, 0.9) * magnitude;
        let momentum = Vector4::new(p.x, p.y, p.z, (magnitude * magnitude + props.mass * props.mass).sqrt());

        let (truth, candidate) = self.decay(decay, ctx, production, momentum)?;
        Ok(GeneratedEvent { truth, candidate })
    }

    fn gauss(&mut self, sigma: f64) -> Result<f64, SimError> {
        let normal = Normal::new(0.0, sigma).map_err(|e| SimError::Distribution(e.to_string()))?;
        Ok(normal.sample(&mut self.rng))
    }

    fn sample_beam_spot(&mut self, ctx: &dyn DetectorContext) -> Result<Vector3<f64>, SimError> {
        let spot = ctx.beam_spot();
        let mut x = spot.position;
        for i in 0..3 {
            x[i] += self.gauss(spot.covariance[(i, i)].max(0.0).sqrt())?;
        }
        Ok(x)
    }

    /// Unit vector with cos(theta) uniform in `[cos_min, cos_max)`.
    fn random_direction(&mut self, cos_min: f64, cos_max: f64) -> Vector3<f64> {
        let cos_theta: f64 = self.rng.gen_range(cos_min..cos_max);
        let phi: f64 = self.rng.gen_range(0.0..2.0 * PI);
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
    }

    fn decay(
        &mut self,
        node: &DecayDescriptor,
        ctx: &dyn DetectorContext,
        production: Vector3<f64>,
        momentum: Vector4<f64>,
    ) -> Result<(TruthParticle, Particle), SimError> {
        let props = ctx.particle(node.pdg)?;
        if node.daughters.is_empty() {
            let candidate = self.measure(&props, ctx, &production, &momentum)?;
            let truth = TruthParticle {
                pdg: node.pdg,
                production_vertex: production,
                decay_vertex: production,
                momentum,
                tau: 0.0,
                daughters: Vec::new(),
            };
            return Ok((truth, candidate));
        }

        let (tau, decay_vertex, at_decay) = if props.ctau >= RESONANCE_CTAU {
            self.fly(&props, ctx, &production, &momentum)?
        } else {
            (0.0, production, momentum)
        };

        let masses = node
            .daughters
            .iter()
            .map(|d| ctx.particle(d.pdg).map(|p| p.mass))
            .collect::<Result<Vec<_>, _>>()?;
        let momenta = match masses.as_slice() {
            [m1, m2] => {
                let (a, b) = self.two_body(&at_decay, *m1, *m2)?;
                vec![a, b]
            }
            [m1, m2, m3] => self.three_body(&at_decay, *m1, *m2, *m3)?.to_vec(),
            _ => {
                return Err(SimError::UnsupportedDecay(format!(
                    "{} into {} particles",
                    props.name,
                    masses.len()
                )))
            }
        };

        let mut truth_daughters = Vec::with_capacity(momenta.len());
        let mut candidates = Vec::with_capacity(momenta.len());
        for (daughter, p) in node.daughters.iter().zip(momenta) {
            let (truth, candidate) = self.decay(daughter, ctx, decay_vertex, p)?;
            truth_daughters.push(truth);
            candidates.push(candidate);
        }

        let mut candidate = Particle::composite(node.pdg, candidates);
        if node.mass_constraint {
            candidate = candidate.with_mass_constraint();
        }
        if node.lifetime_constraint {
            candidate = candidate.with_lifetime_constraint();
        }

        let truth = TruthParticle {
            pdg: node.pdg,
            production_vertex: production,
            decay_vertex,
            momentum: at_decay,
            tau,
            daughters: truth_daughters,
        };
        Ok((truth, candidate))
    }

    /// Exponential flight. Charged particles turn in the field, so the
    /// momentum at the decay vertex is rotated with respect to production.
    fn fly(
        &mut self,
        props: &ParticleProperties,
        ctx: &dyn DetectorContext,
        production: &Vector3<f64>,
        momentum: &Vector4<f64>,
    ) -> Result<(f64, Vector3<f64>, Vector4<f64>), SimError> {
        let exp = Exp::new(1.0 / props.ctau).map_err(|e| SimError::Distribution(e.to_string()))?;
        let tau = exp.sample(&mut self.rng) / props.mass;
        let lambda = ctx.bending_constant(f64::from(props.charge));

        let p = rotate_z(&momentum.xyz(), -lambda * tau);
        let displacement = if lambda == 0.0 {
            p * tau
        } else {
            let (sin, cos) = (lambda * tau).sin_cos();
            Vector3::new(
                (p.x * sin - p.y * (1.0 - cos)) / lambda,
                (p.y * sin + p.x * (1.0 - cos)) / lambda,
                p.z * tau,
            )
        };
        Ok((tau, production + displacement, Vector4::new(p.x, p.y, p.z, momentum[3])))
    }

    fn two_body(
        &mut self,
        parent: &Vector4<f64>,
        m1: f64,
        m2: f64,
    ) -> Result<(Vector4<f64>, Vector4<f64>), SimError> {
        let mass = invariant_mass(parent);
        let q = breakup_momentum(mass, m1, m2).ok_or_else(|| {
            SimError::UnsupportedDecay(format!("{:.4} GeV below threshold {:.4} + {:.4}", mass, m1, m2))
        })?;
        let n = self.random_direction(-1.0, 1.0) * q;
        let a = Vector4::new(n.x, n.y, n.z, (q * q + m1 * m1).sqrt());
        let b = Vector4::new(-n.x, -n.y, -n.z, (q * q + m2 * m2).sqrt());
        let beta = parent.xyz() / parent[3];
        Ok((boost(&a, &beta), boost(&b, &beta)))
    }

    /// Three-body phase space: the (1, 2) pair mass by accept-reject on the
    /// product of the two breakup momenta, then two chained two-body decays.
    fn three_body(
        &mut self,
        parent: &Vector4<f64>,
        m1: f64,
        m2: f64,
        m3: f64,
    ) -> Result<[Vector4<f64>; 3], SimError> {
        let mass = invariant_mass(parent);
        let (lo, hi) = (m1 + m2, mass - m3);
        if hi <= lo {
            return Err(SimError::UnsupportedDecay(format!(
                "{:.4} GeV below threshold {:.4} + {:.4} + {:.4}",
                mass, m1, m2, m3
            )));
        }

        let weight = |m12: f64| {
            breakup_momentum(mass, m12, m3).unwrap_or(0.0) * breakup_momentum(m12, m1, m2).unwrap_or(0.0)
        };
        let weight_max = breakup_momentum(mass, lo, m3).unwrap_or(0.0)
            * breakup_momentum(hi, m1, m2).unwrap_or(0.0);

        let mut m12 = 0.5 * (lo + hi);
        for _ in 0..MAX_PHASE_SPACE_TRIES {
            let trial = self.rng.gen_range(lo..hi);
            if self.rng.gen::<f64>() * weight_max <= weight(trial) {
                m12 = trial;
                break;
            }
        }

        let (pair, p3) = self.two_body(parent, m12, m3)?;
        let (p1, p2) = self.two_body(&pair, m1, m2)?;
        Ok([p1, p2, p3])
    }

    fn measure(
        &mut self,
        props: &ParticleProperties,
        ctx: &dyn DetectorContext,
        vertex: &Vector3<f64>,
        momentum: &Vector4<f64>,
    ) -> Result<Particle, SimError> {
        let p = momentum.xyz();
        if props.pdg.abs() == PdgCode::PHOTON {
            return self.measure_photon(vertex, &p);
        }
        if props.pdg.abs() == PdgCode::K_LONG {
            return self.measure_klong(vertex, &p, props.mass);
        }
        if props.charge == 0 {
            return Err(SimError::UnsupportedDecay(format!("no measurement for neutral {}", props.name)));
        }

        let kappa = ctx.bending_constant(f64::from(props.charge));
        let truth = Helix::from_vertex(vertex, &p, kappa);
        let sigma = Vector5::new(
            self.resolution.d0,
            self.resolution.phi0,
            self.resolution.relative_pt * truth.omega.abs(),
            self.resolution.z0,
            self.resolution.tan_lambda,
        );
        let mut measured = truth.to_vector();
        for i in 0..5 {
            measured[i] += self.gauss(sigma[i])?;
        }
        let helix = Helix::from_vector(&measured);
        let covariance = Matrix5::from_diagonal(&sigma.component_mul(&sigma));

        let seed = helix.momentum_at(0.0, kappa);
        let energy = (seed.norm_squared() + props.mass * props.mass).sqrt();
        Ok(Particle::track(props.pdg, helix, covariance)
            .with_momentum(Vector4::new(seed.x, seed.y, seed.z, energy)))
    }

    fn measure_photon(&mut self, vertex: &Vector3<f64>, p: &Vector3<f64>) -> Result<Particle, SimError> {
        let energy = p.norm();
        let sigma_pos = self.resolution.cluster_position;
        let sigma_e =
            self.resolution.photon_energy_constant * energy + self.resolution.photon_energy_noise;

        let mut position = cylinder_hit(vertex, p, self.resolution.calorimeter_radius);
        for i in 0..3 {
            position[i] += self.gauss(sigma_pos)?;
        }
        let measured = (energy + self.gauss(sigma_e)?).max(1e-3);

        let var_pos = sigma_pos * sigma_pos;
        let covariance = Matrix4::from_diagonal(&Vector4::new(var_pos, var_pos, var_pos, sigma_e * sigma_e));
        Ok(Particle::photon(position, measured, covariance))
    }

    /// Cluster position only; the momentum seed is the truth with a crude
    /// magnitude error.
    fn measure_klong(
        &mut self,
        vertex: &Vector3<f64>,
        p: &Vector3<f64>,
        mass: f64,
    ) -> Result<Particle, SimError> {
        let sigma_pos = self.resolution.klong_position;
        let spread = self.resolution.klong_momentum;

        let mut position = cylinder_hit(vertex, p, self.resolution.klm_radius);
        for i in 0..3 {
            position[i] += self.gauss(sigma_pos)?;
        }
        let seed = p * (1.0 + self.gauss(spread)?).max(0.1);
        let energy = (seed.norm_squared() + mass * mass).sqrt();

        Ok(Particle::klong(
            position,
            Matrix3::from_diagonal_element(sigma_pos * sigma_pos),
            Vector4::new(seed.x, seed.y, seed.z, energy),
        ))
    }
}

fn invariant_mass(p: &Vector4<f64>) -> f64 {
    (p[3] * p[3] - p.xyz().norm_squared()).max(0.0).sqrt()
}

/// Daughter momentum in the rest frame of a two-body decay, or `None`
/// below threshold.
fn breakup_momentum(mass: f64, m1: f64, m2: f64) -> Option<f64> {
    if mass + 1e-9 < m1 + m2 {
        return None;
    }
    let s = (mass * mass - (m1 + m2).powi(2)) * (mass * mass - (m1 - m2).powi(2));
    Some(s.max(0.0).sqrt() / (2.0 * mass))
}

/// Lorentz boost of `p` by velocity `beta`.
fn boost(p: &Vector4<f64>, beta: &Vector3<f64>) -> Vector4<f64> {
    let b2 = beta.norm_squared();
    if b2 <= 0.0 {
        return *p;
    }
    let gamma = 1.0 / (1.0 - b2).sqrt();
    let bp = beta.dot(&p.xyz());
    let p3 = p.xyz() + beta * ((gamma - 1.0) / b2 * bp + gamma * p[3]);
    Vector4::new(p3.x, p3.y, p3.z, gamma * (p[3] + bp))
}

/// Counter-clockwise rotation about z.
fn rotate_z(p: &Vector3<f64>, angle: f64) -> Vector3<f64> {
    let (sin, cos) = angle.sin_cos();
    Vector3::new(p.x * cos - p.y * sin, p.y * cos + p.x * sin, p.z)
}

/// Point where the straight line from `vertex` along `direction` crosses
/// the cylinder of `radius` around the beam.
fn cylinder_hit(vertex: &Vector3<f64>, direction: &Vector3<f64>, radius: f64) -> Vector3<f64> {
    let d = direction.normalize();
    let a = d.x * d.x + d.y * d.y;
    if a < 1e-12 {
        return vertex + d * radius;
    }
    let b = 2.0 * (vertex.x * d.x + vertex.y * d.y);
    let c = vertex.x * vertex.x + vertex.y * vertex.y - radius * radius;
    let t = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
    vertex + d * t
}
