//! Built-in particle property table.
//!
//! Values follow the PDG review; widths of strongly and electromagnetically
//! decaying states are converted to a decay length with ħc.

use std::collections::HashMap;

use crate::types::{ParticleProperties, PdgCode};
use crate::EnvError;

/// ħc in GeV·cm
const HBAR_C: f64 = 1.973_269_804e-14;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    anti_name: String,
    mass: f64,
    width: f64,
    ctau: f64,
    charge: i32,
}

/// Lookup table of particle properties keyed by the unsigned PDG code.
///
/// Antiparticles are derived from their particle entry with the charge
/// flipped, so only one entry per species is stored.
#[derive(Debug, Clone, Default)]
pub struct ParticleTable {
    entries: HashMap<i32, Entry>,
}

impl ParticleTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with the particles that appear in B-factory decay
    /// chains.
    pub fn with_defaults() -> Self {
        let stable = f64::INFINITY;
        let mut table = Self::new();

        // Leptons and stable hadrons
        table.add_weak(PdgCode::ELECTRON, "e-", "e+", 0.000_510_999, stable, -1);
        table.add_weak(PdgCode::MUON, "mu-", "mu+", 0.105_658_4, 65_865.4, -1);
        table.add_weak(PdgCode::PHOTON, "gamma", "gamma", 0.0, stable, 0);
        table.add_weak(PdgCode::PION, "pi+", "pi-", 0.139_570_39, 780.45, 1);
        table.add_weak(PdgCode::KAON, "K+", "K-", 0.493_677, 371.2, 1);
        table.add_weak(PdgCode::PROTON, "p+", "anti-p-", 0.938_272_09, stable, 1);

        // Long-lived neutrals
        table.add_weak(PdgCode::K_SHORT, "K_S0", "K_S0", 0.497_611, 2.6844, 0);
        table.add_weak(PdgCode::K_LONG, "K_L0", "K_L0", 0.497_611, 1534.0, 0);
        table.add_weak(PdgCode::LAMBDA, "Lambda0", "anti-Lambda0", 1.115_683, 7.89, 0);

        // Weakly decaying heavy flavour
        table.add_weak(PdgCode::D0, "D0", "anti-D0", 1.864_84, 0.012_29, 0);
        table.add_weak(PdgCode::D_PLUS, "D+", "D-", 1.869_66, 0.031_18, 1);
        table.add_weak(PdgCode::DS_PLUS, "D_s+", "D_s-", 1.968_35, 0.015_07, 1);
        table.add_weak(PdgCode::B0, "B0", "anti-B0", 5.279_65, 0.045_57, 0);
        table.add_weak(PdgCode::B_PLUS, "B+", "B-", 5.279_34, 0.049_11, 1);

        // Resonances
        table.add_resonance(PdgCode::PI0, "pi0", "pi0", 0.134_976_8, 7.81e-9, 0);
        table.add_resonance(PdgCode::ETA, "eta", "eta", 0.547_862, 1.31e-6, 0);
        table.add_resonance(PdgCode::RHO0, "rho0", "rho0", 0.775_26, 0.1491, 0);
        table.add_resonance(PdgCode::OMEGA, "omega", "omega", 0.782_66, 0.008_49, 0);
        table.add_resonance(PdgCode::K_STAR0, "K*0", "anti-K*0", 0.895_55, 0.0473, 0);
        table.add_resonance(PdgCode::PHI, "phi", "phi", 1.019_461, 0.004_249, 0);
        table.add_resonance(PdgCode::D_STAR_PLUS, "D*+", "D*-", 2.010_26, 8.34e-5, 1);
        table.add_resonance(PdgCode::JPSI, "J/psi", "J/psi", 3.096_900, 9.26e-5, 0);
        table.add_resonance(PdgCode::UPSILON_4S, "Upsilon(4S)", "Upsilon(4S)", 10.579_4, 0.0205, 0);

        table
    }

    fn add_weak(
        &mut self,
        pdg: PdgCode,
        name: &str,
        anti_name: &str,
        mass: f64,
        ctau: f64,
        charge: i32,
    ) {
        self.entries.insert(
            pdg.abs().0,
            Entry {
                name: name.to_string(),
                anti_name: anti_name.to_string(),
                mass,
                width: 0.0,
                ctau,
                charge,
            },
        );
    }

    fn add_resonance(
        &mut self,
        pdg: PdgCode,
        name: &str,
        anti_name: &str,
        mass: f64,
        width: f64,
        charge: i32,
    ) {
        self.entries.insert(
            pdg.abs().0,
            Entry {
                name: name.to_string(),
                anti_name: anti_name.to_string(),
                mass,
                width,
                ctau: HBAR_C / width,
                charge,
            },
        );
    }

    /// Adds or replaces a species; used to register particles the defaults
    /// do not cover.
    pub fn insert(&mut self, props: ParticleProperties) {
        let conjugate_name = format!("anti-{}", props.name);
        let (name, anti_name, charge) = if props.pdg.is_anti() {
            (conjugate_name, props.name, -props.charge)
        } else {
            (props.name, conjugate_name, props.charge)
        };
        self.entries.insert(
            props.pdg.abs().0,
            Entry {
                name,
                anti_name,
                mass: props.mass,
                width: props.width,
                ctau: props.ctau,
                charge,
            },
        );
    }

    /// Looks up a particle or antiparticle by PDG code.
    pub fn lookup(&self, pdg: PdgCode) -> Result<ParticleProperties, EnvError> {
        let entry = self
            .entries
            .get(&pdg.abs().0)
            .ok_or(EnvError::UnknownParticle(pdg.0))?;

        let (name, charge) = if pdg.is_anti() {
            (&entry.anti_name, -entry.charge)
        } else {
            (&entry.name, entry.charge)
        };

        Ok(ParticleProperties {
            pdg,
            name: name.clone(),
            mass: entry.mass,
            width: entry.width,
            ctau: entry.ctau,
            charge,
        })
    }

    /// Returns true if the table knows the species.
    pub fn contains(&self, pdg: PdgCode) -> bool {
        self.entries.contains_key(&pdg.abs().0)
    }

    /// Number of species in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_lookup_particle_and_antiparticle() {
        let table = ParticleTable::with_defaults();

        let pi_plus = table.lookup(PdgCode::PION).unwrap();
        let pi_minus = table.lookup(PdgCode(-211)).unwrap();

        assert_eq!(pi_plus.charge, 1);
        assert_eq!(pi_minus.charge, -1);
        assert_eq!(pi_minus.name, "pi-");
        assert_relative_eq!(pi_plus.mass, pi_minus.mass);
    }

    #[test]
    fn test_resonance_decay_length_from_width() {
        let table = ParticleTable::with_defaults();

        let jpsi = table.lookup(PdgCode::JPSI).unwrap();
        assert!(jpsi.ctau < 1e-4);
        assert_relative_eq!(jpsi.ctau * jpsi.width, HBAR_C, max_relative = 1e-12);

        let ks = table.lookup(PdgCode::K_SHORT).unwrap();
        assert!(ks.ctau > 1.0);
    }

    #[test]
    fn test_unknown_particle() {
        let table = ParticleTable::with_defaults();
        assert_eq!(
            table.lookup(PdgCode(9_999_999)),
            Err(EnvError::UnknownParticle(9_999_999))
        );
    }

    #[test]
    fn test_stable_particles() {
        let table = ParticleTable::with_defaults();
        assert!(table.lookup(PdgCode::PHOTON).unwrap().is_stable());
        assert!(!table.lookup(PdgCode::D0).unwrap().is_stable());
    }

    #[test]
    fn test_insert_custom_particle() {
        let mut table = ParticleTable::new();
        table.insert(ParticleProperties {
            pdg: PdgCode(4122),
            name: "Lambda_c+".to_string(),
            mass: 2.28646,
            width: 0.0,
            ctau: 0.00606,
            charge: 1,
        });

        let lc = table.lookup(PdgCode(-4122)).unwrap();
        assert_eq!(lc.charge, -1);
        assert_eq!(table.len(), 1);
    }
}
