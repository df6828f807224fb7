//! Reference decays for closure tests.

use serde::{Deserialize, Serialize};
use treefit_core::{BeamConstraint, FitConfig};
use treefit_env::PdgCode;

use crate::oracle::DecayDescriptor;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// TF-001: K_S → π+ π−, vertex from the two tracks alone
    #[serde(rename = "ks_to_pipi")]
    KsToPiPi,

    /// TF-002: D0 → K− π+ from the beam spot
    #[serde(rename = "d0_to_kpi")]
    D0ToKPi,

    /// TF-003: D+ → K− π+ π+ with a mass constraint
    DplusThreeBody,

    /// TF-004: D0 → K− π+ π0, π0 → γγ with a π0 mass constraint
    D0WithPi0,

    /// TF-005: B0 → J/ψ(μ+μ−) K_S(π+π−), two vertices
    B0ToJpsiKs,

    /// TF-006: Λ → p π− with a lifetime constraint
    LambdaLifetime,

    /// TF-007: B0 → J/ψ K_L, K_L momentum from the B0 mass
    B0ToJpsiKlong,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::KsToPiPi,
            ScenarioId::D0ToKPi,
            ScenarioId::DplusThreeBody,
            ScenarioId::D0WithPi0,
            ScenarioId::B0ToJpsiKs,
            ScenarioId::LambdaLifetime,
            ScenarioId::B0ToJpsiKlong,
        ]
    }

    /// Returns the scenarios without neutral hadron clusters.
    pub fn standard() -> Vec<ScenarioId> {
        Self::all().into_iter().filter(|s| !s.is_demanding()).collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::KsToPiPi => "ks_to_pipi",
            ScenarioId::D0ToKPi => "d0_to_kpi",
            ScenarioId::DplusThreeBody => "dplus_three_body",
            ScenarioId::D0WithPi0 => "d0_with_pi0",
            ScenarioId::B0ToJpsiKs => "b0_to_jpsi_ks",
            ScenarioId::LambdaLifetime => "lambda_lifetime",
            ScenarioId::B0ToJpsiKlong => "b0_to_jpsi_klong",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::KsToPiPi => "K_S -> pi+ pi-, no beam constraint",
            ScenarioId::D0ToKPi => "D0 -> K- pi+, beam spot constrained production",
            ScenarioId::DplusThreeBody => "D+ -> K- pi+ pi+, mass constrained",
            ScenarioId::D0WithPi0 => "D0 -> K- pi+ pi0(gamma gamma), pi0 mass constrained",
            ScenarioId::B0ToJpsiKs => "B0 -> J/psi(mu mu) K_S(pi pi), nested vertices",
            ScenarioId::LambdaLifetime => "Lambda -> p pi-, lifetime constrained",
            ScenarioId::B0ToJpsiKlong => "B0 -> J/psi K_L, K_L momentum from the B0 mass",
        }
    }

    /// Returns true if the fit relies on a poorly measured neutral hadron.
    pub fn is_demanding(&self) -> bool {
        matches!(self, ScenarioId::B0ToJpsiKlong)
    }

    /// Decay tree to generate and fit.
    pub fn decay(&self) -> DecayDescriptor {
        let ks = || DecayDescriptor::decay(PdgCode::K_SHORT, vec![DecayDescriptor::stable(211), DecayDescriptor::stable(-211)]);
        let jpsi = || {
            DecayDescriptor::decay(PdgCode::JPSI, vec![DecayDescriptor::stable(-13), DecayDescriptor::stable(13)])
                .with_mass_constraint()
        };

        match self {
            ScenarioId::KsToPiPi => ks(),
            ScenarioId::D0ToKPi => {
                DecayDescriptor::decay(PdgCode::D0, vec![DecayDescriptor::stable(-321), DecayDescriptor::stable(211)])
            }
            ScenarioId::DplusThreeBody => DecayDescriptor::decay(
                PdgCode::D_PLUS,
                vec![DecayDescriptor::stable(-321), DecayDescriptor::stable(211), DecayDescriptor::stable(211)],
            )
            .with_mass_constraint(),
            ScenarioId::D0WithPi0 => DecayDescriptor::decay(
                PdgCode::D0,
                vec![
                    DecayDescriptor::stable(-321),
                    DecayDescriptor::stable(211),
                    DecayDescriptor::decay(PdgCode::PI0, vec![DecayDescriptor::stable(22), DecayDescriptor::stable(22)])
                        .with_mass_constraint(),
                ],
            ),
            ScenarioId::B0ToJpsiKs => DecayDescriptor::decay(PdgCode::B0, vec![jpsi(), ks()]),
            ScenarioId::LambdaLifetime => DecayDescriptor::decay(
                PdgCode::LAMBDA,
                vec![DecayDescriptor::stable(PdgCode::PROTON), DecayDescriptor::stable(-211)],
            )
            .with_lifetime_constraint(),
            ScenarioId::B0ToJpsiKlong => DecayDescriptor::decay(
                PdgCode::B0,
                vec![jpsi(), DecayDescriptor::stable(PdgCode::K_LONG)],
            )
            .with_mass_constraint(),
        }
    }

    /// Fit configuration used for the scenario.
    pub fn config(&self) -> FitConfig {
        match self {
            ScenarioId::KsToPiPi => FitConfig::default(),
            _ => FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot),
        }
    }

    /// Range of the head momentum magnitude (GeV).
    pub fn momentum_range(&self) -> (f64, f64) {
        match self {
            ScenarioId::KsToPiPi | ScenarioId::LambdaLifetime => (0.3, 2.5),
            ScenarioId::D0ToKPi | ScenarioId::DplusThreeBody | ScenarioId::D0WithPi0 => (1.0, 3.5),
            ScenarioId::B0ToJpsiKs | ScenarioId::B0ToJpsiKlong => (1.0, 2.0),
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ks_to_pipi" | "ks" | "tf-001" => Ok(ScenarioId::KsToPiPi),
            "d0_to_kpi" | "d0" | "tf-002" => Ok(ScenarioId::D0ToKPi),
            "dplus_three_body" | "dplus" | "tf-003" => Ok(ScenarioId::DplusThreeBody),
            "d0_with_pi0" | "tf-004" => Ok(ScenarioId::D0WithPi0),
            "b0_to_jpsi_ks" | "tf-005" => Ok(ScenarioId::B0ToJpsiKs),
            "lambda_lifetime" | "lambda" | "tf-006" => Ok(ScenarioId::LambdaLifetime),
            "b0_to_jpsi_klong" | "tf-007" => Ok(ScenarioId::B0ToJpsiKlong),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treefit_env::{DetectorContext, StaticDetector};

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("TF-005".parse::<ScenarioId>(), Ok(ScenarioId::B0ToJpsiKs));
        assert!("z_to_mumu".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_serde_uses_names() {
        for scenario in ScenarioId::all() {
            let json = serde_json::to_string(&scenario).unwrap();
            assert_eq!(json, format!("\"{}\"", scenario.name()));
            let back: ScenarioId = serde_json::from_str(&json).unwrap();
            assert_eq!(back, scenario);
        }
    }

    #[test]
    fn test_standard_excludes_klong() {
        let standard = ScenarioId::standard();
        assert_eq!(standard.len(), ScenarioId::all().len() - 1);
        assert!(!standard.contains(&ScenarioId::B0ToJpsiKlong));
    }

    #[test]
    fn test_decays_are_kinematically_open() {
        let ctx = StaticDetector::new();
        fn check(node: &DecayDescriptor, ctx: &StaticDetector) {
            if node.daughters.is_empty() {
                return;
            }
            let mass = ctx.particle(node.pdg).unwrap().mass;
            let threshold: f64 = node.daughters.iter().map(|d| ctx.particle(d.pdg).unwrap().mass).sum();
            assert!(mass > threshold, "{} below threshold", node.pdg);
            for d in &node.daughters {
                check(d, ctx);
            }
        }
        for scenario in ScenarioId::all() {
            check(&scenario.decay(), &ctx);
        }
    }

    #[test]
    fn test_configs_are_valid() {
        for scenario in ScenarioId::all() {
            assert!(scenario.config().validate().is_ok(), "{}", scenario);
        }
        assert!(ScenarioId::KsToPiPi.config().beam_constraint.is_none());
    }
}
