//! Scenario runner - generates events, fits them and checks the pulls.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use treefit_core::{ErrCode, FitStatus, Fitter, NodeResult};
use treefit_env::{DetectorContext, StaticDetector};

use crate::exporter::{EventRecord, SimExport, TruthRecord};
use crate::oracle::{Oracle, Resolution, TruthParticle};
use crate::scenarios::ScenarioId;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub events: usize,

    /// Fits that ended in `Converged` with an acceptable chi-square
    pub converged: usize,

    /// Converged fits flagged `LARGE_CHI_SQUARE`
    pub outliers: usize,

    /// Fits without a usable result
    pub failed: usize,

    pub convergence_rate: f64,

    /// Mean chi-square probability of the converged fits
    pub mean_p_value: f64,

    pub mean_passes: f64,

    /// Head vertex pulls (fit − truth) / σ, per axis
    pub vertex_pull_mean: [f64; 3],
    pub vertex_pull_rms: [f64; 3],

    /// Fitted minus nominal head mass (GeV)
    pub mass_residual_mean: f64,
    pub mass_residual_rms: f64,
}

/// Pass criteria of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_convergence_rate: f64,

    /// Largest acceptable vertex pull RMS on any axis
    pub max_pull_rms: f64,

    /// Accepted range of the mean chi-square probability
    pub p_value_range: (f64, f64),
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_convergence_rate: 0.9,
            max_pull_rms: 3.0,
            p_value_range: (0.05, 0.95),
        }
    }
}

impl Thresholds {
    /// Returns the first violated criterion.
    pub fn check(&self, metrics: &ScenarioMetrics) -> Option<String> {
        if metrics.convergence_rate < self.min_convergence_rate {
            return Some(format!(
                "convergence rate {:.1}% below {:.1}%",
                metrics.convergence_rate * 100.0,
                self.min_convergence_rate * 100.0
            ));
        }
        const AXES: [&str; 3] = ["x", "y", "z"];
        for (axis, rms) in AXES.iter().zip(metrics.vertex_pull_rms) {
            if rms > self.max_pull_rms {
                return Some(format!("vertex {} pull RMS {:.2} above {:.2}", axis, rms, self.max_pull_rms));
            }
        }
        let (lo, hi) = self.p_value_range;
        if metrics.mean_p_value < lo || metrics.mean_p_value > hi {
            return Some(format!(
                "mean p-value {:.3} outside [{:.2}, {:.2}]",
                metrics.mean_p_value, lo, hi
            ));
        }
        None
    }
}

/// Running sums over the events of one scenario.
#[derive(Debug, Default)]
struct Accumulator {
    events: usize,
    converged: usize,
    outliers: usize,
    failed: usize,
    passes: usize,
    p_value_sum: f64,
    p_value_count: usize,
    pull_sum: [f64; 3],
    pull_sq_sum: [f64; 3],
    pull_count: [usize; 3],
    mass_sum: f64,
    mass_sq_sum: f64,
    mass_count: usize,
}

impl Accumulator {
    fn add(
        &mut self,
        status: FitStatus,
        fitter: &Fitter,
        head: Option<&NodeResult>,
        truth: &TruthParticle,
        nominal_mass: f64,
    ) {
        self.events += 1;
        if !status.has_result() {
            self.failed += 1;
        }
        if status != FitStatus::Converged {
            return;
        }
        if fitter.err_code().contains(ErrCode::LARGE_CHI_SQUARE) {
            self.outliers += 1;
            return;
        }
        self.converged += 1;
        self.passes += fitter.passes();

        if let Some(p) = fitter.p_value() {
            self.p_value_sum += p;
            self.p_value_count += 1;
        }

        let Some(head) = head else {
            return;
        };
        if let (Some(vertex), Some(cov)) = (head.vertex, head.vertex_covariance) {
            for i in 0..3 {
                let sigma = cov[(i, i)].sqrt();
                if sigma > 0.0 {
                    let pull = (vertex[i] - truth.decay_vertex[i]) / sigma;
                    self.pull_sum[i] += pull;
                    self.pull_sq_sum[i] += pull * pull;
                    self.pull_count[i] += 1;
                }
            }
        }

        let residual = head.mass - nominal_mass;
        self.mass_sum += residual;
        self.mass_sq_sum += residual * residual;
        self.mass_count += 1;
    }

    fn finish(&self) -> ScenarioMetrics {
        let mean = |sum: f64, n: usize| if n > 0 { sum / n as f64 } else { 0.0 };

        let mut vertex_pull_mean = [0.0; 3];
        let mut vertex_pull_rms = [0.0; 3];
        for i in 0..3 {
            vertex_pull_mean[i] = mean(self.pull_sum[i], self.pull_count[i]);
            vertex_pull_rms[i] = mean(self.pull_sq_sum[i], self.pull_count[i]).sqrt();
        }

        ScenarioMetrics {
            events: self.events,
            converged: self.converged,
            outliers: self.outliers,
            failed: self.failed,
            convergence_rate: mean(self.converged as f64, self.events),
            mean_p_value: mean(self.p_value_sum, self.p_value_count),
            mean_passes: mean(self.passes as f64, self.converged),
            vertex_pull_mean,
            vertex_pull_rms,
            mass_residual_mean: mean(self.mass_sum, self.mass_count),
            mass_residual_rms: mean(self.mass_sq_sum, self.mass_count).sqrt(),
        }
    }
}

/// Seed of the generator for one scenario.
fn physics_seed(seed: u64, scenario: ScenarioId) -> u64 {
    seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(scenario as u64)
}

/// Runs closure-test scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Events per scenario
    events: usize,

    detector: StaticDetector,
    resolution: Resolution,
    thresholds: Thresholds,
}

impl ScenarioRunner {
    pub fn new(seed: u64, events: usize) -> Self {
        Self {
            seed,
            events,
            detector: StaticDetector::new(),
            resolution: Resolution::default(),
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_detector(mut self, detector: StaticDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Runs a scenario.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records every event in `export`.
    pub fn run_with_export(&self, scenario: ScenarioId, export: &mut SimExport) -> ScenarioResult {
        self.execute(scenario, Some(export))
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        warn!("✗ {} aborted: {}", scenario, reason);
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}, events={})",
            scenario.name(),
            self.seed,
            self.events
        );
        if scenario.is_demanding() {
            warn!("{} relies on K_L clusters; expect a lower convergence rate", scenario);
        }

        let decay = scenario.decay();
        let config = scenario.config();
        let nominal_mass = match self.detector.particle(decay.pdg) {
            Ok(props) => props.mass,
            Err(e) => return self.failed(scenario, e.to_string()),
        };

        let mut oracle =
            Oracle::new(physics_seed(self.seed, scenario)).with_resolution(self.resolution.clone());
        let mut acc = Accumulator::default();

        for index in 0..self.events {
            let event = match oracle.generate(&decay, &self.detector, scenario.momentum_range()) {
                Ok(event) => event,
                Err(e) => return self.failed(scenario, format!("event {}: {}", index, e)),
            };

            let mut fitter = Fitter::new(event.candidate, config.clone());
            let status = match fitter.fit(&self.detector) {
                Ok(status) => status,
                Err(e) => {
                    debug!("event {}: {}", index, e);
                    FitStatus::Failed
                }
            };
            let head = fitter.head_result();
            acc.add(status, &fitter, head.as_ref(), &event.truth, nominal_mass);

            if let Some(export) = export.as_deref_mut() {
                export.add_event(EventRecord {
                    index,
                    status,
                    chi_square: fitter.chi_square(),
                    ndf: fitter.ndf(),
                    p_value: fitter.p_value(),
                    passes: fitter.passes(),
                    flags: fitter.err_code().flag_names(),
                    truth: TruthRecord {
                        production_vertex: event.truth.production_vertex,
                        decay_vertex: event.truth.decay_vertex,
                        mass: nominal_mass,
                        tau: event.truth.tau,
                    },
                    head,
                });
            }
        }

        let metrics = acc.finish();
        let failure_reason = self.thresholds.check(&metrics);
        let passed = failure_reason.is_none();

        if passed {
            info!(
                "✓ {} complete: {}/{} converged, <p> {:.3}, pull RMS [{:.2}, {:.2}, {:.2}]",
                scenario,
                metrics.converged,
                metrics.events,
                metrics.mean_p_value,
                metrics.vertex_pull_rms[0],
                metrics.vertex_pull_rms[1],
                metrics.vertex_pull_rms[2]
            );
        } else if let Some(reason) = &failure_reason {
            warn!("✗ {} failed: {}", scenario, reason);
        }

        if let Some(export) = export {
            export.finalize(passed, metrics.clone());
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            failure_reason,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treefit_env::ParticleTable;

    #[test]
    fn test_ks_closure() {
        let result = ScenarioRunner::new(42, 20).run(ScenarioId::KsToPiPi);
        let metrics = &result.metrics;

        assert_eq!(metrics.events, 20);
        assert!(metrics.convergence_rate >= 0.75, "rate {}", metrics.convergence_rate);
        assert!(metrics.mean_passes >= 1.0);
        for rms in metrics.vertex_pull_rms {
            assert!(rms > 0.0 && rms < 5.0, "pull rms {}", rms);
        }
    }

    fn assert_closure(scenario: ScenarioId, events: usize, min_convergence_rate: f64) {
        let thresholds = Thresholds { min_convergence_rate, ..Thresholds::default() };
        let result = ScenarioRunner::new(11, events).with_thresholds(thresholds.clone()).run(scenario);
        let metrics = &result.metrics;

        assert_eq!(metrics.events, events);
        assert_eq!(thresholds.check(metrics), None, "{}: {:?}", scenario, metrics);
        assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        for rms in metrics.vertex_pull_rms {
            assert!(rms > 0.0, "{}: pull rms {}", scenario, rms);
        }
    }

    #[test]
    fn test_d0_to_kpi_closure() {
        assert_closure(ScenarioId::D0ToKPi, 40, 0.9);
    }

    #[test]
    fn test_dplus_three_body_closure() {
        assert_closure(ScenarioId::DplusThreeBody, 40, 0.9);
    }

    #[test]
    fn test_d0_with_pi0_closure() {
        assert_closure(ScenarioId::D0WithPi0, 40, 0.85);
    }

    #[test]
    fn test_b0_to_jpsi_ks_closure() {
        assert_closure(ScenarioId::B0ToJpsiKs, 40, 0.85);
    }

    #[test]
    fn test_lambda_lifetime_closure() {
        assert_closure(ScenarioId::LambdaLifetime, 40, 0.9);
    }

    #[test]
    fn test_mass_constraint_pins_head_mass() {
        let result = ScenarioRunner::new(5, 20).run(ScenarioId::DplusThreeBody);
        assert!(result.metrics.converged > 0);
        assert!(result.metrics.mass_residual_rms < 1e-3, "{:?}", result.metrics);
    }

    #[test]
    fn test_noiseless_events_with_beam_spot_converge() {
        for scenario in [ScenarioId::D0ToKPi, ScenarioId::DplusThreeBody] {
            let runner = ScenarioRunner::new(9, 10).with_resolution(Resolution::perfect());
            let mut export = SimExport::new(scenario.name(), 9);
            let result = runner.run_with_export(scenario, &mut export);

            assert_eq!(result.metrics.failed, 0, "{}: {:?}", scenario, result.metrics);
            assert_eq!(result.metrics.converged, 10, "{}: {:?}", scenario, result.metrics);
            for event in &export.events {
                let head = event.head.as_ref().expect("head result");
                let vertex = head.vertex.expect("head vertex");
                assert!((vertex - event.truth.decay_vertex).norm() < 1e-5, "{}: {:?}", scenario, vertex);
                assert!(event.chi_square.is_finite());
            }
        }
    }

    #[test]
    fn test_large_chi_square_fits_are_not_counted_as_converged() {
        let ctx = StaticDetector::new();
        let event = Oracle::new(2).generate(&ScenarioId::D0ToKPi.decay(), &ctx, (1.0, 2.0)).unwrap();
        let config = ScenarioId::D0ToKPi.config().with_max_chi2_per_ndf(1e-12);
        let mut fitter = Fitter::new(event.candidate, config);
        let status = fitter.fit(&ctx).unwrap();
        assert_eq!(status, FitStatus::Converged);

        let mut acc = Accumulator::default();
        let head = fitter.head_result();
        acc.add(status, &fitter, head.as_ref(), &event.truth, 1.86484);
        let metrics = acc.finish();
        assert_eq!(metrics.outliers, 1);
        assert_eq!(metrics.converged, 0);
        assert_eq!(metrics.failed, 0);
    }

    #[test]
    fn test_same_seed_same_metrics() {
        let runner = ScenarioRunner::new(7, 5);
        let a = runner.run(ScenarioId::D0ToKPi);
        let b = runner.run(ScenarioId::D0ToKPi);
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.passed, b.passed);
    }

    #[test]
    fn test_export_records_every_event() {
        let runner = ScenarioRunner::new(3, 4);
        let mut export = SimExport::new(ScenarioId::KsToPiPi.name(), 3);
        let result = runner.run_with_export(ScenarioId::KsToPiPi, &mut export);

        assert_eq!(export.events.len(), 4);
        assert_eq!(export.passed, result.passed);
        assert_eq!(export.metrics.as_ref(), Some(&result.metrics));
        for (i, event) in export.events.iter().enumerate() {
            assert_eq!(event.index, i);
            assert!(event.truth.tau > 0.0);
        }
    }

    #[test]
    fn test_unknown_particle_aborts() {
        let detector = StaticDetector::new().with_particle_table(ParticleTable::new());
        let result = ScenarioRunner::new(1, 3).with_detector(detector).run(ScenarioId::KsToPiPi);
        assert!(!result.passed);
        assert!(result.failure_reason.is_some());
        assert_eq!(result.metrics.events, 0);
    }

    #[test]
    fn test_thresholds() {
        let thresholds = Thresholds::default();
        let good = ScenarioMetrics {
            events: 10,
            converged: 10,
            convergence_rate: 1.0,
            mean_p_value: 0.5,
            vertex_pull_rms: [1.0, 1.1, 0.9],
            ..Default::default()
        };
        assert_eq!(thresholds.check(&good), None);

        let wide = ScenarioMetrics { vertex_pull_rms: [1.0, 4.0, 1.0], ..good.clone() };
        assert!(thresholds.check(&wide).unwrap().contains("y pull"));

        let slow = ScenarioMetrics { convergence_rate: 0.5, ..good.clone() };
        assert!(thresholds.check(&slow).unwrap().contains("convergence"));

        let overfit = ScenarioMetrics { mean_p_value: 0.99, ..good };
        assert!(thresholds.check(&overfit).unwrap().contains("p-value"));
    }

    #[test]
    fn test_seeds_differ_per_scenario() {
        assert_ne!(
            physics_seed(1, ScenarioId::KsToPiPi),
            physics_seed(1, ScenarioId::D0ToKPi)
        );
    }
}
