//! JSON export of per-event fit results.
//!
//! One file per scenario: the truth next to the fitted head, for offline
//! pull and resolution studies.

use nalgebra::Vector3;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use treefit_core::{FitStatus, NodeResult};

use crate::error::SimError;
use crate::runner::ScenarioMetrics;

/// Truth of the head particle.
#[derive(Debug, Clone, Serialize)]
pub struct TruthRecord {
    pub production_vertex: Vector3<f64>,
    pub decay_vertex: Vector3<f64>,
    pub mass: f64,
    pub tau: f64,
}

/// Outcome of one event.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub index: usize,
    pub status: FitStatus,
    pub chi_square: f64,
    pub ndf: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub passes: usize,
    /// Names of the error flags raised during the fit
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<&'static str>,
    pub truth: TruthRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<NodeResult>,
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub events: Vec<EventRecord>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ScenarioMetrics>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            events: Vec::new(),
            passed: false,
            metrics: None,
        }
    }

    pub fn add_event(&mut self, event: EventRecord) {
        self.events.push(event);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, metrics: ScenarioMetrics) {
        self.passed = passed;
        self.metrics = Some(metrics);
    }

    /// Writes the export as pretty JSON.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize) -> EventRecord {
        EventRecord {
            index,
            status: FitStatus::Converged,
            chi_square: 1.5,
            ndf: 1,
            p_value: Some(0.22),
            passes: 3,
            flags: Vec::new(),
            truth: TruthRecord {
                production_vertex: Vector3::zeros(),
                decay_vertex: Vector3::new(1.0, 0.5, 0.2),
                mass: 0.497611,
                tau: 2.0,
            },
            head: None,
        }
    }

    #[test]
    fn test_export_json_shape() {
        let mut export = SimExport::new("ks_to_pipi", 42);
        export.add_event(record(0));
        export.add_event(record(1));
        export.finalize(true, ScenarioMetrics::default());

        let value = serde_json::to_value(&export).unwrap();
        assert_eq!(value["scenario"], "ks_to_pipi");
        assert_eq!(value["seed"], 42);
        assert_eq!(value["events"].as_array().unwrap().len(), 2);
        assert_eq!(value["events"][0]["status"], "converged");
        assert!(value["events"][0].get("head").is_none());
        assert!(value["events"][0].get("flags").is_none());
        assert_eq!(value["passed"], true);
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join(format!("treefit_export_{}.json", std::process::id()));
        let mut export = SimExport::new("d0_to_kpi", 7);
        export.add_event(record(0));
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["events"][0]["truth"]["tau"], 2.0);
    }
}
