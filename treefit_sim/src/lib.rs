//! TreeFit closure-test harness
//!
//! Generates decays with known truth, fits them and checks that the fit
//! reproduces the truth within its own errors.
//!
//! All randomness is derived from a single 64-bit seed, so a failing run
//! can be replayed exactly.
//!
//! ```text
//!   ScenarioId ──decay()──▶ Oracle ──candidate──▶ Fitter
//!                             │                      │
//!                           truth                 result
//!                             └──────▶ pulls ◀───────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use treefit_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 500).run(ScenarioId::B0ToJpsiKs);
//! assert!(result.passed, "{:?}", result.failure_reason);
//! ```

pub mod error;
pub mod exporter;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use error::SimError;
pub use exporter::{EventRecord, SimExport, TruthRecord};
pub use oracle::{DecayDescriptor, GeneratedEvent, Oracle, Resolution, TruthParticle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, Thresholds};
pub use scenarios::ScenarioId;
