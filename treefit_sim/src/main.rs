//! TreeFit closure-test CLI
//!
//! Runs decay scenarios through the fitter and reports pulls and
//! chi-square probabilities.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use treefit_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SimExport};

/// TreeFit closure-test CLI
#[derive(Parser, Debug)]
#[command(name = "treefit-sim")]
#[command(about = "Fit simulated decays and check the fit against the truth", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Events generated per scenario
    #[arg(short, long, default_value = "200")]
    events: usize,

    /// Scenario to run (ks_to_pipi, d0_to_kpi, dplus_three_body, d0_with_pi0,
    /// b0_to_jpsi_ks, lambda_lifetime, b0_to_jpsi_klong, standard, all)
    #[arg(short = 'S', long, default_value = "standard")]
    scenario: String,

    /// Number of consecutive seeds to test
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Write per-event results of a single scenario to this JSON file
    #[arg(long)]
    export: Option<String>,
}

/// Default log level; `--json` keeps the log to warnings unless asked.
fn default_log_level(verbose: bool, json: bool) -> &'static str {
    match (verbose, json) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    }
}

/// Logs go to stderr so that stdout carries only the JSON summary.
fn init_logging(verbose: bool, json: bool) {
    let default = default_log_level(verbose, json);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn parse_scenarios(name: &str) -> Result<Vec<ScenarioId>, String> {
    match name {
        "all" => Ok(ScenarioId::all()),
        "standard" => Ok(ScenarioId::standard()),
        other => other.parse().map(|s| vec![s]),
    }
}

fn base_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn run_with_export(runner: &ScenarioRunner, scenario: ScenarioId, seed: u64, path: &str) -> ScenarioResult {
    let mut export = SimExport::new(scenario.name(), seed);
    let result = runner.run_with_export(scenario, &mut export);
    match export.write_to_file(path) {
        Ok(()) => info!("Exported {} events to {}", export.events.len(), path),
        Err(e) => error!("Failed to write export: {}", e),
    }
    result
}

fn json_summary(results: &[ScenarioResult]) -> serde_json::Value {
    let failed = results.iter().filter(|r| !r.passed).count();
    serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results,
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.json);

    if !args.json {
        info!("TreeFit closure tests v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios = match parse_scenarios(&args.scenario) {
        Ok(scenarios) => scenarios,
        Err(e) => {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, standard, all", names.join(", "));
            return ExitCode::FAILURE;
        }
    };
    if args.export.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        eprintln!("Error: --export only supports a single scenario and seed");
        return ExitCode::FAILURE;
    }

    let base = base_seed(args.seed);
    let mut results: Vec<ScenarioResult> = Vec::new();

    for offset in 0..args.seeds {
        let seed = base.wrapping_add(offset as u64);
        let runner = ScenarioRunner::new(seed, args.events);

        for &scenario in &scenarios {
            let result = match &args.export {
                Some(path) => run_with_export(&runner, scenario, seed, path),
                None => runner.run(scenario),
            };

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario, seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario,
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            results.push(result);
        }
    }

    let total = results.len();
    let failed = results.iter().filter(|r| !r.passed).count();

    if args.json {
        match serde_json::to_string_pretty(&json_summary(&results)) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed, total);
            for result in results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario,
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_mode_logs_warnings_only() {
        assert_eq!(default_log_level(false, true), "warn");
        assert_eq!(default_log_level(false, false), "info");
        assert_eq!(default_log_level(true, true), "debug");
    }

    #[test]
    fn test_json_summary_parses_back() {
        let runner = ScenarioRunner::new(4, 3);
        let results = vec![runner.run(ScenarioId::KsToPiPi), runner.run(ScenarioId::D0ToKPi)];

        let text = serde_json::to_string_pretty(&json_summary(&results)).unwrap();
        assert!(text.starts_with('{'));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["total"], 2);
        assert_eq!(parsed["results"][1]["scenario"], "d0_to_kpi");
        let scenario: ScenarioId = serde_json::from_value(parsed["results"][0]["scenario"].clone()).unwrap();
        assert_eq!(scenario, ScenarioId::KsToPiPi);
    }

    #[test]
    fn test_parse_scenarios() {
        assert_eq!(parse_scenarios("all").unwrap(), ScenarioId::all());
        assert_eq!(parse_scenarios("ks_to_pipi").unwrap(), vec![ScenarioId::KsToPiPi]);
        assert!(parse_scenarios("nope").is_err());
    }
}
