// Copyright (c) 2026 Tidepool Contributors. MIT License.
// See LICENSE for details.

//! # Tidepool Node
//!
//! Entry point for the `tidepool-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and replays scenarios against the
//! engine.
//!
//! - `simulate`     — replay a scenario file and print a JSON report
//! - `check-config` — validate an engine configuration file
//! - `version`      — print build version information

mod cli;
mod logging;
mod metrics;
mod runner;
mod scenario;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tidepool_engine::EngineConfig;

use cli::{Commands, TidepoolCli};
use logging::LogFormat;
use metrics::NodeMetrics;
use runner::Simulation;
use scenario::Scenario;

fn main() -> Result<()> {
    let cli = TidepoolCli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(args),
        Commands::CheckConfig(args) => check_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Replays one scenario and writes the report (and metrics, if asked).
fn simulate(args: cli::SimulateArgs) -> Result<()> {
    logging::init_logging(&args.log_level, args.log_format);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    let scenario = Scenario::load(&args.scenario)?;
    tracing::info!(
        scenario = %args.scenario.display(),
        steps = scenario.steps.len(),
        "replaying scenario"
    );

    let metrics = NodeMetrics::new().context("failed to create metrics registry")?;
    let report = Simulation::new(&scenario, &config, &metrics)
        .context("failed to set up the scenario vault")?
        .run(&scenario.name, &scenario.steps);

    let rendered = serde_json::to_string_pretty(&report).context("failed to render report")?;
    match &args.report {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("failed to write report to {}", path.display()))?,
        None => println!("{rendered}"),
    }

    if let Some(path) = &args.metrics {
        let text = metrics.encode().context("failed to encode metrics")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    if report.unexpected > 0 {
        anyhow::bail!("{} step(s) did not behave as expected", report.unexpected);
    }
    Ok(())
}

/// Validates a configuration file and prints it with defaults filled in.
fn check_config(args: cli::CheckConfigArgs) -> Result<()> {
    logging::init_logging("tidepool_node=warn", LogFormat::Pretty);

    let config = load_config(&args.config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    eprintln!("configuration ok: {}", args.config.display());
    Ok(())
}

/// Reads and validates an engine configuration file.
fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    EngineConfig::from_json_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))
}

/// Prints version information to stdout.
fn print_version() {
    println!("tidepool-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"vault": {{"withdraw_fee_bps": 25}}}}"#).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.vault.withdraw_fee_bps, 25);
        assert_eq!(config.oracle, EngineConfig::default().oracle);
    }

    #[test]
    fn load_config_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"vault": {{"loss_tolerance_bps": 10000}}}}"#).unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn bundled_scenario_replays_cleanly() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../scenarios/basic.json");
        let scenario = Scenario::load(&path).unwrap();
        let metrics = NodeMetrics::new().unwrap();
        let report = Simulation::new(&scenario, &EngineConfig::default(), &metrics)
            .unwrap()
            .run(&scenario.name, &scenario.steps);
        assert_eq!(report.unexpected, 0, "{report:#?}");
    }
}
