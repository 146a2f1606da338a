//! # CLI Interface
//!
//! Command-line argument structure for `tidepool-node`, built with `clap`
//! derive. Three subcommands: `simulate`, `check-config` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Tidepool vault scenario runner.
///
/// Replays a JSON scenario (price moves, deposits, withdrawals, operator
/// borrow/return cycles, admin actions) against a fresh vault and prints a
/// JSON report of every step plus the final vault state.
#[derive(Parser, Debug)]
#[command(
    name = "tidepool-node",
    about = "Tidepool vault scenario runner",
    version,
    propagate_version = true
)]
pub struct TidepoolCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a scenario file and print the report.
    Simulate(SimulateArgs),
    /// Validate an engine configuration file.
    CheckConfig(CheckConfigArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Scenario file (JSON).
    #[arg(long, short = 's')]
    pub scenario: PathBuf,

    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(long, short = 'c', env = "TIDEPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write the report here instead of stdout.
    #[arg(long, short = 'o')]
    pub report: Option<PathBuf>,

    /// Write Prometheus text metrics for the run to this file.
    #[arg(long)]
    pub metrics: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, env = "TIDEPOOL_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is not set.
    #[arg(long, default_value = "tidepool_node=info,tidepool_engine=info")]
    pub log_level: String,
}

/// Arguments for the `check-config` subcommand.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Engine configuration file (JSON).
    #[arg(long, short = 'c', env = "TIDEPOOL_CONFIG")]
    pub config: PathBuf,
}
