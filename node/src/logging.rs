//! # Structured Logging
//!
//! Initializes the `tracing` subscriber with a JSON or pretty formatter and
//! `RUST_LOG`-based filtering.
//!
//! All log output goes to stderr; stdout carries the scenario report.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, colored output.
    Pretty,
    /// JSON lines, one event per line.
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Call this exactly once, early in `main()`. Subsequent calls will panic.
///
/// `default_level` applies when `RUST_LOG` is unset, e.g.
///
/// ```text
/// RUST_LOG=tidepool_engine=debug,tidepool_node=info
/// ```
pub fn init_logging(default_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Exactly one of the two layers is `Some`.
    let pretty = (format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty)
        .with(json)
        .init();

    tracing::debug!(?format, "logging initialized");
}
