//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::errors::{GatewayError, GatewayResult};

/// Output format of the stderr log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "ssh2docker=debug" } else { "ssh2docker=info" }
}

/// A non-empty `RUST_LOG` replaces the default filter entirely.
fn build_filter(verbose: bool, rust_log: Option<&str>) -> GatewayResult<EnvFilter> {
    let directives = rust_log
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_directive(verbose));
    EnvFilter::try_new(directives)
        .map_err(|e| GatewayError::Config(format!("log filter {directives:?}: {e}")))
}

/// Install the global subscriber.  Logs go to stderr so command output on
/// stdout stays clean.
pub fn init(verbose: bool, format: LogFormat) -> GatewayResult<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(verbose, rust_log.as_deref())?;

    let (plain, json) = match format {
        LogFormat::Plain => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| GatewayError::Internal(format!("logging already initialised: {e}")))
}
