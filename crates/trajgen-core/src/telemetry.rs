use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::TrajgenError;

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();

const CRATES: [&str; 3] = ["trajgen_core", "trajgen_tools", "trajgen"];

/// How the process-wide log subscriber is set up.
///
/// Logs always go to stderr so command output on stdout (JSON reports,
/// transcripts) stays machine-readable.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Explicit filter directives; falls back to `RUST_LOG`, then to `level`.
    pub env_filter: Option<String>,
    /// Level applied to the trajgen crates when no directives are given.
    pub level: Level,
    /// Colour output; `None` enables it only when stderr is a terminal.
    pub ansi: Option<bool>,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            level: Level::INFO,
            ansi: None,
        }
    }
}

impl TelemetryOptions {
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = Level::DEBUG;
        }
        self
    }

    fn directives(&self) -> String {
        if let Some(filter) = &self.env_filter {
            return filter.clone();
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            return filter;
        }
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = vec!["warn".to_string()];
        directives.extend(CRATES.iter().map(|krate| format!("{krate}={level}")));
        directives.join(",")
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), TrajgenError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_new(options.directives()).map_err(|err| {
        TrajgenError::InvalidConfiguration(format!("invalid log filter: {err}"))
    })?;
    let ansi = options.ansi.unwrap_or_else(|| io::stderr().is_terminal());

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .try_init()
        .map_err(|err| TrajgenError::InvalidConfiguration(format!("log subscriber: {err}")))?;

    SUBSCRIBER_INSTALLED.get_or_init(|| ());
    Ok(())
}
