//! # huddle-telemetry
//!
//! Tracing subscriber setup for the relay: JSON logs on stdout and optional
//! SQLite persistence of warn+ events.

mod logging;

pub use logging::{SqliteLogLayer, SqliteLogSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log database {path}: {source}")]
    LogDatabase {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "huddle_server::router" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Where to persist warn+ logs. `None` keeps logs on stdout only.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,huddle_server::router=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// What [`init_telemetry`] ended up setting up.
#[derive(Debug)]
pub struct TelemetryGuard {
    log_db_path: Option<PathBuf>,
}

impl TelemetryGuard {
    /// Database warn+ events are written to, if it could be opened.
    pub fn log_db_path(&self) -> Option<&Path> {
        self.log_db_path.as_deref()
    }
}

pub fn open_log_sink(path: &Path) -> Result<SqliteLogSink, TelemetryError> {
    SqliteLogSink::open(path).map_err(|source| TelemetryError::LogDatabase {
        path: path.to_path_buf(),
        source,
    })
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sink_error) = match config.log_db_path.as_deref().map(open_log_sink) {
        Some(Ok(sink)) => (Some(SqliteLogLayer::new(Arc::new(sink))), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let log_db_path = if sqlite_layer.is_some() { config.log_db_path } else { None };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    if let Some(e) = sink_error {
        tracing::warn!(error = %e, "log persistence disabled");
    }

    TelemetryGuard { log_db_path }
}
