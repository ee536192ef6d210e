//! # huddle
//!
//! Room-based WebSocket chat relay binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_server::{JoinPolicy, ServerConfig};
use huddle_telemetry::TelemetryConfig;

/// Room-based WebSocket chat relay.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Room-based WebSocket chat relay")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Outbound messages buffered per client before new ones are dropped.
    #[arg(long, default_value = "256")]
    max_send_queue: usize,

    /// Seconds between WebSocket pings.
    #[arg(long, default_value = "30")]
    heartbeat_interval_secs: u64,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, default_value = "65536")]
    max_message_size: usize,

    /// What a second join on the same connection does: replace, keep-first or append.
    #[arg(long, default_value = "replace")]
    join_policy: JoinPolicy,

    /// Default log level. `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Per-module level override as `target=level`, e.g.
    /// `huddle_server::router=debug`. Repeatable.
    #[arg(long = "log-module", value_name = "TARGET=LEVEL", value_parser = parse_module_level)]
    log_modules: Vec<(String, tracing::Level)>,

    /// Persist warn and error logs to this `SQLite` file.
    #[arg(long)]
    log_db: Option<PathBuf>,
}

fn parse_module_level(s: &str) -> Result<(String, tracing::Level), String> {
    let (target, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=LEVEL, got '{s}'"))?;
    if target.is_empty() {
        return Err(format!("missing target in '{s}'"));
    }
    let level = level
        .parse::<tracing::Level>()
        .map_err(|_| format!("unknown log level '{level}'"))?;
    Ok((target.to_owned(), level))
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            module_levels: self.log_modules.clone(),
            log_db_path: self.log_db.clone(),
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            max_message_size: self.max_message_size,
            join_policy: self.join_policy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = huddle_telemetry::init_telemetry(cli.telemetry_config());
    if let Some(path) = telemetry.log_db_path() {
        tracing::info!(path = %path.display(), "persisting warn and error logs");
    }

    let prometheus = huddle_server::metrics::install_recorder().context("failed to install metrics recorder")?;
    let handle = huddle_server::start(cli.server_config(), prometheus)
        .await
        .context("failed to start relay server")?;
    tracing::info!(port = handle.port(), "huddle ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
