//! # tether
//!
//! WebSocket RPC server binary: loads configuration, initialises telemetry
//! and serves the built-in operations until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_server::config::{self, ServerConfig};
use tether_telemetry::TelemetryConfig;

/// Tether WebSocket RPC server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "WebSocket RPC operation dispatcher")]
struct Cli {
    /// Config file (defaults to ~/.tether/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if self.json_logs {
            config.log_json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);

    let log_level = config
        .log_level
        .parse::<tracing::Level>()
        .with_context(|| format!("Invalid log level: {}", config.log_level))?;
    let telemetry = tether_telemetry::init_telemetry(TelemetryConfig {
        log_level,
        json: config.log_json,
        ..Default::default()
    });

    let operations = Arc::new(tether_server::builtin_registry());
    let handle = tether_server::start(&config, operations, telemetry.metrics())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    tracing::info!(addr = %handle.addr(), "Listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    handle.shutdown().await;
    Ok(())
}
