//! # wsrelay
//!
//! Websocket relay server binary: loads layered configuration, initialises
//! telemetry and serves the relay handler until ctrl-c.

#![deny(unsafe_code)]

mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use wsrelay_server::{load_config, ServerConfig, WsServer};
use wsrelay_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

use crate::relay::Relay;

/// Websocket relay server.
#[derive(Parser, Debug)]
#[command(name = "wsrelay", version, about = "Websocket relay server")]
struct Cli {
    /// JSON config file, deep-merged over the defaults.
    #[arg(long, short, env = "WSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides config and WSRELAY_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config and WSRELAY_PORT).
    #[arg(long, short)]
    port: Option<u16>,

    /// Maximum concurrent sessions.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Keepalive ping interval in seconds.
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "WSRELAY_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Log output format: pretty or json.
    #[arg(long, env = "WSRELAY_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            module_levels: Vec::new(),
            format: self.log_format,
        }
    }

    /// CLI flags are the last configuration layer.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = self.heartbeat_interval {
            config.heartbeat_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli.telemetry()).context("failed to initialise telemetry")?;

    let mut config = load_config(cli.config.as_deref()).context("failed to load config")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let server = WsServer::new(config, Arc::new(Relay));
    let (addr, acceptor) = server.listen().await.context("failed to start server")?;
    info!(%addr, "wsrelay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    if !server.graceful_shutdown().await {
        tracing::warn!("some sessions did not finish before the shutdown timeout");
    }
    acceptor.await.context("acceptor task failed")?;
    Ok(())
}
