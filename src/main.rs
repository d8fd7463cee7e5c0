//! # tether
//!
//! Gateway binary: loads configuration, builds the backend pool and serves
//! WebSocket sessions until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use tether_backend::{catalog, BackendPool, FailoverPolicy};
use tether_core::config::GatewayConfig;
use tether_core::loader::{config_path, load_config_from_path};
use tether_telemetry::{init_telemetry, parse_level, parse_module_levels, TelemetryConfig};

/// Streaming prompt gateway.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Streaming prompt gateway")]
struct Cli {
    /// Path to the JSON config file (default `~/.tether/config.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides config).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Serve Prometheus metrics at `/metrics`.
    #[arg(long)]
    metrics: bool,
}

impl Cli {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.config.clone().unwrap_or_else(config_path);
    let mut config = load_config_from_path(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_telemetry(&TelemetryConfig {
        log_level: parse_level(&config.logging.level)?,
        module_levels: parse_module_levels(&config.logging.modules)?,
        json: config.logging.json,
    })
    .context("Failed to initialise logging")?;

    let metrics = if args.metrics {
        Some(tether_server::metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let backends = catalog(&config.backends);
    let backend_count = backends.len();
    let pool = BackendPool::new(backends, FailoverPolicy::from(&config.failover))
        .context("No backends configured")?;

    let server = tether_server::start(&config, Arc::new(pool), metrics)
        .await
        .context("Failed to start server")?;

    tracing::info!(
        "tether listening on ws://{}{} ({backend_count} backends)",
        server.addr(),
        config.server.ws_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown(config.server.shutdown_timeout()).await {
        tracing::warn!("some sessions did not finish before the shutdown timeout");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["tether"]);
        let mut config = GatewayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(!cli.metrics);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "tether",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--json-logs",
            "--metrics",
            "--config",
            "/etc/tether.json",
        ]);
        let mut config = GatewayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert!(cli.metrics);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tether.json")));
    }
}
