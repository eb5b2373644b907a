//! brokerd: TCP front door of the message broker.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client                ┌──────────────────────────────────────────────────────┐
//!     ──────────────────────┼─▶ net::listener ──▶ net::acceptor ──▶ spawn task      │
//!                           │                                        │             │
//!                           │                                        ▼             │
//!                           │              server::TcpServer (handshake "  V2")    │
//!                           │                 │                 │                  │
//!                           │        bad tag  ▼                 ▼ known tag        │
//!                           │      E_BAD_PROTOCOL      registry.insert → io_loop   │
//!                           │         + close          → registry.remove + close   │
//!                           │                                                      │
//!                           │  config · observability · lifecycle (shutdown/drain) │
//!                           └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use brokerd::config::{load_config, validate_config, BrokerConfig, ConfigError};
use brokerd::lifecycle::signals::spawn_signal_handler;
use brokerd::observability::{logging, metrics};
use brokerd::Daemon;

#[derive(Parser, Debug)]
#[command(name = "brokerd", version, about = "TCP front door of the message broker")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept client connections on.
    #[arg(long)]
    tcp_address: Option<String>,

    /// Maximum concurrent client connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log filter (overridden by RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn resolve_config(&self) -> Result<BrokerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => BrokerConfig::default(),
        };

        if let Some(addr) = &self.tcp_address {
            config.listener.tcp_address = addr.clone();
        }
        if let Some(max) = self.max_connections {
            config.listener.max_connections = max;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "brokerd starting");

    tracing::info!(
        tcp_address = %config.listener.tcp_address,
        max_connections = config.listener.max_connections,
        drain_timeout_secs = config.shutdown.drain_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Validation guarantees the address parses.
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let daemon = Daemon::new(config);
    spawn_signal_handler(daemon.shutdown());

    daemon.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
