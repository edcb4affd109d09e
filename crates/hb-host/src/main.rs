//! Hostbridge host agent daemon
//!
//! Binds the first free candidate port on loopback and serves bridge
//! connections until interrupted. A shared secret, when present in
//! `HB_BRIDGE_TOKEN`, gates every connection.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hb_core::auth;
use hb_core::config::{self, BridgeConfig};
use hb_host::HostListener;

#[derive(Parser)]
#[command(name = "hb-host")]
#[command(about = "Hostbridge host agent - serves bridge commands on loopback")]
#[command(version)]
struct Args {
    /// Candidate ports to try, in order (overrides the config file)
    #[arg(short, long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Hostbridge host agent starting...");

    // Load configuration
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            BridgeConfig::default()
        })
    } else {
        BridgeConfig::default()
    };

    if let Some(ports) = args.ports {
        config.candidate_ports = ports;
    }

    let token = auth::configured_token();
    if token.is_some() {
        tracing::info!("Shared token configured; connections must authenticate");
    } else {
        tracing::info!("No shared token configured; loopback connections are trusted");
    }

    let cancel = CancellationToken::new();

    // Exhausting the candidate list is unrecoverable at startup
    let listener = match HostListener::bind(&config.candidate_ports, token, cancel.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    // Shut down cleanly on ctrl-c
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    listener.run().await
}
