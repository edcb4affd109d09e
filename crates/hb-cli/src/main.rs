//! Hostbridge CLI
//!
//! One-shot commands against a running host agent: execute a shell command,
//! read or write a file, open a target, fetch telemetry, or mint a shared
//! token for provisioning.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hb_client::BridgeClient;
use hb_core::auth;
use hb_core::config::{self, BridgeConfig};

#[derive(Parser)]
#[command(name = "hb")]
#[command(about = "Drive a Hostbridge host agent from the command line")]
#[command(version)]
struct Cli {
    /// Candidate ports to probe, in order (overrides the config file)
    #[arg(short, long, value_delimiter = ',', global = true)]
    ports: Option<Vec<u16>>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Shared token (falls back to HB_BRIDGE_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a shell command on the host and print its output
    Exec {
        /// The command line to run
        command: String,
    },

    /// Read a file from the host and print it
    Read {
        /// Path, resolved against the agent's working directory
        path: String,
    },

    /// Write a file on the host, creating missing parent directories
    Write {
        filename: String,
        /// Content; reads stdin when omitted
        content: Option<String>,
    },

    /// Open a path or URL with the host's default handler
    Open { target: String },

    /// Print the host's telemetry snapshot
    Config,

    /// Generate a shared token for provisioning host and clients
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Token minting needs no running agent
    if matches!(cli.command, Command::Token) {
        println!("{}", auth::generate_token());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let token = cli.token.clone().or_else(auth::configured_token);

    let client = BridgeClient::connect(config, token);
    client
        .wait_authorized(Duration::from_secs(15))
        .await
        .context("Could not reach a host agent - is hb-host running?")?;

    let outcome = run(&cli.command, &client).await;
    client.shutdown();
    outcome
}

async fn run(command: &Command, client: &BridgeClient) -> Result<()> {
    match command {
        Command::Exec { command } => {
            let result = client.execute(command).await?;
            print!("{}", result.output);
            std::io::stdout().flush().ok();
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }

        Command::Read { path } => {
            let content = client.read_file(path).await?;
            print!("{}", content);
            std::io::stdout().flush().ok();
            Ok(())
        }

        Command::Write { filename, content } => {
            let content = match content {
                Some(content) => content.clone(),
                None => {
                    let mut buf = String::new();
                    std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
                        .context("Failed to read content from stdin")?;
                    buf
                }
            };
            let status = client.write_file(filename, &content).await?;
            println!("{}", status);
            Ok(())
        }

        Command::Open { target } => {
            client.open(target).await?;
            Ok(())
        }

        Command::Config => {
            let snapshot = client.get_config().await?;
            println!("platform : {}", snapshot.platform);
            println!("arch     : {}", snapshot.arch);
            println!("hostname : {}", snapshot.hostname);
            println!("admin    : {}", snapshot.is_admin);
            println!("memory   : {} bytes", snapshot.memory_total);
            if let Some(cwd) = client.current_cwd() {
                println!("cwd      : {}", cwd);
            }
            Ok(())
        }

        // Handled in main before a client is built
        Command::Token => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            BridgeConfig::default()
        })
    } else {
        BridgeConfig::default()
    };

    if let Some(ports) = &cli.ports {
        config.candidate_ports = ports.clone();
    }

    Ok(config)
}
