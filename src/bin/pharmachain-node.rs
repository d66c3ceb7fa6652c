#![forbid(unsafe_code)]
//! Runs one PharmaChain replication node.

use clap::Parser;
use colored::*;
use pharmachain::config::load_config;
use pharmachain::network::PeerAddr;
use pharmachain::node::Node;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Override network.listen_port
    #[arg(long)]
    port: Option<u16>,
    /// Extra peer to register at startup (host:port), repeatable
    #[arg(long = "peer")]
    peers: Vec<PeerAddr>,
    /// Seconds between background sync rounds (0 disables)
    #[arg(long, default_value_t = 30)]
    sync_interval: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = %e, "Node failed");
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }

    let node = Arc::new(Node::init(config).await?);
    for peer in cli.peers {
        node.register_peer(peer);
    }

    let addr = node.start().await?;
    println!(
        "{} {} listening on {}",
        "PharmaChain".bright_cyan().bold(),
        node.config.node.name.bright_white(),
        addr.to_string().bright_green()
    );

    if cli.sync_interval > 0 {
        let syncer = node.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cli.sync_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = syncer.sync_with_peers().await {
                    error!(error = %e, "Sync round failed");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown();
    Ok(())
}
