#![forbid(unsafe_code)]
//! Operator tool for talking to PharmaChain nodes and managing institution keys.

use clap::{Parser, Subcommand};
use colored::*;
use pharmachain::codec::open_batch;
use pharmachain::crypto::{load_sealed_key, open_secret_key, save_sealed_key, seal_secret_key, KeyPair};
use pharmachain::network::{default_client, PeerAddr};
use pharmachain::transaction::tally;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Checks that a node answers PING
    Ping {
        /// Node address (host:port)
        node: PeerAddr,
    },
    /// Prints a node's chain length
    ChainLength { node: PeerAddr },
    /// Lists the peers a node knows
    Peers { node: PeerAddr },
    /// Asks `node` to register `peer`
    RegisterPeer { node: PeerAddr, peer: PeerAddr },
    /// Generates an institution key pair and writes a password-protected keystore
    Keygen {
        /// Where to write the keystore
        #[arg(long, default_value = "institution.key.json")]
        out: PathBuf,
    },
    /// Fetches a node's chain and decrypts it with the institution keystore
    Decrypt {
        node: PeerAddr,
        /// Keystore written by `keygen`
        #[arg(long, default_value = "institution.key.json")]
        keystore: PathBuf,
        /// Only this block
        #[arg(long)]
        block: Option<usize>,
        /// Print the stock tally for this pharmacy instead of raw records
        #[arg(long)]
        pharmacy: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let client = default_client();

    match cli.command {
        Commands::Ping { node } => {
            client.ping(&node).await?;
            println!("{} {}", "PONG".bright_green(), node);
        }
        Commands::ChainLength { node } => {
            let length = client.chain_length(&node).await?;
            println!("{} blocks at {}", length.to_string().bright_white().bold(), node);
        }
        Commands::Peers { node } => {
            let peers = client.list_peers(&node).await?;
            if peers.is_empty() {
                println!("{}", "No peers registered.".yellow());
            }
            for peer in peers {
                println!("{} {}", "•".bright_yellow(), peer);
            }
        }
        Commands::RegisterPeer { node, peer } => {
            client.register(&node, &peer).await?;
            println!("{} {} registered at {}", "OK".bright_green(), peer, node);
        }
        Commands::Keygen { out } => keygen(&out)?,
        Commands::Decrypt {
            node,
            keystore,
            block,
            pharmacy,
        } => {
            let sealed = load_sealed_key(&keystore)?;
            let password = rpassword::prompt_password("Keystore password: ")?;
            let keys = open_secret_key(&sealed, &password)?;

            let chain = client.full_chain(&node).await?;
            let selected: Vec<_> = match block {
                Some(index) => chain
                    .get(index)
                    .cloned()
                    .into_iter()
                    .collect(),
                None => chain,
            };
            if selected.is_empty() {
                return Err("no such block".into());
            }

            let mut records = Vec::new();
            for block in &selected {
                let opened = open_batch(block, &keys.secret_key)?;
                if pharmacy.is_none() && !opened.is_empty() {
                    println!("{} {}", format!("Block #{}", block.index).bright_cyan().bold(), block.short_hash());
                    for record in &opened {
                        println!("  {}", record);
                    }
                }
                records.extend(opened);
            }

            if let Some(pharmacy) = pharmacy {
                println!("{} {}", "Stock at".bright_cyan(), pharmacy.bright_white().bold());
                for line in tally(&records, &pharmacy).values() {
                    println!("  {:<12} {:<24} {:>8}", line.code, line.name, line.quantity);
                }
            }
        }
    }

    Ok(())
}

fn keygen(out: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if out.exists() {
        return Err(format!("{} already exists; refusing to overwrite", out.display()).into());
    }
    let password = rpassword::prompt_password("New keystore password: ")?;
    let confirm = rpassword::prompt_password("Repeat password: ")?;
    if password != confirm {
        return Err("passwords do not match".into());
    }

    let keys = KeyPair::generate();
    save_sealed_key(out, &seal_secret_key(&keys, &password)?)?;

    println!("{}", "Institution key generated".bright_green());
    println!("Keystore:   {}", out.display());
    println!("Public key: {}", keys.public_hex().bright_white());
    println!(
        "{}",
        "Set crypto.institution_public_key on every node to this value.".yellow()
    );
    Ok(())
}
