//! Courier CLI
//!
//! Key generation and loopback simulation for the Courier reliable-delivery
//! client.

mod config;
mod progress;
mod simulate;

use clap::{Parser, Subcommand};
use courier_crypto::PrivateKey;
use std::path::{Path, PathBuf};

use config::Config;
use progress::{DeliveryProgress, format_bytes};

/// Courier - reliable delivery over an anonymous mix network
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Keygen {
        /// Output file for private key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Exchange messages between two sessions over a loopback mix network
    Simulate {
        /// Number of messages
        #[arg(short, long)]
        messages: Option<usize>,

        /// Payload size of each message in bytes
        #[arg(short, long)]
        size: Option<usize>,

        /// Per-leg loss probability
        #[arg(long)]
        loss: Option<f64>,

        /// One-way latency in milliseconds
        #[arg(long)]
        latency: Option<u64>,

        /// Sender private key file written by `keygen`
        #[arg(short, long)]
        identity: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&config_path)?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
        Commands::Simulate {
            messages,
            size,
            loss,
            latency,
            identity,
        } => {
            if let Some(messages) = messages {
                config.simulation.messages = messages;
            }
            if let Some(size) = size {
                config.simulation.message_size = size;
            }
            if let Some(loss) = loss {
                config.simulation.loss = loss;
            }
            if let Some(latency) = latency {
                config.simulation.latency_ms = latency;
            }
            config.validate()?;

            let identity = identity.as_deref().map(load_identity).transpose()?;
            run_simulation(&config, identity).await?;
        }
        Commands::Config { write } => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save(&config_path)?;
                println!("\nSaved to: {}", config_path.display());
            }
        }
    }

    Ok(())
}

/// Generate an identity keypair
fn generate_keypair(output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Generating new X25519 identity keypair...");

    let private_key = PrivateKey::random();
    println!("Public key: {}", private_key.public_key().to_hex());

    if let Some(output_path) = output {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&output_path, hex::encode(private_key.to_bytes()))?;

        println!("Private key saved to: {}", output_path.display());
        println!("\n⚠️  Keep this file secure! It contains your private key.");
    } else {
        println!("\n⚠️  Private key not saved (use --output to save)");
    }

    Ok(())
}

/// Read a hex private key written by `keygen`
fn load_identity(path: &Path) -> anyhow::Result<PrivateKey> {
    let contents = std::fs::read_to_string(path)?;
    let raw = hex::decode(contents.trim())?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|raw: Vec<u8>| anyhow::anyhow!("Private key must be 32 bytes, got {}", raw.len()))?;
    Ok(PrivateKey::from_bytes(bytes))
}

async fn run_simulation(config: &Config, identity: Option<PrivateKey>) -> anyhow::Result<()> {
    let sim = &config.simulation;
    println!(
        "Simulating {} x {} from {} to {} ({}ms ±{}ms, loss {:.0}%)",
        sim.messages,
        format_bytes(sim.message_size as u64),
        config.session.user,
        sim.peer,
        sim.latency_ms,
        sim.jitter_ms,
        sim.loss * 100.0
    );

    let progress = DeliveryProgress::new(sim.messages);
    let report = simulate::run(config, identity, &progress).await?;
    progress.finish_with_message(format!(
        "Delivered: {}  Failed: {}",
        report.delivered, report.failed
    ));

    println!("\nElapsed: {:.2?}", report.elapsed);
    println!(
        "Peer received: {} messages ({})",
        report.received,
        format_bytes(report.received_bytes)
    );
    println!(
        "Network: {} sent, {} delivered, {} dropped, {} acked",
        report.network.sent, report.network.delivered, report.network.dropped, report.network.acked
    );

    if report.failed > 0 {
        anyhow::bail!("{} of {} messages failed", report.failed, sim.messages);
    }
    Ok(())
}
