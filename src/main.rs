//! Command-line interface for binlog-relay
//!
//! # Usage Examples
//!
//! ```bash
//! # Tail the binlog, resuming from the offset file (or the server tip on first run)
//! binlog-relay --config relay.yaml
//!
//! # Resume from an explicit position, ignoring the offset file
//! binlog-relay --config relay.yaml --from mysql:binlog.000042:1337
//!
//! # Shrink the event queue for low-memory deployments
//! binlog-relay --config relay.yaml --queue-capacity 16
//! ```
//!
//! # Offset Format
//! - MySQL: `mysql:<binlog file>:<position>` (e.g. `mysql:binlog.000042:1337`)

use anyhow::{ensure, Context};
use clap::Parser;
use offset_store::Offset;

use binlog_relay::publish::LogPublisher;
use binlog_relay::relay::run_relay;
use binlog_relay::Config;

#[derive(Parser)]
#[command(name = "binlog-relay")]
#[command(about = "A CDC agent that relays MySQL binlog changes as per-transaction events")]
#[command(long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "BINLOG_RELAY_CONFIG", default_value = "relay.yaml")]
    config: std::path::PathBuf,

    /// Resume position override (format: mysql:<binlog file>:<position>)
    #[arg(long)]
    from: Option<String>,

    /// Override the configured event queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(capacity) = cli.queue_capacity {
        ensure!(capacity > 0, "Queue capacity must be at least 1");
        config.relay.queue_capacity = capacity;
    }

    let start_from = cli
        .from
        .as_deref()
        .map(Offset::from_cli_string)
        .transpose()?;

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        tracing::info!("Received CTRL+C, shutting down");
        let _ = signal_tx.send(());
    });

    run_relay(&config, LogPublisher, &shutdown_tx, start_from).await
}
