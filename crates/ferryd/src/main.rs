//! ferryd: Ferry peer discovery and file transfer daemon.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};

use ferry_core::config::FerryConfig;
use ferry_core::TransferError;
use ferry_services::discovery::local_identity;
use ferry_services::{Exporter, FileStore, ImportEvent, ImportServer};

mod prompt;

/// Discover peers and move a data file between them over UDP.
#[derive(Parser)]
#[command(name = "ferryd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for discovery probes and incoming transfers
    Import,

    /// Send the data file to a peer
    Export {
        /// Peer address, `ip` or `ip:port`
        target: String,

        /// File to send instead of the configured data file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Ask a peer for its name and addresses
    Discover {
        /// Peer address, `ip` or `ip:port`
        target: String,
    },

    /// Write the default config file if none exists
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(FerryConfig::file_path);

    if let Commands::InitConfig = cli.command {
        let path = FerryConfig::write_default_if_missing(&config_path)
            .context("failed to write default config")?;
        println!("Config at {}", path.display());
        return Ok(());
    }

    let config = FerryConfig::load_from(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match cli.command {
        Commands::Import => run_import(config, shutdown_tx).await,
        Commands::Export { target, file } => {
            let target = parse_target(&target, config.network.port)?;
            run_export(config, target, file, shutdown_tx).await
        }
        Commands::Discover { target } => {
            let target = parse_target(&target, config.network.port)?;
            let mut exporter = Exporter::bind(&config, target).await?;
            match exporter.discover(target).await {
                Ok(identity) => println!("Device response: {identity}"),
                Err(TransferError::PeerUnreachable(_)) => {
                    println!("No response from device or device offline.")
                }
                Err(e) => return Err(e).context("discovery failed"),
            }
            Ok(())
        }
        Commands::InitConfig => Ok(()),
    }
}

/// `ip` uses the configured port; `ip:port` is taken as-is.
fn parse_target(target: &str, default_port: u16) -> Result<SocketAddr> {
    let target = target.trim();
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = target
        .parse()
        .with_context(|| format!("invalid target address: {target:?}"))?;
    Ok(SocketAddr::new(ip, default_port))
}

async fn run_import(config: FerryConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let store = Arc::new(FileStore::new(config.storage.data_file.clone()));
    let (server, handle, mut events) = ImportServer::bind(&config, store, shutdown_tx.clone())
        .await
        .context("failed to bind import listener")?;

    let identity = local_identity(&config.identity);
    println!(
        "Starting import mode. Listening on {} as {}.",
        handle.local_addr()?,
        identity.name
    );
    println!("Available addresses:");
    for addr in &identity.addresses {
        println!(" - {addr}");
    }

    let server_task = tokio::spawn(server.run());

    let (offer_tx, offer_rx) = mpsc::unbounded_channel();
    tokio::spawn(prompt::accept_loop(handle.clone(), offer_rx));

    let session_printer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let sessions = handle.sessions();
                if sessions.is_empty() {
                    continue;
                }
                tracing::debug!(count = sessions.len(), "session table snapshot");
                for (key, state) in sessions {
                    tracing::debug!(%key, %state, "  session");
                }
            }
        })
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ImportEvent::Offer { key, total_bytes } => {
                        let _ = offer_tx.send(prompt::Offer { key, total_bytes });
                    }
                    ImportEvent::Refused { key, error } => {
                        tracing::debug!(%key, %error, "transfer request refused");
                    }
                    ImportEvent::Finished(report) if report.is_completed() => {
                        println!(
                            "Received {} bytes from {} in {:.2?}.",
                            report.bytes,
                            report.key.peer.ip(),
                            report.elapsed
                        );
                    }
                    ImportEvent::Finished(report) => {
                        println!("Transfer from {} ended: {}", report.key.peer.ip(), report.reason);
                    }
                    ImportEvent::Persisted { path, .. } => {
                        println!("Data saved to {}", path.display());
                    }
                    ImportEvent::PersistFailed { error, .. } => {
                        eprintln!("Failed to save data: {error}");
                    }
                }
            }
        }
    }

    session_printer.abort();
    match server_task.await {
        Ok(result) => result.context("import listener failed")?,
        Err(e) => tracing::error!(error = %e, "import listener task panicked"),
    }
    Ok(())
}

async fn run_export(
    config: FerryConfig,
    target: SocketAddr,
    file: Option<PathBuf>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let store = FileStore::new(file.unwrap_or_else(|| config.storage.data_file.clone()));
    println!("Starting export mode.");

    let mut exporter = Exporter::bind(&config, target)
        .await
        .context("failed to bind export socket")?;

    match exporter.export(target, &store, shutdown_tx.subscribe()).await {
        Ok(outcome) => {
            println!("Device response: {}", outcome.identity);
            println!(
                "Data transfer complete. {} bytes in {} chunks, {} retransmissions.",
                outcome.report.bytes, outcome.report.chunks, outcome.report.retransmissions
            );
            Ok(())
        }
        Err(TransferError::PeerUnreachable(_)) => {
            println!("No response from device or device offline.");
            Ok(())
        }
        Err(TransferError::SourceNotFound(path)) => {
            println!("Data file not found: {}", path.display());
            Ok(())
        }
        Err(e) => Err(e).context("export failed"),
    }
}
