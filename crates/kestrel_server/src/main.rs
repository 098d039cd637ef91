use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use kestrel_common::config::KestrelConfig;
use kestrel_engine::Database;
use kestrel_server::KestrelServer;

#[derive(Parser, Debug)]
#[command(name = "kestrel", about = "KestrelDB — in-memory transactional tuple store")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "kestrel.toml")]
    config: String,

    /// Listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Reject all DML (overrides config).
    #[arg(long)]
    read_only: bool,

    /// Keep reading past checksum mismatches and corrupted spans during
    /// recovery.
    #[arg(long)]
    force_recovery: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", toml::to_string_pretty(&KestrelConfig::default())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("starting KestrelDB {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&cli.config);
    if let Some(ref addr) = cli.listen {
        config.server.listen_addr = addr.clone();
    }
    if let Some(ref dir) = cli.data_dir {
        config.server.data_dir = dir.clone();
    }
    if cli.read_only {
        config.server.read_only = true;
    }
    if cli.force_recovery {
        config.wal.force_recovery = true;
        tracing::warn!("force recovery enabled: damaged log spans will be skipped");
    }

    let db = Arc::new(Database::open(&config).map_err(|e| anyhow::anyhow!("{e}"))?);
    tracing::info!(vclock = %db.vclock(), "recovery finished");

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    tracing::info!(addr = %config.server.listen_addr, "listening");
    let server = KestrelServer::new(config, Arc::clone(&db));
    server.serve(listener, shutdown_signal()).await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // Close the journal segment cleanly so restart skips the tail scan.
    db.journal().close().map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn load_config(path: &str) -> KestrelConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path, "config loaded");
                config
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "unparsable config, using defaults");
                KestrelConfig::default()
            }
        },
        Err(_) => {
            tracing::info!(path, "no config file, using defaults");
            KestrelConfig::default()
        }
    }
}
