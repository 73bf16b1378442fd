//! deltasync relay server
//!
//! Fronts one sync coordinator over HTTP. The relay stores only ciphertext
//! and signed version pointers; it never holds the dataset secret.

mod cleanup;
mod config;
mod error;
mod handlers;
mod server;
mod storage;

use chrono::{TimeZone, Utc};
use clap::Parser;
use deltasync_core::Server;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deltasync-relay", about = "deltasync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    tracing::info!("Starting deltasync relay on {}", cfg.listen_addr);

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let coordinator = Server::new(cfg.sync.clone());
    if let Some(stored) = storage.load_version()? {
        let saved_at = Utc
            .timestamp_opt(stored.saved_at, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| stored.saved_at.to_string());
        tracing::info!(
            "Restoring seqnum {} saved at {}",
            stored.seqnum,
            saved_at
        );
        coordinator.restore(&stored.pointer, stored.kevs).await?;
    }

    cleanup::spawn_cleanup_task(
        coordinator.clone(),
        Duration::from_secs(cfg.cleanup_interval_secs.max(1)),
        Duration::from_secs(cfg.sync.accumulator_ttl_secs),
    );

    let state = server::AppState::new(coordinator, storage);
    let app = server::build_router(state, &cfg);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
