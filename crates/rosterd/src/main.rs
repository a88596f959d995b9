use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod service;
mod store;

use config::{BusKind, Config};
use dbus_interface::{RosterService, BUS_NAME, OBJECT_PATH};
use extractor::CommandExtractor;
use service::Roster;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rosterd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.similarity_threshold.value(),
        bus = ?config.bus,
        "configuration loaded"
    );

    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    let engine = match config.extractor.as_deref().and_then(CommandExtractor::from_argv) {
        Some(extractor) => {
            tracing::info!(program = extractor.program(), "embedding extractor configured");
            Some(engine::spawn_engine(extractor)?)
        }
        None => {
            tracing::warn!(
                "no embedding extractor configured; image enrollment and recognition are disabled"
            );
            None
        }
    };

    let roster = Roster::new(
        store.clone(),
        store,
        config.similarity_threshold,
        engine,
        Duration::from_secs(config.extract_timeout_secs),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RosterService::new(roster))?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rosterd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rosterd shutting down");

    Ok(())
}
