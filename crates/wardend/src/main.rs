use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warden_core::{Recognizer, TemplateStore};
use warden_store::SqliteStore;

mod config;
mod dbus_interface;
mod sources;
mod writer;

const BUS_NAME: &str = "org.warden.Warden1";
const OBJECT_PATH: &str = "/org/warden/Warden1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("wardend starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        sources = config.sources.len(),
        bus = ?config.bus,
        match_threshold = config.matching.match_threshold,
        window_size = config.matching.window_size,
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let snapshot = store.load().context("loading stored templates")?;
    let recognizer = Arc::new(
        Recognizer::restore(config.matching.clone(), snapshot)
            .context("restoring recognizer state")?,
    );
    let store = writer::spawn_writer(store)?;

    for path in &config.sources {
        sources::spawn_source(path.clone(), &recognizer, store.clone())
            .with_context(|| format!("spawning source {}", path.display()))?;
    }

    let service = dbus_interface::WardenService::new(Arc::clone(&recognizer), store.clone());
    let builder = match config.bus {
        config::BusKind::System => zbus::connection::Builder::system()?,
        config::BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, "wardend ready");

    // Source threads run until their streams end; the process lives until signaled.
    tokio::signal::ctrl_c().await?;
    tracing::info!("wardend shutting down");
    store.flush().await?;

    Ok(())
}
