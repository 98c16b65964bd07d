//! Main entry point for the nodescope daemon.
//!
//! Loads the settings, initializes logging, builds the application context and
//! keeps the health monitor running until interrupted.

use anyhow::Context;
use backend::config::Settings;
use backend::{logging, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    logging::init(settings.log_level.as_deref());

    let context = AppContext::from_settings(&settings).context("building application context")?;
    context.initialize().await;

    let report = context.get_health_manager().await;
    for (source, record) in &report.sources {
        tracing::info!("{}: {:?}", source, record.status);
    }
    if !report.sources.values().any(|record| record.status.is_available()) {
        tracing::warn!("No data source is reachable yet; serving cached data only");
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("Shutting down");
    context.shutdown().await;
    Ok(())
}
