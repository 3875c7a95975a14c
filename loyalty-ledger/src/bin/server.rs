//! Loyalty ledger service binary
//!
//! Opens the ledger and runs the expiration sweeper until Ctrl-C.

use anyhow::Context;
use loyalty_ledger::{spawn_sweeper, Config, LoyaltyLedger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting loyalty ledger");

    let config = match std::env::var("LOYALTY_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };
    config.validate().context("invalid configuration")?;

    let sweeper_enabled = config.sweeper.enabled;
    let sweep_period = Duration::from_secs(config.sweeper.interval_secs);

    let ledger = Arc::new(LoyaltyLedger::open(config).context("opening ledger")?);
    let stats = ledger.stats().context("reading storage stats")?;
    tracing::info!(
        entries = stats.total_entries,
        users = stats.total_users,
        pending_expiry_lots = stats.pending_expiry_lots,
        "Ledger opened successfully"
    );

    let sweeper = if sweeper_enabled {
        Some(spawn_sweeper(ledger.clone(), sweep_period))
    } else {
        tracing::info!("Expiration sweeper disabled");
        None
    };

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down loyalty ledger");
    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await?;
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if std::env::var("LOYALTY_LOG_JSON").map_or(false, |v| v == "1") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
