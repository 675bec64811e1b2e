// =============================================================================
// Zenix Core — Main Entry Point
// =============================================================================
//
// Boot order: load configuration, open persistence, wire the venue gateway
// and tick store, build the shared `AppState`, run the Orchestrator's
// startup clean-up, then bring the tick stream and background loops online.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysis;
mod app_state;
mod logging;
mod money_management;
mod orchestrator;
mod persistence;
mod risk;
mod runtime_config;
mod session;
mod strategy;
mod tick_store;
mod trade_ledger;
mod types;
mod venue;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::logging::LogQueue;
use crate::orchestrator::Orchestrator;
use crate::persistence::Store;
use crate::runtime_config::RuntimeConfig;
use crate::tick_store::TickStore;
use crate::types::Tick;
use crate::venue::client::VenueGateway;

const CONFIG_PATH: &str = "runtime_config.json";
const DB_PATH: &str = "zenix.db";
const TICK_SNAPSHOT_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                  Zenix Core — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    let db_path = std::env::var("ZENIX_DB_PATH").unwrap_or_else(|_| DB_PATH.to_string());
    let store = Arc::new(Store::open(&db_path)?);
    let tick_store = Arc::new(TickStore::new(config.max_history));
    let venue = VenueGateway::new(&config, tick_store.clone());

    let log_store = store.clone();
    let log_queue = LogQueue::spawn(config.log_batch_size, Duration::from_secs(5), move |batch| {
        log_store.insert_log_batch(batch)?;
        Ok(())
    });

    let primary_symbol = config.primary_symbol.clone();
    let app = AppState::new(config, store.clone(), tick_store.clone(), venue.clone(), log_queue);

    Orchestrator::startup_cleanup(&app).await?;
    Orchestrator::periodic_sync(&app).await;
    info!(tracked = app.tracked_user_ids().len(), "initial session sync complete");

    if let Ok(Some(snapshot_json)) = store.load_tick_snapshot(&primary_symbol) {
        match serde_json::from_str::<Vec<Tick>>(&snapshot_json) {
            Ok(ticks) => {
                info!(symbol = %primary_symbol, count = ticks.len(), "restored tick snapshot from persistence");
                tick_store.replace_all(&primary_symbol, ticks);
            }
            Err(e) => warn!(error = %e, "failed to parse persisted tick snapshot, starting from an empty window"),
        }
    }

    venue.ensure_market_data(&[primary_symbol.clone()]).await;

    let sync_app = app.clone();
    tokio::spawn(async move {
        let interval = sync_app.runtime_config.read().periodic_sync_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first real sync already ran above
        loop {
            ticker.tick().await;
            Orchestrator::periodic_sync(&sync_app).await;
        }
    });

    let dispatch_app = app.clone();
    tokio::spawn(Orchestrator::run_tick_dispatch(dispatch_app));

    let snapshot_store = store.clone();
    let snapshot_ticks = tick_store.clone();
    let snapshot_symbol = primary_symbol.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SNAPSHOT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let ticks = snapshot_ticks.last_n(&snapshot_symbol, 50);
            if ticks.is_empty() {
                continue;
            }
            match serde_json::to_string(&ticks) {
                Ok(json) => {
                    let now = chrono::Utc::now().to_rfc3339();
                    if let Err(e) = snapshot_store.save_tick_snapshot(&snapshot_symbol, &json, ticks.len() as u64, &now) {
                        warn!(error = %e, "failed to persist tick snapshot");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize tick snapshot"),
            }
        }
    });

    info!(symbol = %primary_symbol, "Zenix Core is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    venue.shutdown().await;
    app.log_queue.flush().await;

    if let Err(e) = app.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Zenix Core shut down complete.");
    Ok(())
}
