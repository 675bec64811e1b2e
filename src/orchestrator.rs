// =============================================================================
// Orchestrator -- startup clean-up, periodic sync, tick dispatch
// =============================================================================
//
// Three independent responsibilities that the binary's main loop spawns as
// separate tasks, mirroring the teacher's split between a one-shot startup
// routine and long-running background tasks in `main.rs`:
//
//   - `startup_cleanup` runs once, before anything else touches the tick
//     stream: every session left `is_active` from a crash is forced to
//     `stopped_server_restart`, and every `PENDING` trade is failed out.
//   - `periodic_sync` runs on a fixed interval and keeps `AppState::users`
//     mirroring `ai_user_config`'s active rows -- newly activated sessions
//     get tracked, externally deactivated ones get dropped.
//   - `run_tick_dispatch` is the permanent tick-fan-out loop: every inbound
//     tick for the primary symbol is handed to every currently tracked
//     user's `strategy::process_tick`, each spawned onto its own task so one
//     user's venue round-trip never delays another's.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::strategy;

pub struct Orchestrator;

impl Orchestrator {
    /// Run once at process start, before the tick stream or periodic sync
    /// are wired up.
    pub async fn startup_cleanup(app: &Arc<AppState>) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let deactivated = app.store.deactivate_all_active_sessions(&now)?;
        let failed_trades = app.store.fail_pending_trades(&now)?;
        // No ancillary "copy session" rows to close here -- copy-trading
        // fanout is an out-of-scope external collaborator, and this
        // schema carries no such table.
        info!(
            deactivated_sessions = deactivated,
            failed_pending_trades = failed_trades,
            "startup clean-up complete"
        );
        Ok(())
    }

    /// Diff persistence's active sessions against the in-memory tracking
    /// map: track anything newly active, untrack anything no longer active.
    pub async fn periodic_sync(app: &Arc<AppState>) {
        let active = match app.store.active_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "periodic sync failed to read active sessions");
                return;
            }
        };

        let active_ids: HashSet<String> = active.iter().map(|s| s.user_id.clone()).collect();
        let tracked_ids: HashSet<String> = app.tracked_user_ids().into_iter().collect();

        for session in active {
            if !app.is_tracked(&session.user_id) {
                info!(user_id = %session.user_id, "periodic sync tracking newly active session");
                app.track_user(session);
            }
        }

        for user_id in tracked_ids.difference(&active_ids) {
            info!(user_id, "periodic sync untracking session no longer active");
            app.untrack_user(user_id);
        }
    }

    /// Permanent loop: fan out every primary-symbol tick to every tracked
    /// user. Runs until the venue's broadcast channel closes (process
    /// shutdown).
    pub async fn run_tick_dispatch(app: Arc<AppState>) {
        let mut ticks = app.venue.subscribe_ticks();
        let primary_symbol = app.runtime_config.read().primary_symbol.clone();

        loop {
            let (symbol, tick) = match ticks.recv().await {
                Ok(pair) => pair,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "tick dispatch lagged behind venue fan-out");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    warn!("venue tick channel closed, stopping tick dispatch");
                    return;
                }
            };

            if symbol != primary_symbol {
                continue;
            }

            for user_id in app.tracked_user_ids() {
                let app = app.clone();
                tokio::spawn(async move {
                    strategy::process_tick(&app, &user_id, tick).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogQueue;
    use crate::persistence::Store;
    use crate::runtime_config::RuntimeConfig;
    use crate::session::UserSession;
    use crate::tick_store::TickStore;
    use crate::types::{Mode, RiskProfile, SessionStatus};
    use crate::venue::client::VenueGateway;

    fn sample_session(user_id: &str) -> UserSession {
        UserSession {
            id: format!("{user_id}-session"),
            user_id: user_id.to_string(),
            is_active: true,
            session_status: SessionStatus::Active,
            strategy: "orion".to_string(),
            mode: Mode::Veloz,
            risk_profile: RiskProfile::Conservador,
            deriv_token: "tok".to_string(),
            currency: "USD".to_string(),
            stake: 1.0,
            initial_capital: 100.0,
            session_balance: 0.0,
            profit_target: 10.0,
            loss_limit: 15.0,
            stop_blindado_percent: None,
            total_trades: 0,
            total_wins: 0,
            total_losses: 0,
            deactivation_reason: None,
            deactivated_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn build_state() -> Arc<AppState> {
        let config = RuntimeConfig::default();
        let store = Arc::new(Store::open_memory().unwrap());
        let tick_store = Arc::new(TickStore::new(config.max_history));
        let venue = VenueGateway::new(&config, tick_store.clone());
        let log_queue = LogQueue::spawn(10, std::time::Duration::from_secs(60), |_| Ok(()));
        AppState::new(config, store, tick_store, venue, log_queue)
    }

    #[tokio::test]
    async fn startup_cleanup_clears_crash_state() {
        let app = build_state();
        app.store.upsert_session(&sample_session("u1")).unwrap();
        Orchestrator::startup_cleanup(&app).await.unwrap();
        assert!(app.store.active_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn periodic_sync_tracks_and_untracks() {
        let app = build_state();
        app.store.upsert_session(&sample_session("u1")).unwrap();
        Orchestrator::periodic_sync(&app).await;
        assert!(app.is_tracked("u1"));

        app.store.deactivate_all_active_sessions("2026-01-02T00:00:00Z").unwrap();
        Orchestrator::periodic_sync(&app).await;
        assert!(!app.is_tracked("u1"));
    }
}
