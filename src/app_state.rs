// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth tying every subsystem together. Mirrors the
// teacher's `AppState`: `Arc`-wrapped subsystem handles, `parking_lot::RwLock`
// for the shared collections, and a `build_snapshot()` method that exists for
// a future read-only dashboard surface without that surface itself being
// wired up (the dashboard API/WS is an explicit out-of-process collaborator).
//
// The one thing this `AppState` adds beyond the teacher's shape is
// `UserRuntime`: the per-user `(UserSession, StrategyState)` pair guarded by
// its own `tokio::sync::Mutex`, which is what gives the Strategy Runtime its
// single-active-tick-per-user invariant (§5's concurrency model).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::logging::LogQueue;
use crate::persistence::Store;
use crate::runtime_config::RuntimeConfig;
use crate::session::{ConfigCache, StrategyState, UserId, UserSession};
use crate::tick_store::TickStore;
use crate::trade_ledger::TradeLedger;
use crate::venue::client::VenueGateway;

/// A user's live in-memory state: the persisted session row plus the
/// Strategy Runtime's mutable state machine, locked together so a tick is
/// never processed concurrently with another tick for the same user.
pub struct UserRuntime {
    pub session: UserSession,
    pub state: StrategyState,
}

/// Central application state shared across every async task via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every
    /// meaningful mutation -- a future dashboard feed's change signal.
    pub state_version: AtomicU64,

    pub runtime_config: RwLock<RuntimeConfig>,

    pub store: Arc<Store>,
    pub tick_store: Arc<TickStore>,
    pub venue: Arc<VenueGateway>,
    pub trade_ledger: Arc<TradeLedger>,
    pub log_queue: LogQueue,
    pub config_cache: Arc<ConfigCache>,

    /// Active users currently tracked in memory, mirrored from
    /// `ai_user_config` by the Orchestrator's startup sync and kept live by
    /// periodic re-sync.
    pub users: RwLock<HashMap<UserId, Arc<AsyncMutex<UserRuntime>>>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<Store>,
        tick_store: Arc<TickStore>,
        venue: Arc<VenueGateway>,
        log_queue: LogQueue,
    ) -> Arc<Self> {
        let ttl = config.config_cache_ttl();
        Arc::new(Self {
            state_version: AtomicU64::new(1),
            runtime_config: RwLock::new(config),
            store,
            tick_store,
            venue,
            trade_ledger: Arc::new(TradeLedger::new(500)),
            log_queue,
            config_cache: Arc::new(ConfigCache::new(ttl)),
            users: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Insert or replace a user's live runtime (startup sync, periodic
    /// sync, or a newly activated session).
    pub fn track_user(&self, session: UserSession) {
        let state = StrategyState::new(session.stake, session.mode);
        let user_id = session.user_id.clone();
        let runtime = Arc::new(AsyncMutex::new(UserRuntime { session, state }));
        self.users.write().insert(user_id, runtime);
        self.increment_version();
    }

    /// Drop a user from the live tracking map (e.g. after a terminal
    /// status transition).
    pub fn untrack_user(&self, user_id: &str) {
        self.users.write().remove(user_id);
        self.increment_version();
    }

    /// Snapshot of every currently tracked `UserId` -- used by the
    /// Orchestrator's periodic sync to diff against persistence without
    /// holding the map lock across an await point.
    pub fn tracked_user_ids(&self) -> Vec<UserId> {
        self.users.read().keys().cloned().collect()
    }

    pub fn is_tracked(&self, user_id: &str) -> bool {
        self.users.read().contains_key(user_id)
    }

    /// Build a read-only snapshot of engine-wide state. Kept for a future
    /// dashboard surface; nothing in this binary serves it over HTTP.
    pub fn build_snapshot(&self) -> EngineSnapshot {
        let now = Utc::now();
        let config = self.runtime_config.read();
        let users = self.users.read();

        EngineSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            primary_symbol: config.primary_symbol.clone(),
            tracked_users: users.len(),
            tick_count: self.tick_store.count(&config.primary_symbol),
        }
    }
}

/// Minimal read-only snapshot of engine-wide state, analogous in spirit to
/// the teacher's `StateSnapshot` but scoped to what this engine actually
/// tracks -- no HTTP surface serves this in-process.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub primary_symbol: String,
    pub tracked_users: usize,
    pub tick_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mode, RiskProfile, SessionStatus};

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

    #[test]
    fn track_and_untrack_user() {
        let app = build_state();
        app.track_user(sample_session("u1"));
        assert!(app.is_tracked("u1"));
        assert_eq!(app.tracked_user_ids(), vec!["u1".to_string()]);
        app.untrack_user("u1");
        assert!(!app.is_tracked("u1"));
    }

    #[test]
    fn snapshot_reflects_tracked_user_count() {
        let app = build_state();
        app.track_user(sample_session("u1"));
        app.track_user(sample_session("u2"));
        let snapshot = app.build_snapshot();
        assert_eq!(snapshot.tracked_users, 2);
    }
}
