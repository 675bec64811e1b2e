// =============================================================================
// UserSession, StrategyState and the 1-second CachedUserConfig cache
// =============================================================================
//
// `UserSession` is the persisted row; `StrategyState` is the in-memory state
// machine the Strategy Runtime mutates tick-by-tick; `CachedUserConfig` is
// the short-TTL read-through cache the pre-trade gate consults so it never
// round-trips to persistence on every tick. The cache's check-then-maybe-
// write-lock refresh mirrors the teacher's `maybe_reset_daily` idiom.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Mode, Parity, RiskProfile, SessionStatus};

pub type UserId = String;
pub type SessionId = String;

/// One row of `ai_user_config`: a contiguous run of trading for a user,
/// bounded by activation and a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub is_active: bool,
    pub session_status: SessionStatus,
    pub strategy: String,
    pub mode: Mode,
    pub risk_profile: RiskProfile,
    pub deriv_token: String,
    pub currency: String,
    /// Configured stake per entry (`stake_amount` / baseStake).
    pub stake: f64,
    /// Capital the session started with (`entry_value` / initialCapital),
    /// the anchor the Risk Controller's loss-budget and shielded-stop
    /// formulas are computed against.
    pub initial_capital: f64,
    pub session_balance: f64,
    pub profit_target: f64,
    pub loss_limit: f64,
    pub stop_blindado_percent: Option<f64>,
    pub total_trades: u32,
    pub total_wins: u32,
    pub total_losses: u32,
    pub deactivation_reason: Option<String>,
    pub deactivated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl UserSession {
    /// Deactivate this session in place with a terminal status and a
    /// human-readable reason. Callers still must persist the change.
    pub fn deactivate(&mut self, status: SessionStatus, reason: String, now_rfc3339: &str) {
        self.is_active = false;
        self.session_status = status;
        self.deactivation_reason = Some(reason);
        self.deactivated_at = Some(now_rfc3339.to_string());
        self.updated_at = now_rfc3339.to_string();
    }
}

/// Per-user in-memory state machine, mutated only by the Strategy Runtime.
///
/// Invariant: if `is_operation_active` is true, no new operation may start;
/// if `losses_accum > 0` then `last_martingale_direction` is `Some` and any
/// next operation uses that direction regardless of a fresh signal.
#[derive(Debug, Clone)]
pub struct StrategyState {
    pub capital: f64,
    pub virtual_capital: f64,
    pub is_operation_active: bool,
    pub martingale_step: u32,
    pub losses_accum: f64,
    pub base_stake: f64,
    pub initial_stake: f64,
    /// The stake actually paid on the immediately preceding entry; feeds
    /// `money_management::LadderInput::previous_stake` for Soros.
    pub previous_stake: f64,
    pub consecutive_wins: u8,
    pub last_profit: f64,
    pub last_martingale_direction: Option<Parity>,
    pub pacing_cursor: PacingCursor,
}

/// Mode-specific pacing state: ticks-since-last-op for Veloz, a wall-clock
/// timestamp for Moderado, or nothing for Preciso (quality-gated only).
#[derive(Debug, Clone, Copy)]
pub enum PacingCursor {
    TicksSinceLastOp(u32),
    LastOperationAt(Option<i64>),
    Unused,
}

impl StrategyState {
    pub fn new(base_stake: f64, mode: Mode) -> Self {
        Self {
            capital: 0.0,
            virtual_capital: 0.0,
            is_operation_active: false,
            martingale_step: 0,
            losses_accum: 0.0,
            base_stake,
            initial_stake: base_stake,
            previous_stake: base_stake,
            consecutive_wins: 0,
            last_profit: 0.0,
            last_martingale_direction: None,
            pacing_cursor: match mode {
                Mode::Veloz => PacingCursor::TicksSinceLastOp(0),
                Mode::Moderado => PacingCursor::LastOperationAt(None),
                Mode::Preciso => PacingCursor::Unused,
            },
        }
    }

    /// Reset the ladder to a fresh base entry -- used both after a
    /// completed Soros cycle and after a martingale clamp resets the
    /// session's recovery.
    pub fn reset_ladder(&mut self) {
        self.martingale_step = 0;
        self.losses_accum = 0.0;
        self.consecutive_wins = 0;
        self.last_profit = 0.0;
        self.last_martingale_direction = None;
        self.initial_stake = self.base_stake;
        self.previous_stake = self.base_stake;
    }
}

/// Short-TTL read-through snapshot of the fields the pre-trade gate needs,
/// refreshed from persistence at most once per `ttl`.
#[derive(Debug, Clone)]
pub struct CachedUserConfig {
    pub session_balance: f64,
    pub profit_target: f64,
    pub loss_limit: f64,
    pub session_status: SessionStatus,
    pub is_active: bool,
    pub last_update: Instant,
}

/// Per-user cache of `CachedUserConfig`, invalidated on any
/// configuration/balance mutation and otherwise refreshed only after `ttl`
/// elapses -- a read-mostly workload served by a read lock in the common
/// case, matching the teacher's check-then-maybe-write-lock pattern.
pub struct ConfigCache {
    entries: RwLock<HashMap<UserId, CachedUserConfig>>,
    ttl: Duration,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Return a fresh cached entry if present and within TTL.
    pub fn get_fresh(&self, user_id: &str) -> Option<CachedUserConfig> {
        let map = self.entries.read();
        map.get(user_id).and_then(|entry| {
            if entry.last_update.elapsed() < self.ttl {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    /// Insert or replace a user's cached entry, stamping `last_update` to
    /// now.
    pub fn put(&self, user_id: UserId, mut entry: CachedUserConfig) {
        entry.last_update = Instant::now();
        self.entries.write().insert(user_id, entry);
    }

    /// Drop a user's cached entry so the next read is forced to refresh
    /// from persistence -- called on every session-status mutation.
    pub fn invalidate(&self, user_id: &str) {
        self.entries.write().remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_ladder_clears_recovery_fields() {
        let mut state = StrategyState::new(1.00, Mode::Veloz);
        state.losses_accum = 5.0;
        state.last_martingale_direction = Some(Parity::Par);
        state.consecutive_wins = 2;
        state.reset_ladder();
        assert_eq!(state.losses_accum, 0.0);
        assert!(state.last_martingale_direction.is_none());
        assert_eq!(state.consecutive_wins, 0);
        assert_eq!(state.initial_stake, state.base_stake);
    }

    #[test]
    fn cache_entry_expires_after_ttl() {
        let cache = ConfigCache::new(Duration::from_millis(1));
        cache.put(
            "u1".to_string(),
            CachedUserConfig {
                session_balance: 0.0,
                profit_target: 10.0,
                loss_limit: 10.0,
                session_status: SessionStatus::Active,
                is_active: true,
                last_update: Instant::now(),
            },
        );
        assert!(cache.get_fresh("u1").is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_fresh("u1").is_none());
    }

    #[test]
    fn invalidate_forces_refresh() {
        let cache = ConfigCache::new(Duration::from_secs(60));
        cache.put(
            "u1".to_string(),
            CachedUserConfig {
                session_balance: 0.0,
                profit_target: 10.0,
                loss_limit: 10.0,
                session_status: SessionStatus::Active,
                is_active: true,
                last_update: Instant::now(),
            },
        );
        assert!(cache.get_fresh("u1").is_some());
        cache.invalidate("u1");
        assert!(cache.get_fresh("u1").is_none());
    }
}
