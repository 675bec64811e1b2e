// =============================================================================
// Risk Controller — pre-trade gate, martingale clamp, shielded stop
// =============================================================================
//
// Unlike a stateful engine with its own internal counters, this controller
// owns no state of its own: session balance, profit target, loss limit and
// shielded-stop percent live on the caller's `CachedUserConfig`
// (`session.rs`), refreshed through the 1-second TTL cache. Every function
// here is a pure judgement over the fields it is given, so the only mutable
// state a caller must thread through is whatever it already holds.
//
// Transitions this module *recommends* (a new `SessionStatus` plus a reason
// string) must still be written to persistence and the cache invalidated by
// the caller -- the controller does not reach into persistence itself.

use crate::money_management::{should_reset_after_loss, LadderOutput};
use crate::types::{RiskProfile, SessionStatus};

/// Minimal view of a session's risk-relevant fields, refreshed from the
/// 1-second `CachedUserConfig` cache before every pre-trade check.
#[derive(Debug, Clone, Copy)]
pub struct SessionRiskView {
    pub is_active: bool,
    pub session_status: SessionStatus,
    pub session_balance: f64,
    pub profit_target: f64,
    pub loss_limit: f64,
}

/// Outcome of the pre-trade gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Allow,
    Block {
        new_status: Option<SessionStatus>,
        reason: String,
    },
}

/// Pre-trade gate: consults the cached session view and decides whether a
/// new operation may start this tick.
///
/// Order matters -- an already-terminal session is reported as-is; a fresh
/// breach of profit target or loss limit additionally carries the status
/// transition the caller must persist.
pub fn pre_trade_gate(view: &SessionRiskView) -> GateVerdict {
    if !view.is_active {
        return GateVerdict::Block {
            new_status: None,
            reason: "no active session".to_string(),
        };
    }
    if view.session_status.is_terminal() {
        return GateVerdict::Block {
            new_status: None,
            reason: format!("session already {}", view.session_status),
        };
    }
    if view.profit_target > 0.0 && view.session_balance >= view.profit_target {
        return GateVerdict::Block {
            new_status: Some(SessionStatus::StoppedProfit),
            reason: format!(
                "profit target reached: balance {:.2} >= target {:.2}",
                view.session_balance, view.profit_target
            ),
        };
    }
    if view.loss_limit > 0.0 && view.session_balance <= -view.loss_limit {
        return GateVerdict::Block {
            new_status: Some(SessionStatus::StoppedLoss),
            reason: format!(
                "loss limit reached: balance {:.2} <= -{:.2}",
                view.session_balance, view.loss_limit
            ),
        };
    }
    GateVerdict::Allow
}

/// Outcome of the martingale clamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClampVerdict {
    /// The computed stake fits within the remaining loss budget; use it
    /// unchanged.
    Unclamped,
    /// The computed stake would exceed the remaining loss budget; the
    /// ladder must reset to base stake and `losses_accum` / the saved
    /// martingale direction must be cleared.
    Clamped { reset_stake: f64 },
}

/// Remaining loss budget for the session: how much more the session may
/// lose before it hits `loss_limit`.
pub fn available_loss_budget(initial_capital: f64, session_balance: f64, loss_limit: f64) -> f64 {
    initial_capital + session_balance - (initial_capital - loss_limit)
}

/// Martingale clamp: if the next recovery stake plus the losses already
/// accumulated would exceed the remaining loss budget, the caller must fall
/// back to base stake and reset the ladder.
pub fn clamp_martingale(
    initial_capital: f64,
    session_balance: f64,
    loss_limit: f64,
    losses_accum: f64,
    ladder: LadderOutput,
    base_stake: f64,
) -> ClampVerdict {
    let available = available_loss_budget(initial_capital, session_balance, loss_limit);
    if losses_accum + ladder.stake > available {
        ClampVerdict::Clamped {
            reset_stake: base_stake,
        }
    } else {
        ClampVerdict::Unclamped
    }
}

/// Whether a loss at `entry` under `profile` should chain into `entry + 1`
/// or accept the loss and reset (conservador's 5-entry cap). A thin
/// re-export so callers only need to import `risk`, not `money_management`,
/// for the post-loss decision.
pub fn should_chain_after_loss(profile: RiskProfile, entry: u32) -> bool {
    !should_reset_after_loss(profile, entry)
}

/// Outcome of the shielded-stop check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShieldedVerdict {
    /// Feature disabled, or the session is not currently in profit.
    NotArmed,
    /// In profit and above the armed floor -- no action.
    Safe,
    /// Accumulated profit has retraced to the armed floor -- stop the
    /// session and protect what remains.
    Breach { protected_profit: f64 },
}

/// Shielded trailing stop: once the session is in profit, locks in
/// `percent` of the peak net profit as a floor on total capital.
///
/// `shielded_percent` is `None` when the session has not enabled the
/// feature. `net` is the session's cumulative P&L (the teacher's
/// `daily_pnl` equivalent, here scoped to the session rather than the day).
pub fn check_shielded_stop(
    initial_capital: f64,
    net: f64,
    shielded_percent: Option<f64>,
) -> ShieldedVerdict {
    let Some(percent) = shielded_percent else {
        return ShieldedVerdict::NotArmed;
    };
    if net <= 0.0 {
        return ShieldedVerdict::NotArmed;
    }
    let armed_floor = initial_capital + net * (percent / 100.0);
    let current_capital = initial_capital + net;
    if current_capital <= armed_floor {
        ShieldedVerdict::Breach {
            protected_profit: armed_floor - initial_capital,
        }
    } else {
        ShieldedVerdict::Safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money_management::LadderKind;

    fn active_view(balance: f64) -> SessionRiskView {
        SessionRiskView {
            is_active: true,
            session_status: SessionStatus::Active,
            session_balance: balance,
            profit_target: 10.0,
            loss_limit: 15.0,
        }
    }

    #[test]
    fn blocks_when_no_active_session() {
        let mut view = active_view(0.0);
        view.is_active = false;
        assert!(matches!(pre_trade_gate(&view), GateVerdict::Block { .. }));
    }

    #[test]
    fn blocks_when_already_terminal() {
        let mut view = active_view(0.0);
        view.session_status = SessionStatus::StoppedLoss;
        assert!(matches!(pre_trade_gate(&view), GateVerdict::Block { .. }));
    }

    #[test]
    fn take_profit_matches_scenario_s4() {
        let view = active_view(10.0);
        match pre_trade_gate(&view) {
            GateVerdict::Block { new_status, .. } => {
                assert_eq!(new_status, Some(SessionStatus::StoppedProfit));
            }
            GateVerdict::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn loss_limit_exact_match_transitions_to_stopped_loss() {
        let view = active_view(-15.0);
        match pre_trade_gate(&view) {
            GateVerdict::Block { new_status, .. } => {
                assert_eq!(new_status, Some(SessionStatus::StoppedLoss));
            }
            GateVerdict::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn allows_when_within_bounds() {
        let view = active_view(5.0);
        assert_eq!(pre_trade_gate(&view), GateVerdict::Allow);
    }

    #[test]
    fn clamp_matches_scenario_s6() {
        let ladder = LadderOutput {
            stake: 7.80,
            kind: LadderKind::Martingale,
        };
        // initialCapital -10 (net already down 10 from a notional 0 base in
        // the scenario's framing), sessionBalance -10, lossLimit 15.
        let verdict = clamp_martingale(-10.0, -10.0, 15.0, 10.0, ladder, 1.00);
        assert_eq!(verdict, ClampVerdict::Clamped { reset_stake: 1.00 });
    }

    #[test]
    fn clamp_allows_stake_within_budget() {
        let ladder = LadderOutput {
            stake: 1.09,
            kind: LadderKind::Martingale,
        };
        let verdict = clamp_martingale(100.0, -1.0, 50.0, 1.00, ladder, 1.00);
        assert_eq!(verdict, ClampVerdict::Unclamped);
    }

    #[test]
    fn shielded_stop_matches_scenario_s5() {
        // initialCapital 100, shieldedPercent 50, net climbs to +20 then
        // falls to +10.
        let verdict = check_shielded_stop(100.0, 10.0, Some(50.0));
        match verdict {
            ShieldedVerdict::Breach { protected_profit } => {
                assert!((protected_profit - 10.0).abs() < 1e-9);
            }
            other => panic!("expected breach, got {other:?}"),
        }
    }

    #[test]
    fn shielded_stop_not_armed_when_disabled() {
        assert_eq!(check_shielded_stop(100.0, 20.0, None), ShieldedVerdict::NotArmed);
    }

    #[test]
    fn shielded_stop_not_armed_when_not_in_profit() {
        assert_eq!(
            check_shielded_stop(100.0, -5.0, Some(50.0)),
            ShieldedVerdict::NotArmed
        );
    }

    #[test]
    fn shielded_stop_safe_while_climbing() {
        // net 20, floor = 100 + 10 = 110, current = 120 > 110 -- safe.
        assert_eq!(
            check_shielded_stop(100.0, 20.0, Some(50.0)),
            ShieldedVerdict::Safe
        );
    }
}
