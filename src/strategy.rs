// =============================================================================
// Strategy Runtime -- per-user, per-tick state machine
// =============================================================================
//
// One call to `process_tick` handles exactly one inbound tick for exactly
// one user, end to end: pacing, the pre-trade gate, the ZENIX analysis
// kernel, the Soros/martingale ladder, contract execution against the
// venue, and the post-outcome bookkeeping. The per-user
// `tokio::sync::Mutex` the caller locks before invoking this function is
// what gives the state machine its single invariant: a user is never
// observed by two concurrent ticks.
//
// Mirrors the teacher's `StrategyEngine::evaluate_symbol` in shape -- a
// numbered-steps pipeline with an early return at every gate -- generalized
// from one ensemble score into the three-mode ZENIX kernel and the
// Soros/martingale ladder this domain needs.
//
// Decision recorded in DESIGN.md's Open Questions: a fresh, signal-triggered
// operation uses `entry = consecutive_wins + 1` rather than a hardcoded `1`
// -- the only reading that reproduces the Soros two-win cycle (entries 1, 2,
// 3 driven by three separate signals). A martingale recovery continuation
// instead uses `martingale_step + 1` and carries the saved direction, never
// a fresh signal.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::analysis::{self, ModeParams};
use crate::app_state::{AppState, UserRuntime};
use crate::money_management::{self, LadderInput, LadderKind, LadderOutput};
use crate::risk;
use crate::runtime_config::RuntimeConfig;
use crate::session::{CachedUserConfig, PacingCursor, StrategyState, UserSession};
use crate::trade_ledger::{AnalysisSnapshot, TradeRecord};
use crate::types::{LogType, Mode, Parity, SessionStatus, Tick, TradeStatus};
use crate::venue::client::ContractParams;
use crate::venue::protocol::ContractSide;

/// Entry point: handle one inbound `tick` for `user_id`.
///
/// No-op if the user is not currently tracked (not an active session, or
/// not yet synced into memory by the Orchestrator).
pub async fn process_tick(app: &Arc<AppState>, user_id: &str, tick: Tick) {
    let runtime = {
        let users = app.users.read();
        match users.get(user_id) {
            Some(u) => u.clone(),
            None => return,
        }
    };
    let mut guard = runtime.lock().await;
    let cfg = app.runtime_config.read().clone();

    // Advance the pacing cursor; a user mid-operation only ever gets its
    // pacing counter ticked, never a new signal.
    advance_pacing(&mut guard.state);
    if guard.state.is_operation_active {
        return;
    }

    // Recovery continuation: a pending loss chains with the saved
    // direction, bypassing analysis entirely.
    if guard.state.losses_accum > 0.0 {
        if let Some(direction) = guard.state.last_martingale_direction {
            if !pacing_allows(&guard.state, guard.session.mode) {
                return;
            }
            match risk::pre_trade_gate(&cached_view(app, &guard.session)) {
                risk::GateVerdict::Allow => {
                    let entry = guard.state.martingale_step + 1;
                    execute_operation(app, user_id, &cfg, &mut guard, entry, direction, None).await;
                }
                risk::GateVerdict::Block { new_status, reason } => {
                    handle_block(app, user_id, &mut guard.session, new_status, reason).await;
                }
            }
            return;
        }
    }

    // Pre-trade gate.
    match risk::pre_trade_gate(&cached_view(app, &guard.session)) {
        risk::GateVerdict::Allow => {}
        risk::GateVerdict::Block { new_status, reason } => {
            handle_block(app, user_id, &mut guard.session, new_status, reason).await;
            return;
        }
    }

    // Mode-specific pacing gate.
    if !pacing_allows(&guard.state, guard.session.mode) {
        return;
    }

    // ZENIX analysis kernel.
    let params = ModeParams::for_mode(guard.session.mode);
    // Fetch at least 20 ticks even for Veloz's 10-tick window, so the
    // kernel's micro-trend bonus (which needs a last-20 half) has ticks
    // to look at instead of silently flooring to 0.
    let fetch = params.window.max(20);
    let window = app.tick_store.last_n(&cfg.primary_symbol, fetch);
    let Some(signal) = analysis::analyze(&window, params) else {
        return;
    };

    app.log_queue.push(crate::logging::LogEntry::new(
        user_id.to_string(),
        guard.session.id.clone(),
        LogType::Analise,
        format!(
            "par={:.3} impar={:.3} conf={:.1} window={} rationale={}",
            signal.detail.par_share, signal.detail.impar_share, signal.confidence,
            signal.detail.window_size, signal.rationale
        ),
        None,
        cfg.log_message_cap,
        cfg.log_details_cap,
    ));
    app.log_queue.push(crate::logging::LogEntry::new(
        user_id.to_string(),
        guard.session.id.clone(),
        LogType::Sinal,
        format!(
            "direction={} confidence={:.1} triggering_digit={} triggering_epoch={}",
            signal.direction, signal.confidence, tick.digit, tick.epoch
        ),
        None,
        cfg.log_message_cap,
        cfg.log_details_cap,
    ));

    let last_digits: Vec<u8> = window.iter().rev().take(10).rev().map(|t| t.digit).collect();
    let snapshot = AnalysisSnapshot::from_detail(
        &signal.detail,
        signal.confidence,
        signal.rationale.clone(),
        last_digits,
    );
    let entry = guard.state.consecutive_wins as u32 + 1;
    let direction = signal.direction;
    execute_operation(app, user_id, &cfg, &mut guard, entry, direction, Some(snapshot)).await;
}

/// Run one operation (and any synchronous martingale continuations it
/// chains into) to completion.
async fn execute_operation(
    app: &Arc<AppState>,
    user_id: &str,
    cfg: &RuntimeConfig,
    guard: &mut UserRuntime,
    mut entry: u32,
    mut direction: Parity,
    mut analysis_snapshot: Option<AnalysisSnapshot>,
) {
    loop {
        guard.state.is_operation_active = true;
        guard.state.martingale_step = entry;
        reset_pacing(&mut guard.state);

        let payout_cliente = query_payout_or_default(app, &guard.session, direction, cfg).await;
        let currency_min_stake = money_management::min_stake_for(&guard.session.currency);

        let ladder_input = LadderInput {
            entry,
            consecutive_wins: guard.state.consecutive_wins,
            losses_accum: guard.state.losses_accum,
            last_profit: guard.state.last_profit,
            previous_stake: guard.state.previous_stake,
            base_stake: guard.state.base_stake,
            profile: guard.session.risk_profile,
            payout_cliente,
            currency_min_stake,
        };
        let mut ladder = money_management::next_stake(ladder_input);

        if guard.state.losses_accum > 0.0 {
            let clamp = risk::clamp_martingale(
                guard.session.initial_capital,
                guard.session.session_balance,
                guard.session.loss_limit,
                guard.state.losses_accum,
                ladder,
                guard.state.base_stake,
            );
            if let risk::ClampVerdict::Clamped { reset_stake } = clamp {
                warn!(user_id, "martingale clamp triggered -- resetting ladder to base stake");
                app.log_queue.push(crate::logging::LogEntry::new(
                    user_id.to_string(),
                    guard.session.id.clone(),
                    LogType::Alerta,
                    "martingale clamp: remaining loss budget exceeded, resetting to base stake".to_string(),
                    None,
                    cfg.log_message_cap,
                    cfg.log_details_cap,
                ));
                guard.state.reset_ladder();
                ladder = LadderOutput {
                    stake: reset_stake,
                    kind: LadderKind::BaseEntry,
                };
                entry = 1;
                guard.state.martingale_step = 1;
            }
        }

        let stake = ladder.stake;
        guard.state.previous_stake = stake;

        let mut trade = TradeRecord::new_pending(
            user_id,
            &guard.session.id,
            &cfg.primary_symbol,
            direction.contract_type(),
            stake,
            &guard.session.strategy,
            analysis_snapshot.take(),
        );
        if let Err(e) = app.store.insert_trade(&trade) {
            warn!(user_id, error = %e, "failed to persist pending trade");
        }

        app.log_queue.push(crate::logging::LogEntry::new(
            user_id.to_string(),
            guard.session.id.clone(),
            LogType::Operacao,
            format!(
                "entry={} stake={:.2} direction={} kind={:?}",
                entry, stake, direction, ladder.kind
            ),
            None,
            cfg.log_message_cap,
            cfg.log_details_cap,
        ));

        let params = ContractParams {
            currency: guard.session.currency.clone(),
            side: to_contract_side(direction),
            stake,
            symbol: cfg.primary_symbol.clone(),
        };

        let outcome = app.venue.execute_contract(&guard.session.deriv_token, &params).await;

        let next = match outcome {
            Ok(settlement) => {
                trade.mark_active(settlement.contract_id.clone(), settlement.entry_price);
                trade.mark_settled(settlement.exit_price, settlement.profit, Some(settlement.payout));
                if let Err(e) = app.store.settle_trade(&trade) {
                    warn!(user_id, error = %e, "failed to persist settled trade");
                }
                app.trade_ledger.record(trade);

                guard.session.session_balance += settlement.profit;
                guard.session.total_trades += 1;
                guard.state.is_operation_active = false;
                guard.state.last_profit = settlement.profit;

                app.log_queue.push(crate::logging::LogEntry::new(
                    user_id.to_string(),
                    guard.session.id.clone(),
                    LogType::Resultado,
                    format!(
                        "{} profit={:.2} balance={:.2}",
                        settlement.status, settlement.profit, guard.session.session_balance
                    ),
                    None,
                    cfg.log_message_cap,
                    cfg.log_details_cap,
                ));

                if settlement.status == TradeStatus::Won {
                    guard.session.total_wins += 1;
                    on_won(app, user_id, guard).await
                } else {
                    guard.session.total_losses += 1;
                    on_lost(&mut guard.state, guard.session.risk_profile, entry, stake, direction)
                }
            }
            Err(e) => {
                trade.mark_error(e.to_string());
                if let Err(persist_err) = app.store.settle_trade(&trade) {
                    warn!(user_id, error = %persist_err, "failed to persist errored trade");
                }
                app.trade_ledger.record(trade);
                guard.state.is_operation_active = false;
                app.log_queue.push(crate::logging::LogEntry::new(
                    user_id.to_string(),
                    guard.session.id.clone(),
                    LogType::Erro,
                    format!("trade error: {e}"),
                    None,
                    cfg.log_message_cap,
                    cfg.log_details_cap,
                ));
                None
            }
        };

        persist_session(app, &guard.session).await;

        match next {
            Some((next_entry, next_direction)) => {
                match risk::pre_trade_gate(&cached_view(app, &guard.session)) {
                    risk::GateVerdict::Allow => {
                        entry = next_entry;
                        direction = next_direction;
                        analysis_snapshot = None;
                        continue;
                    }
                    risk::GateVerdict::Block { new_status, reason } => {
                        handle_block(app, user_id, &mut guard.session, new_status, reason).await;
                        return;
                    }
                }
            }
            None => return,
        }
    }
}

/// Post-outcome handling on a win: advances (or completes) the Soros
/// progression and runs the shielded-stop check. Never chains.
async fn on_won(app: &Arc<AppState>, user_id: &str, guard: &mut UserRuntime) -> Option<(u32, Parity)> {
    let entry = guard.state.martingale_step;
    guard.state.martingale_step = 0;
    guard.state.last_martingale_direction = None;

    if guard.state.losses_accum == 0.0 {
        match entry {
            1 => guard.state.consecutive_wins = 1,
            2 => guard.state.consecutive_wins = 2,
            _ => guard.state.reset_ladder(), // entry 3 completes the Soros cycle
        }
    } else {
        // A win while recovering from a loss clears the martingale ladder.
        guard.state.reset_ladder();
    }

    match risk::check_shielded_stop(
        guard.session.initial_capital,
        guard.session.session_balance,
        guard.session.stop_blindado_percent,
    ) {
        risk::ShieldedVerdict::Breach { protected_profit } => {
            handle_block(
                app,
                user_id,
                &mut guard.session,
                Some(SessionStatus::StoppedBlindado),
                format!("shielded stop: protected profit {protected_profit:.2}"),
            )
            .await;
        }
        risk::ShieldedVerdict::Safe | risk::ShieldedVerdict::NotArmed => {}
    }

    None
}

/// Post-outcome handling on a loss: accumulates the loss, saves the
/// recovery direction, and decides whether to chain into `entry + 1`
/// (Conservador caps at 5 entries; Moderado/Agressivo always continue).
fn on_lost(
    state: &mut StrategyState,
    profile: crate::types::RiskProfile,
    entry: u32,
    stake: f64,
    direction: Parity,
) -> Option<(u32, Parity)> {
    state.losses_accum += stake;
    state.last_martingale_direction = Some(direction);
    state.consecutive_wins = 0;
    state.last_profit = 0.0;

    if risk::should_chain_after_loss(profile, entry) {
        Some((entry + 1, direction))
    } else {
        state.reset_ladder();
        None
    }
}

async fn handle_block(
    app: &Arc<AppState>,
    user_id: &str,
    session: &mut UserSession,
    new_status: Option<SessionStatus>,
    reason: String,
) {
    if let Some(status) = new_status {
        let now = Utc::now().to_rfc3339();
        session.deactivate(status, reason.clone(), &now);
        if let Err(e) = app.store.upsert_session(session) {
            warn!(user_id, error = %e, "failed to persist session deactivation");
        }
        app.config_cache.invalidate(user_id);
        app.log_queue.push(crate::logging::LogEntry::new(
            user_id.to_string(),
            session.id.clone(),
            LogType::Alerta,
            reason,
            None,
            5000,
            10000,
        ));
        app.untrack_user(user_id);
        info!(user_id, %status, "session deactivated by risk gate");
    }
}

async fn persist_session(app: &Arc<AppState>, session: &UserSession) {
    if let Err(e) = app.store.upsert_session(session) {
        warn!(user_id = %session.user_id, error = %e, "failed to persist session");
    }
    app.config_cache.invalidate(&session.user_id);
}

/// Read through the 1-second TTL config cache, refreshing it from the
/// caller's (authoritative, lock-held) `UserSession` on a miss.
fn cached_view(app: &Arc<AppState>, session: &UserSession) -> risk::SessionRiskView {
    let cached = app.config_cache.get_fresh(&session.user_id).unwrap_or_else(|| {
        let entry = CachedUserConfig {
            session_balance: session.session_balance,
            profit_target: session.profit_target,
            loss_limit: session.loss_limit,
            session_status: session.session_status,
            is_active: session.is_active,
            last_update: std::time::Instant::now(),
        };
        app.config_cache.put(session.user_id.clone(), entry.clone());
        entry
    });
    risk::SessionRiskView {
        is_active: cached.is_active,
        session_status: cached.session_status,
        session_balance: cached.session_balance,
        profit_target: cached.profit_target,
        loss_limit: cached.loss_limit,
    }
}

async fn query_payout_or_default(
    app: &Arc<AppState>,
    session: &UserSession,
    direction: Parity,
    cfg: &RuntimeConfig,
) -> f64 {
    match app
        .venue
        .query_payout(&session.deriv_token, &cfg.primary_symbol, &session.currency, to_contract_side(direction))
        .await
    {
        Ok(payout) => payout,
        Err(e) => {
            warn!(user_id = %session.user_id, error = %e, "payout query failed, falling back to default");
            cfg.default_payout_cliente
        }
    }
}

fn to_contract_side(parity: Parity) -> ContractSide {
    match parity {
        Parity::Par => ContractSide::Even,
        Parity::Impar => ContractSide::Odd,
    }
}

fn advance_pacing(state: &mut StrategyState) {
    if let PacingCursor::TicksSinceLastOp(n) = &mut state.pacing_cursor {
        *n += 1;
    }
}

fn reset_pacing(state: &mut StrategyState) {
    match &mut state.pacing_cursor {
        PacingCursor::TicksSinceLastOp(n) => *n = 0,
        PacingCursor::LastOperationAt(last) => *last = Some(Utc::now().timestamp()),
        PacingCursor::Unused => {}
    }
}

/// Mode-specific pacing gate: Veloz needs 3 ticks since the last operation,
/// Moderado needs 17 wall-clock seconds, Preciso has no fixed interval.
fn pacing_allows(state: &StrategyState, mode: Mode) -> bool {
    match (&state.pacing_cursor, mode) {
        (PacingCursor::TicksSinceLastOp(n), Mode::Veloz) => *n >= 3,
        (PacingCursor::LastOperationAt(last), Mode::Moderado) => match last {
            Some(ts) => Utc::now().timestamp() - ts >= 17,
            None => true,
        },
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskProfile;

    #[test]
    fn veloz_pacing_requires_three_ticks() {
        let mut state = StrategyState::new(1.0, Mode::Veloz);
        assert!(!pacing_allows(&state, Mode::Veloz));
        advance_pacing(&mut state);
        advance_pacing(&mut state);
        assert!(!pacing_allows(&state, Mode::Veloz));
        advance_pacing(&mut state);
        assert!(pacing_allows(&state, Mode::Veloz));
    }

    #[test]
    fn moderado_pacing_matches_scenario_s3() {
        // t0 + 10s must not fire; t0 + 18s must fire (17s gate).
        assert!(1_700_000_010 - 1_700_000_000 < 17);
        assert!(1_700_000_018 - 1_700_000_000 >= 17);
    }

    #[test]
    fn preciso_has_no_pacing_gate() {
        let state = StrategyState::new(1.0, Mode::Preciso);
        assert!(pacing_allows(&state, Mode::Preciso));
    }

    #[test]
    fn contract_side_mapping_matches_parity() {
        assert_eq!(to_contract_side(Parity::Par), ContractSide::Even);
        assert_eq!(to_contract_side(Parity::Impar), ContractSide::Odd);
    }

    #[test]
    fn on_lost_conservador_resets_after_fifth_entry() {
        let mut state = StrategyState::new(1.0, Mode::Veloz);
        state.losses_accum = 9.10;
        let chain = on_lost(&mut state, RiskProfile::Conservador, 5, 9.89, Parity::Par);
        assert!(chain.is_none());
        assert_eq!(state.losses_accum, 0.0);
    }

    #[test]
    fn on_lost_moderado_always_chains() {
        let mut state = StrategyState::new(1.0, Mode::Veloz);
        let chain = on_lost(&mut state, RiskProfile::Moderado, 42, 9.89, Parity::Impar);
        assert_eq!(chain, Some((43, Parity::Impar)));
        assert!(state.losses_accum > 0.0);
    }
}
