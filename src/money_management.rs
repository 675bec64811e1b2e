// =============================================================================
// Soros + Martingale money-management ladder
// =============================================================================
//
// A pure function of the caller's current state and the quoted client
// payout -- it reads no clock, touches no I/O, and owns no state of its own.
// `strategy::runtime` is the only caller and is responsible for persisting
// whatever this module returns.

use crate::types::{round2, RiskProfile};

/// Fallback client payout used when a live payout query fails.
pub const DEFAULT_PAYOUT_CLIENTE: f64 = 92.0;

/// `payoutCliente = payoutOriginal - payoutMarkup`, always. `payout_markup`
/// is sourced from `RuntimeConfig::payout_markup` (spec.md §6's
/// `payoutMarkup` configuration parameter) rather than hardcoded, so it is
/// actually tunable.
pub fn payout_cliente(payout_original: f64, payout_markup: f64) -> f64 {
    payout_original - payout_markup
}

/// Conservative profiles cap recovery at this many consecutive losing
/// entries before accepting the loss and resetting to base stake.
pub const CONSERVADOR_MAX_ENTRIES: u32 = 5;

impl RiskProfile {
    /// Martingale `meta` multiplier applied to the accumulated losses.
    pub fn meta_multiplier(self) -> f64 {
        match self {
            RiskProfile::Conservador => 1.0,
            RiskProfile::Moderado => 1.25,
            RiskProfile::Agressivo => 1.50,
        }
    }

    /// `meta(profile, lossesAccum)`.
    pub fn meta(self, losses_accum: f64) -> f64 {
        losses_accum * self.meta_multiplier()
    }

    /// Whether the profile caps the number of recovery entries
    /// (conservador only, at `CONSERVADOR_MAX_ENTRIES`).
    pub fn max_entries(self) -> Option<u32> {
        match self {
            RiskProfile::Conservador => Some(CONSERVADOR_MAX_ENTRIES),
            RiskProfile::Moderado | RiskProfile::Agressivo => None,
        }
    }
}

/// Per-currency minimum stake. Fiat currencies round to 2 decimals; this
/// table covers the crypto minimums the venue enforces.
pub fn min_stake_for(currency: &str) -> f64 {
    match currency.to_uppercase().as_str() {
        "BTC" | "ETH" | "LTC" => 0.00000001,
        "USDC" | "UST" | "EUSDT" => 1.0,
        _ => 0.35, // fiat floor mirroring the venue's generic minimum stake
    }
}

/// Inputs the ladder needs to compute the next stake. Mirrors §9's explicit
/// configuration-object recommendation: a closed struct, no dynamic bags.
#[derive(Debug, Clone, Copy)]
pub struct LadderInput {
    pub entry: u32,
    pub consecutive_wins: u8,
    pub losses_accum: f64,
    pub last_profit: f64,
    /// Stake actually paid on the immediately preceding entry -- the `s_i`
    /// in the Soros law `s_{i+1} = round2(s_i + pi_i)`. At entry 1 this is
    /// irrelevant; the ladder always returns `base_stake`.
    pub previous_stake: f64,
    pub base_stake: f64,
    pub profile: RiskProfile,
    pub payout_cliente: f64,
    pub currency_min_stake: f64,
}

/// Outcome of a stake computation -- either a Soros compound or a martingale
/// recovery step, carried separately so the caller can log which ladder
/// produced the stake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LadderKind {
    BaseEntry,
    Soros,
    Martingale,
}

#[derive(Debug, Clone, Copy)]
pub struct LadderOutput {
    pub stake: f64,
    pub kind: LadderKind,
}

/// Compute the next stake.
///
/// When `losses_accum == 0` (not recovering) this runs the Soros
/// progression; at `entry == 1` it is always the base stake regardless of
/// `consecutive_wins` (idempotence law). When `losses_accum > 0` this runs
/// the recovery martingale.
pub fn next_stake(input: LadderInput) -> LadderOutput {
    if input.losses_accum > 0.0 {
        return martingale_stake(input);
    }

    if input.entry == 1 {
        return LadderOutput {
            stake: input.base_stake,
            kind: LadderKind::BaseEntry,
        };
    }

    // Soros: at entry 2 (after consecutive_wins==1) or entry 3 (after
    // consecutive_wins==2), compound the previous stake with the previous
    // profit. Any other combination (e.g. entry 2 without a prior win) is
    // not a recognized Soros state and falls back to base stake.
    let recognized = (input.entry == 2 && input.consecutive_wins == 1)
        || (input.entry == 3 && input.consecutive_wins == 2);
    if recognized {
        LadderOutput {
            stake: round2(input.previous_stake + input.last_profit),
            kind: LadderKind::Soros,
        }
    } else {
        LadderOutput {
            stake: input.base_stake,
            kind: LadderKind::BaseEntry,
        }
    }
}

fn martingale_stake(input: LadderInput) -> LadderOutput {
    if input.payout_cliente <= 0.0 {
        return LadderOutput {
            stake: input.currency_min_stake.max(input.base_stake),
            kind: LadderKind::Martingale,
        };
    }
    let meta = input.profile.meta(input.losses_accum);
    let raw = round2(meta * 100.0 / input.payout_cliente);
    let stake = raw.max(input.currency_min_stake);
    LadderOutput {
        stake,
        kind: LadderKind::Martingale,
    }
}

/// Whether a loss at `entry` under `profile` must reset the ladder instead
/// of chaining into `entry + 1` (conservador's 5-entry cap).
pub fn should_reset_after_loss(profile: RiskProfile, entry: u32) -> bool {
    match profile.max_entries() {
        Some(max) => entry + 1 > max,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> LadderInput {
        LadderInput {
            entry: 1,
            consecutive_wins: 0,
            losses_accum: 0.0,
            last_profit: 0.0,
            previous_stake: 1.00,
            base_stake: 1.00,
            profile: RiskProfile::Conservador,
            payout_cliente: 92.0,
            currency_min_stake: 0.35,
        }
    }

    #[test]
    fn client_payout_rule() {
        assert_eq!(payout_cliente(95.0, 3.0), 92.0);
    }

    #[test]
    fn martingale_idempotent_on_zero_losses() {
        let input = base_input();
        let out = next_stake(input);
        assert_eq!(out.stake, input.base_stake);
        assert_eq!(out.kind, LadderKind::BaseEntry);
    }

    #[test]
    fn soros_two_win_cycle_matches_scenario_s1() {
        // Entry 1 wins +0.92.
        let mut input = base_input();
        input.entry = 1;
        let e1 = next_stake(input);
        assert_eq!(e1.stake, 1.00);
        let profit1 = round2(e1.stake * 92.0 / 100.0);
        assert_eq!(profit1, 0.92);

        // Entry 2: consecutive_wins now 1, last_profit 0.92, previous
        // stake was the entry-1 stake (1.00).
        input.entry = 2;
        input.consecutive_wins = 1;
        input.last_profit = profit1;
        input.previous_stake = e1.stake;
        let e2 = next_stake(input);
        assert_eq!(e2.stake, 1.92);
        assert_eq!(e2.kind, LadderKind::Soros);
        let profit2 = round2(e2.stake * 92.0 / 100.0);
        assert_eq!(profit2, 1.77); // round2(1.7664)

        // Entry 3: consecutive_wins now 2, last_profit 1.77, previous
        // stake was the entry-2 stake (1.92).
        input.entry = 3;
        input.consecutive_wins = 2;
        input.last_profit = profit2;
        input.previous_stake = e2.stake;
        let e3 = next_stake(input);
        assert_eq!(e3.stake, 3.69);
        assert_eq!(e3.kind, LadderKind::Soros);
    }

    #[test]
    fn soros_entry_two_without_prior_win_falls_back_to_base() {
        let mut input = base_input();
        input.entry = 2;
        input.consecutive_wins = 0;
        let out = next_stake(input);
        assert_eq!(out.stake, input.base_stake);
        assert_eq!(out.kind, LadderKind::BaseEntry);
    }

    #[test]
    fn martingale_loss_chain_matches_scenario_s2() {
        let mut input = base_input();
        input.losses_accum = 1.00;
        let e2 = next_stake(input);
        assert_eq!(e2.stake, 1.09); // round2(100/92)

        input.losses_accum = 2.09;
        let e3 = next_stake(input);
        assert_eq!(e3.stake, 2.27); // round2(209/92)

        input.losses_accum = 4.36;
        let e4 = next_stake(input);
        assert_eq!(e4.stake, 4.74); // round2(436/92)

        input.losses_accum = 9.10;
        let e5 = next_stake(input);
        assert_eq!(e5.stake, 9.89); // round2(910/92)
    }

    #[test]
    fn conservador_resets_after_five_entries() {
        assert!(!should_reset_after_loss(RiskProfile::Conservador, 4));
        assert!(should_reset_after_loss(RiskProfile::Conservador, 5));
    }

    #[test]
    fn moderado_and_agressivo_never_cap() {
        assert!(!should_reset_after_loss(RiskProfile::Moderado, 100));
        assert!(!should_reset_after_loss(RiskProfile::Agressivo, 100));
    }

    #[test]
    fn martingale_meta_formulas() {
        assert_eq!(RiskProfile::Conservador.meta(10.0), 10.0);
        assert_eq!(RiskProfile::Moderado.meta(10.0), 12.5);
        assert_eq!(RiskProfile::Agressivo.meta(10.0), 15.0);
    }

    #[test]
    fn stake_never_below_currency_minimum() {
        let mut input = base_input();
        input.losses_accum = 0.01;
        input.currency_min_stake = 5.0;
        let out = next_stake(input);
        assert!(out.stake >= 5.0);
    }
}
