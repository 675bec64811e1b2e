// =============================================================================
// ZENIX Analysis Kernel — pure statistical signal generation over a tick slice
// =============================================================================
//
// The kernel never reads state and performs no I/O: every function here takes
// a slice of already-collected ticks and returns a value derived solely from
// that slice. Callers (`strategy::runtime`) own the tick window and the mode
// parameters; the kernel only scores what it is given.
//
// Base analysis — imbalance over the configured window: the majority parity
// share decides whether a signal is even considered; the minority parity is
// the mean-reversion direction actually traded.
//
// Three complementary analyses each contribute a fixed confidence bonus:
// streak (run length of the trailing parity), micro-trend (imbalance drift
// between the last 10 and last 20 ticks), and velocity (imbalance drift
// between the full slice and the slice with its last tick dropped).

use crate::types::{Mode, Parity, Tick};

/// Fixed parameters for one strategy mode, carried into every kernel call.
#[derive(Debug, Clone, Copy)]
pub struct ModeParams {
    pub mode: Mode,
    pub window: usize,
    pub imbalance_min: f64,
    pub confidence_min: f64,
}

impl ModeParams {
    pub const VELOZ: Self = Self {
        mode: Mode::Veloz,
        window: 10,
        imbalance_min: 0.50,
        confidence_min: 0.50,
    };
    pub const MODERADO: Self = Self {
        mode: Mode::Moderado,
        window: 20,
        imbalance_min: 0.60,
        confidence_min: 0.60,
    };
    pub const PRECISO: Self = Self {
        mode: Mode::Preciso,
        window: 50,
        imbalance_min: 0.70,
        confidence_min: 0.70,
    };

    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Veloz => Self::VELOZ,
            Mode::Moderado => Self::MODERADO,
            Mode::Preciso => Self::PRECISO,
        }
    }
}

/// Result of a successful ZENIX analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub direction: Parity,
    pub confidence: f64,
    pub rationale: String,
    pub detail: SignalDetail,
}

/// Numeric breakdown behind a signal, kept for the audit log and for
/// `analysis_data` persistence (summary form, per the design note on
/// `analysis_data` retention).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDetail {
    pub window_size: usize,
    pub par_share: f64,
    pub impar_share: f64,
    pub confidence_base: f64,
    pub streak_bonus: f64,
    pub micro_trend_bonus: f64,
    pub velocity_bonus: f64,
}

/// Share of PAR ticks in `ticks` (last element counted like every other).
/// Returns `0.0` for an empty slice.
pub fn imbalance(ticks: &[Tick]) -> f64 {
    if ticks.is_empty() {
        return 0.0;
    }
    let par = ticks.iter().filter(|t| t.parity == Parity::Par).count();
    par as f64 / ticks.len() as f64
}

/// Length of the run of the trailing parity, counted backwards from the end
/// of the slice.
pub fn streak(ticks: &[Tick]) -> usize {
    let Some(last) = ticks.last() else {
        return 0;
    };
    ticks
        .iter()
        .rev()
        .take_while(|t| t.parity == last.parity)
        .count()
}

/// `|imbalance(last 10) - imbalance(last 20)|`. Zero if fewer than 10 ticks
/// are available.
pub fn micro_trend(ticks: &[Tick]) -> f64 {
    if ticks.len() < 10 {
        return 0.0;
    }
    let last10 = &ticks[ticks.len() - 10..];
    let last20_start = ticks.len().saturating_sub(20);
    let last20 = &ticks[last20_start..];
    (imbalance(last10) - imbalance(last20)).abs()
}

/// `|imbalance(slice) - imbalance(slice without its last tick)|`. Zero if
/// the slice has fewer than 2 ticks.
pub fn velocity(ticks: &[Tick]) -> f64 {
    if ticks.len() < 2 {
        return 0.0;
    }
    (imbalance(ticks) - imbalance(&ticks[..ticks.len() - 1])).abs()
}

const STREAK_MIN_LEN: usize = 5;
const STREAK_BONUS: f64 = 12.0;
const MICRO_TREND_THRESHOLD: f64 = 0.10;
const MICRO_TREND_BONUS: f64 = 8.0;
const VELOCITY_THRESHOLD: f64 = 0.05;
const VELOCITY_BONUS: f64 = 10.0;
const MAX_CONFIDENCE: f64 = 95.0;

/// Run the full ZENIX kernel over `ticks` using `params`.
///
/// Returns `None` when there are fewer than `params.window` ticks, when the
/// imbalance is exactly split or below `imbalance_min`, or when the final
/// confidence is below `confidence_min * 100`.
pub fn analyze(ticks: &[Tick], params: ModeParams) -> Option<Signal> {
    if ticks.len() < params.window {
        return None;
    }
    let window = &ticks[ticks.len() - params.window..];

    let p = imbalance(window);
    let q = 1.0 - p;
    let majority = p.max(q);
    if majority < params.imbalance_min {
        return None;
    }
    if (p - q).abs() < f64::EPSILON {
        return None; // exact split — no mean-reversion direction
    }

    let direction = if p > q { Parity::Impar } else { Parity::Par };
    let confidence_base = majority * 100.0;

    // Streak/micro-trend/velocity look further back than the base window
    // (micro-trend in particular needs 20 ticks of history) so they read
    // the untruncated `ticks` slice, not the window-limited one -- a
    // Veloz window of 10 would otherwise starve micro_trend of its
    // last-20 half forever.
    let streak_len = streak(ticks);
    let streak_bonus = if streak_len >= STREAK_MIN_LEN {
        STREAK_BONUS
    } else {
        0.0
    };

    let micro = micro_trend(ticks);
    let micro_trend_bonus = if micro > MICRO_TREND_THRESHOLD {
        MICRO_TREND_BONUS
    } else {
        0.0
    };

    let vel = velocity(ticks);
    let velocity_bonus = if vel > VELOCITY_THRESHOLD {
        VELOCITY_BONUS
    } else {
        0.0
    };

    let confidence =
        (confidence_base + streak_bonus + micro_trend_bonus + velocity_bonus).min(MAX_CONFIDENCE);
    if confidence < params.confidence_min * 100.0 {
        return None;
    }

    let rationale = rationale_string(streak_bonus, micro_trend_bonus, velocity_bonus);

    Some(Signal {
        direction,
        confidence,
        rationale,
        detail: SignalDetail {
            window_size: params.window,
            par_share: p,
            impar_share: q,
            confidence_base,
            streak_bonus,
            micro_trend_bonus,
            velocity_bonus,
        },
    })
}

fn rationale_string(streak_bonus: f64, micro_trend_bonus: f64, velocity_bonus: f64) -> String {
    let mut fired = Vec::new();
    if streak_bonus > 0.0 {
        fired.push("streak");
    }
    if micro_trend_bonus > 0.0 {
        fired.push("micro_trend");
    }
    if velocity_bonus > 0.0 {
        fired.push("velocity");
    }
    if fired.is_empty() {
        "base imbalance only".to_string()
    } else {
        format!("base imbalance + {}", fired.join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_seq(parities: &[Parity]) -> Vec<Tick> {
        parities
            .iter()
            .enumerate()
            .map(|(i, &parity)| Tick {
                value: 100.0 + i as f64,
                epoch: 1_700_000_000 + i as i64,
                digit: if parity == Parity::Par { 0 } else { 1 },
                parity,
            })
            .collect()
    }

    #[test]
    fn insufficient_window_returns_none() {
        let ticks = tick_seq(&[Parity::Par; 5].to_vec());
        assert!(analyze(&ticks, ModeParams::VELOZ).is_none());
    }

    #[test]
    fn exact_split_returns_none() {
        // Veloz window of 10, 5 PAR / 5 IMPAR => p == q == 0.5.
        let mut seq = vec![Parity::Par; 5];
        seq.extend(vec![Parity::Impar; 5]);
        let ticks = tick_seq(&seq);
        assert!(analyze(&ticks, ModeParams::VELOZ).is_none());
    }

    #[test]
    fn imbalance_exactly_at_threshold_yields_no_signal() {
        // 12 PAR / 8 IMPAR over a window of 20 => majority share exactly
        // 0.60, Moderado's imbalance_min -- boundary must NOT fire.
        let mut window = vec![Parity::Par; 12];
        window.extend(vec![Parity::Impar; 8]);
        let ticks = tick_seq(&window);
        assert_eq!(ticks.len(), 20);
        assert!(analyze(&ticks, ModeParams::MODERADO).is_none());
    }

    #[test]
    fn strong_imbalance_with_streak_fires() {
        // 9 PAR then a long tail to build both imbalance and streak.
        let mut seq = vec![Parity::Impar];
        seq.extend(vec![Parity::Par; 9]);
        let ticks = tick_seq(&seq);
        let signal = analyze(&ticks, ModeParams::VELOZ).expect("expected a signal");
        assert_eq!(signal.direction, Parity::Impar);
        assert!(signal.detail.streak_bonus > 0.0);
    }

    #[test]
    fn streak_requires_minimum_run_length() {
        let ticks = tick_seq(&[Parity::Par, Parity::Par, Parity::Par, Parity::Impar]);
        assert_eq!(streak(&ticks), 1);
    }

    #[test]
    fn micro_trend_needs_at_least_ten_ticks() {
        let ticks = tick_seq(&vec![Parity::Par; 5]);
        assert_eq!(micro_trend(&ticks), 0.0);
    }

    #[test]
    fn velocity_needs_at_least_two_ticks() {
        let ticks = tick_seq(&[Parity::Par]);
        assert_eq!(velocity(&ticks), 0.0);
    }

    #[test]
    fn confidence_never_exceeds_cap() {
        let mut seq = vec![Parity::Impar; 2];
        seq.extend(vec![Parity::Par; 48]);
        let ticks = tick_seq(&seq);
        let signal = analyze(&ticks, ModeParams::PRECISO).expect("expected a signal");
        assert!(signal.confidence <= MAX_CONFIDENCE);
    }
}
