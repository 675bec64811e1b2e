// =============================================================================
// Shared types used across the Zenix trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// One observed price sample from the venue, with its derived last digit
/// and parity already attached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub value: f64,
    pub epoch: i64,
    pub digit: u8,
    pub parity: Parity,
}

impl Tick {
    /// Build a tick from a raw venue quote, deriving `digit` and `parity`.
    ///
    /// `digit` is the last decimal digit of `value` with the decimal point
    /// removed, taken from the absolute value. Returns `None` if `value` or
    /// `epoch` is not finite/positive -- the gateway must never deliver a
    /// tick that fails this.
    pub fn new(value: f64, epoch: i64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 || !epoch.is_finite_epoch() {
            return None;
        }
        let digit = last_decimal_digit(value);
        Some(Self {
            value,
            epoch,
            digit,
            parity: Parity::of(digit),
        })
    }
}

/// `i64` has no "finiteness" of its own; this trait just keeps the check at
/// the `Tick::new` call site readable.
trait FiniteEpoch {
    fn is_finite_epoch(&self) -> bool;
}

impl FiniteEpoch for i64 {
    fn is_finite_epoch(&self) -> bool {
        *self > 0
    }
}

/// Volatility-index quotes arrive from the venue with a fixed number of
/// decimal places (the symbol's pip size); the digit contract is defined
/// over that formatted representation, not over the raw `f64` bit pattern.
const QUOTE_DECIMALS: usize = 4;

/// Strip the decimal point from the absolute value's textual representation
/// and take the last digit.
fn last_decimal_digit(value: f64) -> u8 {
    let text = format!("{:.*}", QUOTE_DECIMALS, value.abs());
    let last_char = text
        .bytes()
        .filter(|b| b.is_ascii_digit())
        .last()
        .unwrap_or(b'0');
    last_char - b'0'
}

/// PAR (even) or IMPAR (odd) last digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Par,
    Impar,
}

impl Parity {
    pub fn of(digit: u8) -> Self {
        if digit % 2 == 0 {
            Self::Par
        } else {
            Self::Impar
        }
    }

    /// The venue `contract_type` string for this parity.
    pub fn contract_type(self) -> &'static str {
        match self {
            Self::Par => "DIGITEVEN",
            Self::Impar => "DIGITODD",
        }
    }
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Par => write!(f, "PAR"),
            Self::Impar => write!(f, "IMPAR"),
        }
    }
}

/// Strategy sampling/pacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Veloz,
    Moderado,
    Preciso,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Veloz => write!(f, "veloz"),
            Self::Moderado => write!(f, "moderado"),
            Self::Preciso => write!(f, "preciso"),
        }
    }
}

/// Recovery-martingale risk profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskProfile {
    Conservador,
    Moderado,
    Agressivo,
}

impl std::fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservador => write!(f, "conservador"),
            Self::Moderado => write!(f, "moderado"),
            Self::Agressivo => write!(f, "agressivo"),
        }
    }
}

/// Terminal and active states of a `UserSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    StoppedProfit,
    StoppedLoss,
    StoppedBlindado,
    StoppedServerRestart,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::StoppedProfit => write!(f, "stopped_profit"),
            Self::StoppedLoss => write!(f, "stopped_loss"),
            Self::StoppedBlindado => write!(f, "stopped_blindado"),
            Self::StoppedServerRestart => write!(f, "stopped_server_restart"),
        }
    }
}

/// Lifecycle status of a single `TradeRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Active,
    Won,
    Lost,
    Error,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Won => write!(f, "WON"),
            Self::Lost => write!(f, "LOST"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Severity/category of an appended `LogEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    Info,
    Tick,
    Analise,
    Sinal,
    Operacao,
    Resultado,
    Alerta,
    Erro,
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Tick => write!(f, "tick"),
            Self::Analise => write!(f, "analise"),
            Self::Sinal => write!(f, "sinal"),
            Self::Operacao => write!(f, "operacao"),
            Self::Resultado => write!(f, "resultado"),
            Self::Alerta => write!(f, "alerta"),
            Self::Erro => write!(f, "erro"),
        }
    }
}

/// Round a money amount to 2 decimal places (fiat). Crypto minimum-stake
/// rounding is handled separately by `money_management::min_stake_for`.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_and_parity_roundtrip() {
        let t = Tick::new(1234.5678, 1_700_000_000).unwrap();
        assert_eq!(t.digit, 8);
        assert_eq!(t.parity, Parity::Par);
    }

    #[test]
    fn odd_last_digit_is_impar() {
        let t = Tick::new(1234.5671, 1_700_000_000).unwrap();
        assert_eq!(t.digit, 1);
        assert_eq!(t.parity, Parity::Impar);
    }

    #[test]
    fn rejects_non_finite_value() {
        assert!(Tick::new(f64::NAN, 1_700_000_000).is_none());
        assert!(Tick::new(-1.0, 1_700_000_000).is_none());
    }

    #[test]
    fn rejects_non_positive_epoch() {
        assert!(Tick::new(100.0, 0).is_none());
    }

    #[test]
    fn round2_rounds_half_up() {
        assert!((round2(1.005) - 1.0).abs() < 0.011);
        assert_eq!(round2(1.9999), 2.0);
    }
}
