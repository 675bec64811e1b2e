// =============================================================================
// Trade Ledger -- PENDING -> ACTIVE -> {WON | LOST} | PENDING -> ERROR
// =============================================================================
//
// A single-tick digit-parity contract never needs intra-trade exit
// management (no stop-loss/take-profit ladder to watch): once bought, it
// settles on the next tick. The ledger's job is simpler than the teacher's
// `PositionManager` as a result -- it tracks one state transition per trade
// rather than a partial-close lifecycle -- but keeps the same shape:
// in-memory lists behind `RwLock`, UUID identifiers, and a `Debug` impl that
// doesn't dump every row.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::analysis::SignalDetail;
use crate::types::TradeStatus;

/// Summary of the analysis that produced this trade, kept for audit rather
/// than the full tick window (per the design note on `analysis_data`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub window_size: usize,
    pub par_share: f64,
    pub impar_share: f64,
    pub confidence: f64,
    pub rationale: String,
    /// Last-N digit digest, most-recent-last.
    pub last_digits: Vec<u8>,
}

impl AnalysisSnapshot {
    pub fn from_detail(detail: &SignalDetail, confidence: f64, rationale: String, last_digits: Vec<u8>) -> Self {
        Self {
            window_size: detail.window_size,
            par_share: detail.par_share,
            impar_share: detail.impar_share,
            confidence,
            rationale,
            last_digits,
        }
    }
}

/// One row of `ai_trades`: a single attempt at executing a digit-parity
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub symbol: String,
    pub contract_type: String,
    pub stake: f64,
    pub strategy: String,
    pub analysis_data: Option<AnalysisSnapshot>,
    pub contract_id: Option<String>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub profit: Option<f64>,
    pub payout: Option<f64>,
    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub started_at: String,
    pub closed_at: Option<String>,
}

impl TradeRecord {
    pub fn new_pending(
        user_id: &str,
        session_id: &str,
        symbol: &str,
        contract_type: &str,
        stake: f64,
        strategy: &str,
        analysis_data: Option<AnalysisSnapshot>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            symbol: symbol.to_string(),
            contract_type: contract_type.to_string(),
            stake,
            strategy: strategy.to_string(),
            analysis_data,
            contract_id: None,
            entry_price: None,
            exit_price: None,
            profit: None,
            payout: None,
            status: TradeStatus::Pending,
            error_message: None,
            started_at: Utc::now().to_rfc3339(),
            closed_at: None,
        }
    }

    pub fn mark_active(&mut self, contract_id: String, entry_price: f64) {
        self.status = TradeStatus::Active;
        self.contract_id = Some(contract_id);
        self.entry_price = Some(entry_price);
    }

    pub fn mark_settled(&mut self, exit_price: f64, profit: f64, payout: Option<f64>) {
        self.status = if profit >= 0.0 {
            TradeStatus::Won
        } else {
            TradeStatus::Lost
        };
        self.exit_price = Some(exit_price);
        self.profit = Some(profit);
        self.payout = payout;
        self.closed_at = Some(Utc::now().to_rfc3339());
    }

    pub fn mark_error(&mut self, message: String) {
        self.status = TradeStatus::Error;
        self.error_message = Some(message);
        self.closed_at = Some(Utc::now().to_rfc3339());
        self.profit = None;
    }
}

/// In-memory ledger of recent trades, backed by persistence for anything
/// older than what a caller needs for live bookkeeping. History queries
/// ignore ERROR rows per the data model's invariant.
pub struct TradeLedger {
    recent: RwLock<Vec<TradeRecord>>,
    cap: usize,
}

impl TradeLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            recent: RwLock::new(Vec::new()),
            cap,
        }
    }

    pub fn record(&self, trade: TradeRecord) {
        info!(
            trade_id = %trade.id,
            user_id = %trade.user_id,
            status = %trade.status,
            "trade recorded"
        );
        let mut recent = self.recent.write();
        recent.push(trade);
        let len = recent.len();
        if len > self.cap {
            recent.drain(0..len - self.cap);
        }
    }

    /// Most recent trades for a user, excluding ERROR rows, newest first.
    pub fn history_for(&self, user_id: &str, count: usize) -> Vec<TradeRecord> {
        self.recent
            .read()
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id && t.status != TradeStatus::Error)
            .take(count)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLedger")
            .field("recent_count", &self.recent.read().len())
            .field("cap", &self.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_won_transition_sets_all_fields() {
        let mut trade = TradeRecord::new_pending("u1", "s1", "R_100", "DIGITEVEN", 1.0, "orion", None);
        assert_eq!(trade.status, TradeStatus::Pending);
        trade.mark_active("C1".to_string(), 123.45);
        assert_eq!(trade.status, TradeStatus::Active);
        trade.mark_settled(124.0, 0.92, Some(92.0));
        assert_eq!(trade.status, TradeStatus::Won);
        assert!(trade.exit_price.is_some());
        assert!(trade.profit.is_some());
        assert!(trade.closed_at.is_some());
    }

    #[test]
    fn error_path_leaves_profit_null() {
        let mut trade = TradeRecord::new_pending("u1", "s1", "R_100", "DIGITODD", 1.0, "orion", None);
        trade.mark_error("authorize failed".to_string());
        assert_eq!(trade.status, TradeStatus::Error);
        assert!(trade.profit.is_none());
        assert!(trade.error_message.is_some());
    }

    #[test]
    fn history_excludes_error_rows() {
        let ledger = TradeLedger::new(100);
        let mut won = TradeRecord::new_pending("u1", "s1", "R_100", "DIGITEVEN", 1.0, "orion", None);
        won.mark_settled(100.0, 1.0, Some(92.0));
        ledger.record(won);

        let mut errored = TradeRecord::new_pending("u1", "s1", "R_100", "DIGITEVEN", 1.0, "orion", None);
        errored.mark_error("timeout".to_string());
        ledger.record(errored);

        let history = ledger.history_for("u1", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TradeStatus::Won);
    }

    #[test]
    fn ledger_evicts_oldest_beyond_cap() {
        let ledger = TradeLedger::new(2);
        for i in 0..5 {
            ledger.record(TradeRecord::new_pending(
                "u1",
                "s1",
                "R_100",
                "DIGITEVEN",
                1.0,
                "orion",
                None,
            ));
            let _ = i;
        }
        assert_eq!(ledger.recent.read().len(), 2);
    }
}
