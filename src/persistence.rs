// =============================================================================
// Persistence -- SQLite-backed store for sessions, trades, logs, tick state
// =============================================================================
//
// One connection behind `parking_lot::Mutex`, WAL journal mode, schema
// created with `execute_batch` on open. Per spec's concurrency model,
// critical compound updates (activate/deactivate, trade settlement +
// session balance + counters) are single-statement `UPDATE`s rather than
// transaction-wrapped, so the row itself is the atomic unit; the log batch
// insert is the one place a real `BEGIN`/`COMMIT` bracket is used, mirroring
// the pack's own batched trade-print writer.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};

use crate::logging::LogEntry;
use crate::session::UserSession;
use crate::trade_ledger::TradeRecord;
use crate::types::{LogType, Mode, RiskProfile, SessionStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS ai_user_config (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    session_status TEXT NOT NULL,
    session_balance REAL NOT NULL,
    stake_amount REAL NOT NULL,
    entry_value REAL NOT NULL,
    deriv_token TEXT NOT NULL,
    currency TEXT NOT NULL,
    mode TEXT NOT NULL,
    modo_martingale TEXT NOT NULL,
    strategy TEXT NOT NULL,
    profit_target REAL NOT NULL,
    loss_limit REAL NOT NULL,
    stop_blindado_percent REAL,
    next_trade_at TEXT,
    last_trade_at TEXT,
    total_trades INTEGER NOT NULL DEFAULT 0,
    total_wins INTEGER NOT NULL DEFAULT 0,
    total_losses INTEGER NOT NULL DEFAULT 0,
    deactivation_reason TEXT,
    deactivated_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_config_active
    ON ai_user_config(user_id, is_active, created_at);

CREATE TABLE IF NOT EXISTS ai_trades (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    contract_type TEXT NOT NULL,
    stake_amount REAL NOT NULL,
    entry_price REAL,
    exit_price REAL,
    profit_loss REAL,
    payout REAL,
    status TEXT NOT NULL,
    strategy TEXT NOT NULL,
    analysis_data TEXT,
    contract_id TEXT,
    started_at TEXT NOT NULL,
    closed_at TEXT,
    created_at TEXT NOT NULL,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_user_status
    ON ai_trades(user_id, status, created_at);

CREATE TABLE IF NOT EXISTS ai_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    type TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_user_timestamp
    ON ai_logs(user_id, timestamp);

CREATE TABLE IF NOT EXISTS ai_websocket_state (
    symbol TEXT PRIMARY KEY,
    subscription_id TEXT,
    ticks_data TEXT,
    total_ticks INTEGER NOT NULL DEFAULT 0,
    last_tick_received_at INTEGER,
    websocket_url TEXT,
    is_connected INTEGER NOT NULL DEFAULT 0,
    connection_created_at TEXT,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub struct Store {
    conn: parking_lot::Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open persistence db {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize persistence schema")?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------

    pub fn upsert_session(&self, s: &UserSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO ai_user_config (
                id, user_id, is_active, session_status, session_balance, stake_amount,
                entry_value, deriv_token, currency, mode, modo_martingale, strategy,
                profit_target, loss_limit, stop_blindado_percent, total_trades,
                total_wins, total_losses, deactivation_reason, deactivated_at,
                created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
            ON CONFLICT(id) DO UPDATE SET
                is_active = excluded.is_active,
                session_status = excluded.session_status,
                session_balance = excluded.session_balance,
                total_trades = excluded.total_trades,
                total_wins = excluded.total_wins,
                total_losses = excluded.total_losses,
                deactivation_reason = excluded.deactivation_reason,
                deactivated_at = excluded.deactivated_at,
                updated_at = excluded.updated_at
            "#,
            params![
                s.id,
                s.user_id,
                s.is_active as i64,
                s.session_status.to_string(),
                s.session_balance,
                s.stake,
                s.initial_capital,
                s.deriv_token,
                s.currency,
                s.mode.to_string(),
                s.risk_profile.to_string(),
                s.strategy,
                s.profit_target,
                s.loss_limit,
                s.stop_blindado_percent,
                s.total_trades,
                s.total_wins,
                s.total_losses,
                s.deactivation_reason,
                s.deactivated_at,
                s.created_at,
                s.updated_at,
            ],
        )?;
        Ok(())
    }

    /// All sessions currently marked active, mirrored into memory by the
    /// orchestrator's periodic sync.
    pub fn active_sessions(&self) -> Result<Vec<UserSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, is_active, session_status, strategy, mode, modo_martingale,
                   deriv_token, currency, stake_amount, entry_value, session_balance, profit_target,
                   loss_limit, stop_blindado_percent, total_trades, total_wins, total_losses,
                   deactivation_reason, deactivated_at, created_at, updated_at
            FROM ai_user_config WHERE is_active = 1
            "#,
        )?;
        let rows = stmt
            .query_map([], Self::map_session_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<UserSession> {
        let mode_str: String = row.get(5)?;
        let profile_str: String = row.get(6)?;
        let status_str: String = row.get(3)?;
        Ok(UserSession {
            id: row.get(0)?,
            user_id: row.get(1)?,
            is_active: row.get::<_, i64>(2)? != 0,
            session_status: parse_session_status(&status_str),
            strategy: row.get(4)?,
            mode: parse_mode(&mode_str),
            risk_profile: parse_risk_profile(&profile_str),
            deriv_token: row.get(7)?,
            currency: row.get(8)?,
            stake: row.get(9)?,
            initial_capital: row.get(10)?,
            session_balance: row.get(11)?,
            profit_target: row.get(12)?,
            loss_limit: row.get(13)?,
            stop_blindado_percent: row.get(14)?,
            total_trades: row.get::<_, i64>(15)? as u32,
            total_wins: row.get::<_, i64>(16)? as u32,
            total_losses: row.get::<_, i64>(17)? as u32,
            deactivation_reason: row.get(18)?,
            deactivated_at: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }

    /// Startup clean-up step 1: force every previously-active session to
    /// `stopped_server_restart`.
    pub fn deactivate_all_active_sessions(&self, now_rfc3339: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            r#"
            UPDATE ai_user_config
            SET is_active = 0,
                session_status = 'stopped_server_restart',
                deactivated_at = ?1,
                updated_at = ?1
            WHERE is_active = 1
            "#,
            params![now_rfc3339],
        )?;
        Ok(affected)
    }

    // -------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------

    pub fn insert_trade(&self, t: &TradeRecord) -> Result<()> {
        let analysis_json = t
            .analysis_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize analysis_data")?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO ai_trades (
                id, user_id, symbol, contract_type, stake_amount, entry_price, exit_price,
                profit_loss, payout, status, strategy, analysis_data, contract_id,
                started_at, closed_at, created_at, error_message
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
            "#,
            params![
                t.id,
                t.user_id,
                t.symbol,
                t.contract_type,
                t.stake,
                t.entry_price,
                t.exit_price,
                t.profit,
                t.payout,
                t.status.to_string(),
                t.strategy,
                analysis_json,
                t.contract_id,
                t.started_at,
                t.closed_at,
                t.started_at,
                t.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn settle_trade(&self, t: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE ai_trades SET status = ?2, exit_price = ?3, profit_loss = ?4,
                payout = ?5, closed_at = ?6, error_message = ?7, contract_id = ?8,
                entry_price = ?9
            WHERE id = ?1
            "#,
            params![
                t.id,
                t.status.to_string(),
                t.exit_price,
                t.profit,
                t.payout,
                t.closed_at,
                t.error_message,
                t.contract_id,
                t.entry_price,
            ],
        )?;
        Ok(())
    }

    /// Startup clean-up step 2: any row left PENDING is a crash artifact.
    pub fn fail_pending_trades(&self, now_rfc3339: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            r#"
            UPDATE ai_trades
            SET status = 'ERROR',
                error_message = 'Server Restart - Connection Lost',
                closed_at = ?1
            WHERE status = 'PENDING'
            "#,
            params![now_rfc3339],
        )?;
        Ok(affected)
    }

    // -------------------------------------------------------------------
    // Logs (batched insert)
    // -------------------------------------------------------------------

    /// Insert a batch of log entries inside one transaction, matching the
    /// pack's `store_batch` shape.
    pub fn insert_log_batch(&self, entries: Vec<LogEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut count = 0usize;
        for entry in &entries {
            let result = conn.execute(
                r#"
                INSERT INTO ai_logs (user_id, session_id, type, message, details, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entry.user_id,
                    entry.session_id,
                    entry.log_type.to_string(),
                    entry.message,
                    entry.details,
                    entry.timestamp_ms,
                ],
            );
            if result.is_ok() {
                count += 1;
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(count)
    }

    /// Trim a user's log history to the most recent `keep` rows.
    pub fn trim_logs_for_user(&self, user_id: &str, keep: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            r#"
            DELETE FROM ai_logs
            WHERE user_id = ?1 AND id NOT IN (
                SELECT id FROM ai_logs WHERE user_id = ?1 ORDER BY timestamp DESC LIMIT ?2
            )
            "#,
            params![user_id, keep as i64],
        )?;
        Ok(affected)
    }

    // -------------------------------------------------------------------
    // Tick-buffer snapshot (ai_websocket_state)
    // -------------------------------------------------------------------

    /// Persist the last-50-ticks snapshot so a restart can resume analysis
    /// without a full back-fill window.
    pub fn save_tick_snapshot(&self, symbol: &str, ticks_json: &str, total_ticks: u64, now_rfc3339: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO ai_websocket_state (symbol, ticks_data, total_ticks, updated_at, is_connected)
            VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(symbol) DO UPDATE SET
                ticks_data = excluded.ticks_data,
                total_ticks = excluded.total_ticks,
                updated_at = excluded.updated_at
            "#,
            params![symbol, ticks_json, total_ticks as i64, now_rfc3339],
        )?;
        Ok(())
    }

    pub fn load_tick_snapshot(&self, symbol: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT ticks_data FROM ai_websocket_state WHERE symbol = ?1",
            params![symbol],
            |row| row.get::<_, Option<String>>(0),
        );
        match result {
            Ok(data) => Ok(data),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "moderado" => Mode::Moderado,
        "preciso" => Mode::Preciso,
        _ => Mode::Veloz,
    }
}

fn parse_risk_profile(s: &str) -> RiskProfile {
    match s {
        "moderado" => RiskProfile::Moderado,
        "agressivo" => RiskProfile::Agressivo,
        _ => RiskProfile::Conservador,
    }
}

fn parse_session_status(s: &str) -> SessionStatus {
    match s {
        "stopped_profit" => SessionStatus::StoppedProfit,
        "stopped_loss" => SessionStatus::StoppedLoss,
        "stopped_blindado" => SessionStatus::StoppedBlindado,
        "stopped_server_restart" => SessionStatus::StoppedServerRestart,
        _ => SessionStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade_ledger::TradeRecord;

    fn sample_session(id: &str, active: bool) -> UserSession {
        UserSession {
            id: id.to_string(),
            user_id: "u1".to_string(),
            is_active: active,
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
            stop_blindado_percent: Some(50.0),
            total_trades: 0,
            total_wins: 0,
            total_losses: 0,
            deactivation_reason: None,
            deactivated_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn upsert_and_read_active_sessions() {
        let store = Store::open_memory().unwrap();
        store.upsert_session(&sample_session("s1", true)).unwrap();
        store.upsert_session(&sample_session("s2", false)).unwrap();
        let active = store.active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "s1");
    }

    #[test]
    fn startup_cleanup_deactivates_active_sessions() {
        let store = Store::open_memory().unwrap();
        store.upsert_session(&sample_session("s1", true)).unwrap();
        let affected = store
            .deactivate_all_active_sessions("2026-01-02T00:00:00Z")
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(store.active_sessions().unwrap().len(), 0);
    }

    #[test]
    fn startup_cleanup_fails_pending_trades() {
        let store = Store::open_memory().unwrap();
        let trade = TradeRecord::new_pending("u1", "s1", "R_100", "DIGITEVEN", 1.0, "orion", None);
        store.insert_trade(&trade).unwrap();
        let affected = store.fail_pending_trades("2026-01-02T00:00:00Z").unwrap();
        assert_eq!(affected, 1);
    }

    #[test]
    fn log_batch_insert_and_trim() {
        let store = Store::open_memory().unwrap();
        let mut entries = Vec::new();
        for i in 0..5 {
            entries.push(LogEntry::new(
                "u1",
                "s1",
                LogType::Info,
                format!("entry {i}"),
                None,
                5000,
                10000,
            ));
        }
        let inserted = store.insert_log_batch(entries).unwrap();
        assert_eq!(inserted, 5);
        let trimmed = store.trim_logs_for_user("u1", 2).unwrap();
        assert_eq!(trimmed, 3);
    }

    #[test]
    fn tick_snapshot_roundtrip() {
        let store = Store::open_memory().unwrap();
        store
            .save_tick_snapshot("R_100", "[1,2,3]", 3, "2026-01-01T00:00:00Z")
            .unwrap();
        let loaded = store.load_tick_snapshot("R_100").unwrap();
        assert_eq!(loaded, Some("[1,2,3]".to_string()));
        assert_eq!(store.load_tick_snapshot("UNKNOWN").unwrap(), None);
    }
}
