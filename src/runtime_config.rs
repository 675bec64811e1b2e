// =============================================================================
// Runtime Configuration — process-wide fixed knobs, hot-reloadable via file
// =============================================================================
//
// Every tunable that is not per-session (those live on `UserSession`, see
// `session.rs`) lives here: the venue app-id, the primary symbol, payout
// markup, the shielded-stop default percent, cache/keep-alive intervals,
// venue timeouts, and log batching limits.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_app_id() -> String {
    "1089".to_string()
}

fn default_primary_symbol() -> String {
    "R_100".to_string()
}

fn default_max_history() -> usize {
    100
}

fn default_payout_markup() -> f64 {
    3.0
}

fn default_shielded_percent() -> f64 {
    50.0
}

fn default_config_cache_ttl_ms() -> u64 {
    1_000
}

fn default_keep_alive_interval_secs() -> u64 {
    90
}

fn default_payout_timeout_secs() -> u64 {
    10
}

fn default_trade_send_timeout_secs() -> u64 {
    30
}

fn default_full_contract_timeout_secs() -> u64 {
    60
}

fn default_monitor_timeout_secs() -> u64 {
    120
}

fn default_log_batch_size() -> usize {
    50
}

fn default_log_message_cap() -> usize {
    5_000
}

fn default_log_details_cap() -> usize {
    10_000
}

fn default_default_payout_cliente() -> f64 {
    92.0
}

fn default_periodic_sync_interval_secs() -> u64 {
    60
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Zenix engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Venue application id supplied in the connect URL.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Primary symbol the main strategy trades (additional symbols may be
    /// subscribed by other strategies running in the same process).
    #[serde(default = "default_primary_symbol")]
    pub primary_symbol: String,

    /// Bounded tick history length per symbol.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// House markup subtracted from the venue's quoted payout, in
    /// percentage points.
    #[serde(default = "default_payout_markup")]
    pub payout_markup: f64,

    /// Default shielded-stop percent offered to sessions that enable the
    /// feature without specifying their own.
    #[serde(default = "default_shielded_percent")]
    pub shielded_default_percent: f64,

    /// TTL of the in-memory `CachedUserConfig` entries, in milliseconds.
    #[serde(default = "default_config_cache_ttl_ms")]
    pub config_cache_ttl_ms: u64,

    /// Ping interval for long-lived market-data sockets.
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    /// Timeout for a payout or balance query.
    #[serde(default = "default_payout_timeout_secs")]
    pub payout_timeout_secs: u64,

    /// Timeout for sending a trade (authorize + proposal + buy).
    #[serde(default = "default_trade_send_timeout_secs")]
    pub trade_send_timeout_secs: u64,

    /// Timeout for the full contract lifecycle (send through settlement).
    #[serde(default = "default_full_contract_timeout_secs")]
    pub full_contract_timeout_secs: u64,

    /// Timeout while only monitoring an already-bought contract.
    #[serde(default = "default_monitor_timeout_secs")]
    pub monitor_timeout_secs: u64,

    /// Maximum log entries flushed to persistence in one batch.
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,

    /// Maximum characters retained in a `LogEntry.message`.
    #[serde(default = "default_log_message_cap")]
    pub log_message_cap: usize,

    /// Maximum characters retained in a `LogEntry.details` JSON blob.
    #[serde(default = "default_log_details_cap")]
    pub log_details_cap: usize,

    /// Fallback client payout used when a live payout query fails.
    #[serde(default = "default_default_payout_cliente")]
    pub default_payout_cliente: f64,

    /// Interval between periodic syncs of active sessions from persistence.
    #[serde(default = "default_periodic_sync_interval_secs")]
    pub periodic_sync_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            primary_symbol: default_primary_symbol(),
            max_history: default_max_history(),
            payout_markup: default_payout_markup(),
            shielded_default_percent: default_shielded_percent(),
            config_cache_ttl_ms: default_config_cache_ttl_ms(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            payout_timeout_secs: default_payout_timeout_secs(),
            trade_send_timeout_secs: default_trade_send_timeout_secs(),
            full_contract_timeout_secs: default_full_contract_timeout_secs(),
            monitor_timeout_secs: default_monitor_timeout_secs(),
            log_batch_size: default_log_batch_size(),
            log_message_cap: default_log_message_cap(),
            log_details_cap: default_log_details_cap(),
            default_payout_cliente: default_default_payout_cliente(),
            periodic_sync_interval_secs: default_periodic_sync_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.config_cache_ttl_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn payout_timeout(&self) -> Duration {
        Duration::from_secs(self.payout_timeout_secs)
    }

    pub fn trade_send_timeout(&self) -> Duration {
        Duration::from_secs(self.trade_send_timeout_secs)
    }

    pub fn full_contract_timeout(&self) -> Duration {
        Duration::from_secs(self.full_contract_timeout_secs)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_timeout_secs)
    }

    pub fn periodic_sync_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_sync_interval_secs)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            primary_symbol = %config.primary_symbol,
            app_id = %config.app_id,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.primary_symbol, "R_100");
        assert_eq!(cfg.max_history, 100);
        assert_eq!(cfg.payout_markup, 3.0);
        assert_eq!(cfg.shielded_default_percent, 50.0);
        assert_eq!(cfg.log_batch_size, 50);
        assert_eq!(cfg.log_message_cap, 5_000);
        assert_eq!(cfg.log_details_cap, 10_000);
        assert_eq!(cfg.default_payout_cliente, 92.0);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.app_id, "1089");
        assert_eq!(cfg.keep_alive_interval_secs, 90);
        assert_eq!(cfg.monitor_timeout_secs, 120);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "primary_symbol": "R_50" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.primary_symbol, "R_50");
        assert_eq!(cfg.max_history, 100);
        assert_eq!(cfg.payout_markup, 3.0);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.primary_symbol, cfg2.primary_symbol);
        assert_eq!(cfg.app_id, cfg2.app_id);
    }

    #[test]
    fn durations_convert_from_seconds_fields() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.keep_alive_interval(), Duration::from_secs(90));
        assert_eq!(cfg.full_contract_timeout(), Duration::from_secs(60));
    }
}
