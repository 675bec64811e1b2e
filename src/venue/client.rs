// =============================================================================
// Venue Gateway -- long-lived market-data sockets + short-lived trade sockets
// =============================================================================
//
// Mirrors `market_data::trade_stream::run_trade_stream`'s connect/read-loop/
// reconnect shape for market data, and `execution::ExecutionEngine`'s
// risk-gate-then-execute chain for the per-trade sequence, generalized to
// the venue's authorize/proposal/buy/proposal_open_contract protocol. One
// task per symbol owns that symbol's long-lived socket; `active_symbols`
// makes `ensure_market_data` idempotent so a second caller for the same
// symbol never spawns a competing task, and the per-symbol `recreating`
// lock documents -- and would serialize, were a second writer ever
// introduced -- the "single writer per socket" invariant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, instrument, warn};

use crate::money_management::payout_cliente;
use crate::runtime_config::RuntimeConfig;
use crate::tick_store::TickStore;
use crate::types::{Tick, TradeStatus};
use crate::venue::protocol::{self, ContractSide, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Disposition a caller should use to decide whether to retry.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Network-level failure or a venue error without a recoverable
    /// subscription id -- safe to reconnect/retry.
    Transient(String),
    /// Authorize/proposal/buy rejection -- retrying the same request will
    /// not succeed.
    NonRetryable(String),
    /// The call exceeded its configured timeout.
    Timeout,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient venue error: {msg}"),
            Self::NonRetryable(msg) => write!(f, "non-retryable venue error: {msg}"),
            Self::Timeout => write!(f, "venue call timed out"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Parameters for one contract attempt.
#[derive(Debug, Clone)]
pub struct ContractParams {
    pub currency: String,
    pub side: ContractSide,
    pub stake: f64,
    pub symbol: String,
}

/// Terminal outcome of `execute_contract`.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: TradeStatus,
    pub profit: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub contract_id: String,
    /// Quoted payout minus stake, captured the moment the proposal frame
    /// arrived -- per spec.md §4.1's "on proposal arrival, persist quoted
    /// payout - stake" step, not recomputed at settlement.
    pub payout: f64,
}

/// Raw account the caller already has on file for a user -- account
/// storage itself is an external collaborator; the gateway only resolves
/// among accounts it is handed.
#[derive(Debug, Clone)]
pub struct VenueAccount {
    pub token: String,
    pub currency: String,
    pub loginid: String,
    pub is_virtual: bool,
    pub balance: f64,
}

#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub token: String,
    pub currency: String,
    pub loginid: String,
    pub is_virtual: bool,
}

/// Resolve which of a user's known venue accounts to trade: prefer a
/// matching currency with a nonzero balance, then any matching currency,
/// then the first nonzero real account, then the first real account at
/// all.
pub fn resolve_account(accounts: &[VenueAccount], requested_currency: &str) -> Option<ResolvedAccount> {
    accounts
        .iter()
        .find(|a| a.currency.eq_ignore_ascii_case(requested_currency) && a.balance != 0.0)
        .or_else(|| accounts.iter().find(|a| a.currency.eq_ignore_ascii_case(requested_currency)))
        .or_else(|| accounts.iter().find(|a| !a.is_virtual && a.balance != 0.0))
        .or_else(|| accounts.iter().find(|a| !a.is_virtual))
        .map(|a| ResolvedAccount {
            token: a.token.clone(),
            currency: a.currency.clone(),
            loginid: a.loginid.clone(),
            is_virtual: a.is_virtual,
        })
}

#[derive(Debug, Clone)]
pub struct BalanceInfo {
    pub amount: f64,
    pub currency: String,
    pub loginid: String,
}

pub struct VenueGateway {
    app_id: String,
    ws_base_url: String,
    max_history: usize,
    payout_markup: f64,
    keep_alive_interval: Duration,
    payout_timeout: Duration,
    trade_send_timeout: Duration,
    full_contract_timeout: Duration,
    monitor_timeout: Duration,
    tick_store: Arc<TickStore>,
    active_symbols: Mutex<HashMap<String, SymbolHandle>>,
    /// Fan-out of every freshly appended tick, keyed by symbol -- the
    /// Orchestrator's tick-dispatch loop subscribes to this to drive the
    /// Strategy Runtime without polling the Tick Store.
    tick_tx: broadcast::Sender<(String, Tick)>,
}

/// Per-symbol bookkeeping: the recreate-lock that serializes reconnection,
/// and the task handle `shutdown` aborts to close the socket for good.
struct SymbolHandle {
    recreating: Arc<Mutex<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl VenueGateway {
    pub fn new(config: &RuntimeConfig, tick_store: Arc<TickStore>) -> Arc<Self> {
        let (tick_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            app_id: config.app_id.clone(),
            ws_base_url: "wss://ws.derivws.com/websockets/v3".to_string(),
            max_history: config.max_history,
            payout_markup: config.payout_markup,
            keep_alive_interval: config.keep_alive_interval(),
            payout_timeout: config.payout_timeout(),
            trade_send_timeout: config.trade_send_timeout(),
            full_contract_timeout: config.full_contract_timeout(),
            monitor_timeout: config.monitor_timeout(),
            tick_store,
            active_symbols: Mutex::new(HashMap::new()),
            tick_tx,
        })
    }

    /// Subscribe to the live tick fan-out. Lagging receivers silently skip
    /// ahead (per `broadcast`'s semantics) rather than block tick ingest.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<(String, Tick)> {
        self.tick_tx.subscribe()
    }

    fn connect_url(&self) -> String {
        format!("{}?app_id={}", self.ws_base_url, self.app_id)
    }

    /// Idempotently ensure a long-lived market-data connection is running
    /// for every symbol in `symbols`, spawning exactly one task per symbol
    /// the first time it is requested.
    pub async fn ensure_market_data(self: &Arc<Self>, symbols: &[String]) {
        let mut active = self.active_symbols.lock().await;
        for symbol in symbols {
            if active.contains_key(symbol) {
                continue;
            }
            let recreating = Arc::new(Mutex::new(()));
            let gateway = self.clone();
            let task_symbol = symbol.clone();
            let task_recreating = recreating.clone();
            let task = tokio::spawn(async move {
                gateway.run_symbol_loop(task_symbol, task_recreating).await;
            });
            active.insert(symbol.clone(), SymbolHandle { recreating, task });
        }
    }

    /// Graceful shutdown: stop every symbol's keep-alive/read loop and drop
    /// its socket. Subscriptions are implicitly cancelled by the venue once
    /// the connection closes, so no explicit `forget` round-trip is needed
    /// on a connection we are about to abort anyway.
    pub async fn shutdown(&self) {
        let mut active = self.active_symbols.lock().await;
        for (symbol, handle) in active.drain() {
            handle.task.abort();
            info!(symbol = %symbol, "market-data connection closed for shutdown");
        }
    }

    #[instrument(skip(self, recreating), name = "venue_symbol_loop")]
    async fn run_symbol_loop(self: Arc<Self>, symbol: String, recreating: Arc<Mutex<()>>) {
        loop {
            let _guard = recreating.lock().await;
            match self.connect_and_stream(&symbol).await {
                Ok(()) => {
                    info!(symbol = %symbol, "market-data connection closed cleanly");
                }
                Err(e) => {
                    let attempts = self.tick_store.note_reconnect_attempt(&symbol);
                    warn!(symbol = %symbol, error = %e, attempts, "market-data connection failed, reconnecting");
                }
            }
            drop(_guard);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn connect_and_stream(&self, symbol: &str) -> Result<()> {
        let url = self.connect_url();
        let (ws, _) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect market-data socket for {symbol}"))?;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(protocol::ticks_history(symbol, self.max_history).to_string()))
            .await
            .context("failed to send ticks_history subscribe")?;

        let mut ping_ticker = tokio::time::interval(self.keep_alive_interval);
        ping_ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                maybe_msg = read.next() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_market_data_frame(symbol, &text)?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("market-data socket closed by venue");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => anyhow::bail!("market-data socket error: {e}"),
                    }
                }
                _ = ping_ticker.tick() => {
                    write
                        .send(Message::Text(protocol::ping().to_string()))
                        .await
                        .context("failed to send keep-alive ping")?;
                }
            }
        }
    }

    fn handle_market_data_frame(&self, symbol: &str, raw: &str) -> Result<()> {
        let frame = protocol::parse_inbound(raw)?;
        if frame.is_error() {
            anyhow::bail!(
                "venue reported error on market-data stream: {}",
                frame.error_message.unwrap_or_default()
            );
        }

        if let Some(id) = &frame.subscription_id {
            self.tick_store.set_subscription_id(symbol, id.clone());
        }

        if let Some(history) = frame.history {
            let ticks: Vec<Tick> = history
                .samples
                .into_iter()
                .filter_map(|(epoch, value)| Tick::new(value, epoch))
                .collect();
            self.tick_store.replace_all(symbol, ticks);
            self.tick_store.reset_reconnect_attempts(symbol);
        }

        if let Some(tick) = frame.tick {
            if let Some(parsed) = Tick::new(tick.quote, tick.epoch) {
                self.tick_store.append(&tick.symbol, parsed);
                self.tick_store.reset_reconnect_attempts(&tick.symbol);
                let _ = self.tick_tx.send((tick.symbol.clone(), parsed));
            }
        }

        Ok(())
    }

    /// Run a full contract: authorize, propose, buy at the quoted ask
    /// price, subscribe to the open contract, and wait for settlement.
    #[instrument(skip(self, token), fields(symbol = %params.symbol))]
    pub async fn execute_contract(&self, token: &str, params: &ContractParams) -> Result<Settlement, GatewayError> {
        match tokio::time::timeout(self.full_contract_timeout, self.execute_contract_inner(token, params)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    async fn execute_contract_inner(&self, token: &str, params: &ContractParams) -> Result<Settlement, GatewayError> {
        let url = self.connect_url();
        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let send_phase = async {
            send_frame(&mut ws, &protocol::authorize(token)).await?;
            expect_frame(&mut ws, "authorize").await?;

            send_frame(&mut ws, &protocol::proposal(&params.currency, params.side, params.stake, &params.symbol)).await?;
            let proposal_frame = expect_frame(&mut ws, "proposal").await?;
            let proposal = proposal_frame
                .proposal
                .ok_or_else(|| GatewayError::NonRetryable("proposal frame missing proposal object".into()))?;
            // Persist the quoted payout net of stake the moment the proposal
            // arrives, per spec.md §4.1 -- not recomputed later from the
            // settlement frame.
            let payout = proposal.payout - params.stake;

            send_frame(&mut ws, &protocol::buy(&proposal.id, proposal.ask_price)).await?;
            let buy_frame = expect_frame(&mut ws, "buy").await?;
            let buy = buy_frame
                .buy
                .ok_or_else(|| GatewayError::NonRetryable("buy frame missing buy object".into()))?;

            send_frame(&mut ws, &protocol::proposal_open_contract(&buy.contract_id)).await?;
            Ok::<_, GatewayError>((buy, payout))
        };

        let (buy, payout) = match tokio::time::timeout(self.trade_send_timeout, send_phase).await {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Timeout),
        };

        let monitor = async {
            loop {
                let frame = expect_frame(&mut ws, "proposal_open_contract").await?;
                let oc = frame
                    .open_contract
                    .ok_or_else(|| GatewayError::NonRetryable("proposal_open_contract frame missing object".into()))?;
                if oc.is_sold {
                    let status = if oc.profit >= 0.0 { TradeStatus::Won } else { TradeStatus::Lost };
                    return Ok::<_, GatewayError>(Settlement {
                        status,
                        profit: oc.profit,
                        entry_price: buy.entry_spot,
                        exit_price: oc.exit_spot.unwrap_or(buy.entry_spot),
                        contract_id: buy.contract_id.clone(),
                        payout,
                    });
                }
            }
        };

        match tokio::time::timeout(self.monitor_timeout, monitor).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Cheap payout quote: authorize + a 1-unit proposal, converted to the
    /// client-facing percentage net of the house markup.
    pub async fn query_payout(&self, token: &str, symbol: &str, currency: &str, side: ContractSide) -> Result<f64, GatewayError> {
        let fut = async {
            let url = self.connect_url();
            let (mut ws, _) = connect_async(&url)
                .await
                .map_err(|e| GatewayError::Transient(e.to_string()))?;

            send_frame(&mut ws, &protocol::authorize(token)).await?;
            expect_frame(&mut ws, "authorize").await?;

            send_frame(&mut ws, &protocol::proposal(currency, side, 1.0, symbol)).await?;
            let frame = expect_frame(&mut ws, "proposal").await?;
            let proposal = frame
                .proposal
                .ok_or_else(|| GatewayError::NonRetryable("proposal frame missing proposal object".into()))?;

            if proposal.ask_price <= 0.0 {
                return Err(GatewayError::NonRetryable("proposal ask_price is not positive".into()));
            }
            let payout_percent = ((proposal.payout / proposal.ask_price) - 1.0) * 100.0;
            Ok(payout_cliente(payout_percent, self.payout_markup))
        };

        match tokio::time::timeout(self.payout_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Current account balance for `token`.
    pub async fn query_balance(&self, token: &str) -> Result<BalanceInfo, GatewayError> {
        let fut = async {
            let url = self.connect_url();
            let (mut ws, _) = connect_async(&url)
                .await
                .map_err(|e| GatewayError::Transient(e.to_string()))?;

            send_frame(&mut ws, &protocol::authorize(token)).await?;
            expect_frame(&mut ws, "authorize").await?;

            send_frame(&mut ws, &protocol::balance()).await?;
            let frame = expect_frame(&mut ws, "balance").await?;
            let balance = frame
                .balance
                .ok_or_else(|| GatewayError::NonRetryable("balance frame missing balance object".into()))?;

            Ok(BalanceInfo {
                amount: balance.balance,
                currency: balance.currency,
                loginid: balance.loginid,
            })
        };

        match tokio::time::timeout(self.payout_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }
}

async fn send_frame(ws: &mut WsStream, value: &Value) -> Result<(), GatewayError> {
    ws.send(Message::Text(value.to_string()))
        .await
        .map_err(|e| GatewayError::Transient(e.to_string()))
}

/// Read frames off `ws` until one with `msg_type == expected` arrives,
/// skipping anything else (pings, unrelated subscriptions). Any `error`
/// frame encountered along the way fails the call immediately.
async fn expect_frame(ws: &mut WsStream, expected: &str) -> Result<InboundFrame, GatewayError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = protocol::parse_inbound(&text).map_err(|e| GatewayError::Transient(e.to_string()))?;
                if frame.is_error() {
                    return Err(GatewayError::NonRetryable(frame.error_message.unwrap_or_default()));
                }
                if frame.msg_type == expected {
                    return Ok(frame);
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(GatewayError::Transient("venue closed connection".to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(GatewayError::Transient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(token: &str, currency: &str, is_virtual: bool, balance: f64) -> VenueAccount {
        VenueAccount {
            token: token.to_string(),
            currency: currency.to_string(),
            loginid: format!("CR{token}"),
            is_virtual,
            balance,
        }
    }

    #[test]
    fn resolve_prefers_matching_currency_with_balance() {
        let accounts = vec![
            account("t1", "USD", false, 0.0),
            account("t2", "USD", false, 50.0),
            account("t3", "BTC", false, 10.0),
        ];
        let resolved = resolve_account(&accounts, "USD").unwrap();
        assert_eq!(resolved.token, "t2");
    }

    #[test]
    fn resolve_falls_back_to_any_matching_currency() {
        let accounts = vec![account("t1", "USD", false, 0.0)];
        let resolved = resolve_account(&accounts, "USD").unwrap();
        assert_eq!(resolved.token, "t1");
    }

    #[test]
    fn resolve_falls_back_to_first_real_account() {
        let accounts = vec![account("v1", "USD", true, 100.0), account("t1", "BTC", false, 0.0)];
        let resolved = resolve_account(&accounts, "EUR").unwrap();
        assert_eq!(resolved.token, "t1");
    }

    #[test]
    fn resolve_returns_none_for_empty_accounts() {
        assert!(resolve_account(&[], "USD").is_none());
    }

    #[test]
    fn gateway_error_display_is_human_readable() {
        assert!(GatewayError::Timeout.to_string().contains("timed out"));
        assert!(GatewayError::NonRetryable("bad token".into()).to_string().contains("bad token"));
    }
}
