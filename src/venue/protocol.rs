// =============================================================================
// Wire protocol -- venue websocket JSON frames
// =============================================================================
//
// Outbound frames are built with `serde_json::json!`, mirroring the
// teacher's inline-`Value` request construction in `binance/client.rs`.
// Inbound frames are parsed field-at-a-time from a `serde_json::Value`
// exactly like `market_data::trade_stream::parse_agg_trade` rather than
// through one big tagged enum, since the venue's frames carry many
// optional top-level keys depending on `msg_type` and a strict enum would
// reject frames carrying fields this core does not use.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

/// Contract side understood by the venue: even or odd last digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractSide {
    Even,
    Odd,
}

impl ContractSide {
    pub fn contract_type(self) -> &'static str {
        match self {
            Self::Even => "DIGITEVEN",
            Self::Odd => "DIGITODD",
        }
    }
}

pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

pub fn ticks_history(symbol: &str, count: usize) -> Value {
    json!({
        "ticks_history": symbol,
        "subscribe": 1,
        "count": count,
        "end": "latest",
        "style": "ticks",
        "adjust_start_time": 1,
    })
}

pub fn proposal(currency: &str, side: ContractSide, stake: f64, symbol: &str) -> Value {
    json!({
        "proposal": 1,
        "amount": stake,
        "basis": "stake",
        "contract_type": side.contract_type(),
        "currency": currency,
        "duration": 1,
        "duration_unit": "t",
        "symbol": symbol,
    })
}

pub fn buy(proposal_id: &str, price: f64) -> Value {
    json!({ "buy": proposal_id, "price": price })
}

pub fn proposal_open_contract(contract_id: &str) -> Value {
    json!({
        "proposal_open_contract": 1,
        "contract_id": contract_id,
        "subscribe": 1,
    })
}

pub fn forget(subscription_id: &str) -> Value {
    json!({ "forget": subscription_id })
}

pub fn ping() -> Value {
    json!({ "ping": 1 })
}

pub fn balance() -> Value {
    json!({ "balance": 1, "subscribe": 0 })
}

/// One parsed history back-fill: `history.prices[]` / `history.times[]`,
/// zipped into `(epoch, value)` pairs oldest-first.
#[derive(Debug, Clone)]
pub struct HistoryFrame {
    pub samples: Vec<(i64, f64)>,
}

#[derive(Debug, Clone)]
pub struct TickFrame {
    pub symbol: String,
    pub quote: f64,
    pub epoch: i64,
}

#[derive(Debug, Clone)]
pub struct ProposalFrame {
    pub id: String,
    pub ask_price: f64,
    pub payout: f64,
}

#[derive(Debug, Clone)]
pub struct BuyFrame {
    pub contract_id: String,
    pub buy_price: f64,
    pub entry_spot: f64,
}

#[derive(Debug, Clone)]
pub struct OpenContractFrame {
    pub is_sold: bool,
    pub profit: f64,
    pub exit_spot: Option<f64>,
    pub current_spot: Option<f64>,
    pub entry_tick: Option<f64>,
    pub entry_spot: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BalanceFrame {
    pub balance: f64,
    pub currency: String,
    pub loginid: String,
}

/// One inbound venue frame, parsed just far enough for the gateway's own
/// needs. `msg_type` always drives which of the `Option`s is populated.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub msg_type: String,
    pub subscription_id: Option<String>,
    pub history: Option<HistoryFrame>,
    pub tick: Option<TickFrame>,
    pub proposal: Option<ProposalFrame>,
    pub buy: Option<BuyFrame>,
    pub open_contract: Option<OpenContractFrame>,
    pub balance: Option<BalanceFrame>,
    pub error_message: Option<String>,
}

impl InboundFrame {
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Parse a raw text frame into an `InboundFrame`, field at a time, the way
/// the teacher parses a raw aggregate-trade payload.
pub fn parse_inbound(raw: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(raw).context("venue frame is not valid JSON")?;

    let msg_type = value
        .get("msg_type")
        .and_then(Value::as_str)
        .context("venue frame missing msg_type")?
        .to_string();

    let error_message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let subscription_id = value
        .get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let history = value.get("history").map(parse_history).transpose()?;
    let tick = value.get("tick").map(parse_tick).transpose()?;
    let proposal = value.get("proposal").map(parse_proposal).transpose()?;
    let buy = value.get("buy").map(parse_buy).transpose()?;
    let open_contract = value
        .get("proposal_open_contract")
        .map(parse_open_contract)
        .transpose()?;
    let balance = value.get("balance").map(parse_balance).transpose()?;

    Ok(InboundFrame {
        msg_type,
        subscription_id,
        history,
        tick,
        proposal,
        buy,
        open_contract,
        balance,
        error_message,
    })
}

fn as_f64(v: &Value, field: &str) -> Result<f64> {
    v.get(field)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing or non-numeric field {field}"))
}

fn as_i64(v: &Value, field: &str) -> Result<i64> {
    v.get(field)
        .and_then(Value::as_i64)
        .with_context(|| format!("missing or non-integer field {field}"))
}

fn as_str(v: &Value, field: &str) -> Result<String> {
    v.get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .with_context(|| format!("missing or non-string field {field}"))
}

fn parse_history(v: &Value) -> Result<HistoryFrame> {
    let prices = v
        .get("prices")
        .and_then(Value::as_array)
        .context("history.prices missing")?;
    let times = v
        .get("times")
        .and_then(Value::as_array)
        .context("history.times missing")?;
    if prices.len() != times.len() {
        bail!("history.prices and history.times length mismatch");
    }
    let samples = times
        .iter()
        .zip(prices.iter())
        .filter_map(|(t, p)| Some((t.as_i64()?, p.as_f64()?)))
        .collect();
    Ok(HistoryFrame { samples })
}

fn parse_tick(v: &Value) -> Result<TickFrame> {
    Ok(TickFrame {
        symbol: as_str(v, "symbol")?,
        quote: as_f64(v, "quote")?,
        epoch: as_i64(v, "epoch")?,
    })
}

fn parse_proposal(v: &Value) -> Result<ProposalFrame> {
    Ok(ProposalFrame {
        id: as_str(v, "id")?,
        ask_price: as_f64(v, "ask_price")?,
        payout: as_f64(v, "payout")?,
    })
}

fn parse_buy(v: &Value) -> Result<BuyFrame> {
    Ok(BuyFrame {
        contract_id: match v.get("contract_id") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => bail!("buy.contract_id missing"),
        },
        buy_price: as_f64(v, "buy_price")?,
        entry_spot: as_f64(v, "entry_spot")?,
    })
}

fn parse_open_contract(v: &Value) -> Result<OpenContractFrame> {
    let is_sold = v
        .get("is_sold")
        .and_then(Value::as_i64)
        .map(|n| n != 0)
        .context("proposal_open_contract.is_sold missing")?;
    Ok(OpenContractFrame {
        is_sold,
        profit: as_f64(v, "profit")?,
        exit_spot: v.get("exit_spot").and_then(Value::as_f64),
        current_spot: v.get("current_spot").and_then(Value::as_f64),
        entry_tick: v.get("entry_tick").and_then(Value::as_f64),
        entry_spot: v.get("entry_spot").and_then(Value::as_f64),
    })
}

fn parse_balance(v: &Value) -> Result<BalanceFrame> {
    Ok(BalanceFrame {
        balance: as_f64(v, "balance")?,
        currency: as_str(v, "currency")?,
        loginid: as_str(v, "loginid")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tick_frame() {
        let raw = r#"{"msg_type":"tick","tick":{"symbol":"R_100","quote":1234.56,"epoch":1700000000}}"#;
        let frame = parse_inbound(raw).unwrap();
        assert_eq!(frame.msg_type, "tick");
        let tick = frame.tick.unwrap();
        assert_eq!(tick.symbol, "R_100");
        assert_eq!(tick.epoch, 1_700_000_000);
    }

    #[test]
    fn parses_history_frame_zipping_prices_and_times() {
        let raw = r#"{"msg_type":"history","history":{"prices":[1.1,1.2],"times":[100,101]}}"#;
        let frame = parse_inbound(raw).unwrap();
        let history = frame.history.unwrap();
        assert_eq!(history.samples, vec![(100, 1.1), (101, 1.2)]);
    }

    #[test]
    fn parses_error_frame() {
        let raw = r#"{"msg_type":"error","error":{"code":"AuthorizationRequired","message":"boom"}}"#;
        let frame = parse_inbound(raw).unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.error_message.unwrap(), "boom");
    }

    #[test]
    fn parses_proposal_open_contract_settlement() {
        let raw = r#"{"msg_type":"proposal_open_contract","proposal_open_contract":{"is_sold":1,"profit":0.92,"exit_spot":1234.5}}"#;
        let frame = parse_inbound(raw).unwrap();
        let oc = frame.open_contract.unwrap();
        assert!(oc.is_sold);
        assert_eq!(oc.profit, 0.92);
    }

    #[test]
    fn proposal_request_tags_contract_type() {
        let req = proposal("USD", ContractSide::Odd, 1.0, "R_100");
        assert_eq!(req["contract_type"], "DIGITODD");
        assert_eq!(req["duration_unit"], "t");
    }

    #[test]
    fn missing_msg_type_is_rejected() {
        assert!(parse_inbound(r#"{"foo":1}"#).is_err());
    }
}
