// =============================================================================
// Tick Store -- bounded ordered tick sequence per symbol
// =============================================================================
//
// Thread-safe ring buffer keyed by symbol, mirroring the teacher's
// `CandleBuffer`: a `RwLock<HashMap<...>>` of bounded `VecDeque`s, read
// mostly, written once per inbound tick.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::Tick;

/// One symbol's bounded tick history plus connection bookkeeping.
struct SymbolStream {
    ticks: VecDeque<Tick>,
    subscription_id: Option<String>,
    last_receive_epoch: Option<i64>,
    reconnect_attempts: u32,
}

impl SymbolStream {
    fn new() -> Self {
        Self {
            ticks: VecDeque::new(),
            subscription_id: None,
            last_receive_epoch: None,
            reconnect_attempts: 0,
        }
    }
}

/// Bounded, ordered tick history for every tracked symbol.
///
/// Invariant: `epoch` is non-decreasing within a symbol's sequence on
/// append (out-of-order ticks from a reconnect snapshot are accepted only
/// if `replace_all` is used); the sequence never exceeds `cap` (oldest
/// evicted first).
pub struct TickStore {
    streams: RwLock<HashMap<String, SymbolStream>>,
    cap: usize,
}

impl TickStore {
    pub fn new(cap: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            cap,
        }
    }

    /// Append a tick for `symbol`, evicting the oldest entry if the
    /// capacity is exceeded. Out-of-order ticks (epoch not increasing) are
    /// dropped rather than breaking the monotonic-epoch invariant.
    pub fn append(&self, symbol: &str, tick: Tick) {
        let mut streams = self.streams.write();
        let stream = streams
            .entry(symbol.to_string())
            .or_insert_with(SymbolStream::new);

        if let Some(last) = stream.ticks.back() {
            if tick.epoch < last.epoch {
                return;
            }
        }

        stream.ticks.push_back(tick);
        while stream.ticks.len() > self.cap {
            stream.ticks.pop_front();
        }
        stream.last_receive_epoch = Some(tick.epoch);
    }

    /// Replace the full in-memory history for `symbol` with a recovered
    /// snapshot (used on reconnection, per the gateway's guarantee that it
    /// emits the recovered buffer before any new tick).
    pub fn replace_all(&self, symbol: &str, ticks: Vec<Tick>) {
        let mut streams = self.streams.write();
        let stream = streams
            .entry(symbol.to_string())
            .or_insert_with(SymbolStream::new);
        stream.ticks = ticks.into_iter().collect();
        while stream.ticks.len() > self.cap {
            stream.ticks.pop_front();
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<Tick> {
        self.streams.read().get(symbol).and_then(|s| s.ticks.back().copied())
    }

    /// The most recent `n` ticks, oldest-first.
    pub fn last_n(&self, symbol: &str, n: usize) -> Vec<Tick> {
        let streams = self.streams.read();
        match streams.get(symbol) {
            Some(stream) => {
                let len = stream.ticks.len();
                let start = len.saturating_sub(n);
                stream.ticks.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self, symbol: &str) -> usize {
        self.streams.read().get(symbol).map_or(0, |s| s.ticks.len())
    }

    pub fn set_subscription_id(&self, symbol: &str, subscription_id: String) {
        let mut streams = self.streams.write();
        let stream = streams
            .entry(symbol.to_string())
            .or_insert_with(SymbolStream::new);
        stream.subscription_id = Some(subscription_id);
    }

    pub fn subscription_id(&self, symbol: &str) -> Option<String> {
        self.streams
            .read()
            .get(symbol)
            .and_then(|s| s.subscription_id.clone())
    }

    pub fn note_reconnect_attempt(&self, symbol: &str) -> u32 {
        let mut streams = self.streams.write();
        let stream = streams
            .entry(symbol.to_string())
            .or_insert_with(SymbolStream::new);
        stream.reconnect_attempts += 1;
        stream.reconnect_attempts
    }

    pub fn reset_reconnect_attempts(&self, symbol: &str) {
        let mut streams = self.streams.write();
        if let Some(stream) = streams.get_mut(symbol) {
            stream.reconnect_attempts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;

    fn tick(epoch: i64, value: f64) -> Tick {
        Tick::new(value, epoch).unwrap()
    }

    #[test]
    fn append_respects_cap() {
        let store = TickStore::new(3);
        for i in 0..5 {
            store.append("R_100", tick(1_700_000_000 + i, 100.0 + i as f64));
        }
        assert_eq!(store.count("R_100"), 3);
        let last = store.last_n("R_100", 10);
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].epoch, 1_700_000_002);
        assert_eq!(last[2].epoch, 1_700_000_004);
    }

    #[test]
    fn out_of_order_tick_is_dropped() {
        let store = TickStore::new(10);
        store.append("R_100", tick(1_700_000_010, 100.0));
        store.append("R_100", tick(1_700_000_005, 99.0));
        assert_eq!(store.count("R_100"), 1);
        assert_eq!(store.latest("R_100").unwrap().epoch, 1_700_000_010);
    }

    #[test]
    fn last_n_caps_at_available_count() {
        let store = TickStore::new(10);
        store.append("R_100", tick(1_700_000_000, 100.0));
        assert_eq!(store.last_n("R_100", 5).len(), 1);
    }

    #[test]
    fn replace_all_installs_recovered_snapshot() {
        let store = TickStore::new(5);
        store.append("R_100", tick(1_700_000_000, 100.0));
        let snapshot = vec![tick(1_700_000_100, 200.0), tick(1_700_000_101, 201.0)];
        store.replace_all("R_100", snapshot);
        assert_eq!(store.count("R_100"), 2);
        assert_eq!(store.latest("R_100").unwrap().epoch, 1_700_000_101);
    }

    #[test]
    fn unknown_symbol_returns_empty() {
        let store = TickStore::new(10);
        assert_eq!(store.count("UNKNOWN"), 0);
        assert!(store.last_n("UNKNOWN", 5).is_empty());
        assert!(store.latest("UNKNOWN").is_none());
    }

    #[test]
    fn reconnect_attempts_increment_and_reset() {
        let store = TickStore::new(10);
        assert_eq!(store.note_reconnect_attempt("R_100"), 1);
        assert_eq!(store.note_reconnect_attempt("R_100"), 2);
        store.reset_reconnect_attempts("R_100");
        assert_eq!(store.note_reconnect_attempt("R_100"), 1);
    }
}
