//! Clock service
//!
//! Components register a tick channel with a period. Synchronized tickers
//! fire on wall-clock boundaries (a 300 s period ticks at :00, :05, :10, ...);
//! unsynchronized tickers fire every period from the moment they were
//! created. Subscribers sharing a period share one ticker task, and removing
//! one subscriber never disturbs the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type Tick = DateTime<Utc>;
pub type TickSender = mpsc::Sender<Tick>;
pub type TickReceiver = mpsc::Receiver<Tick>;

/// Capacity of tick channels handed out to components.
pub const TICK_CHANNEL_SIZE: usize = 4;

/// Create a tick channel with the standard capacity.
pub fn tick_channel() -> (TickSender, TickReceiver) {
    mpsc::channel(TICK_CHANNEL_SIZE)
}

/// Clock service consumed by the sender and analyzers.
pub trait Clock: Send + Sync {
    /// Deliver ticks every `period_secs` to `tick_tx`. With `sync`, ticks are
    /// aligned to wall-clock multiples of the period.
    fn add(&self, tick_tx: TickSender, period_secs: u64, sync: bool);

    /// Stop delivering ticks to `tick_tx`.
    fn remove(&self, tick_tx: &TickSender);

    /// Seconds until the next tick for `tick_tx`, or 0 if not registered.
    fn eta(&self, tick_tx: &TickSender) -> f64;
}

/// Next wall-clock aligned boundary strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>, period_secs: u64) -> DateTime<Utc> {
    let period_ms = (period_secs.max(1) * 1000) as i64;
    let now_ms = now.timestamp_millis();
    let next_ms = (now_ms.div_euclid(period_ms) + 1) * period_ms;
    Utc.timestamp_millis_opt(next_ms).single().unwrap_or(now)
}

/// Wall-clock aligned boundary at or before `now`.
pub fn last_boundary(now: DateTime<Utc>, period_secs: u64) -> DateTime<Utc> {
    let period_ms = (period_secs.max(1) * 1000) as i64;
    let now_ms = now.timestamp_millis();
    let last_ms = now_ms.div_euclid(period_ms) * period_ms;
    Utc.timestamp_millis_opt(last_ms).single().unwrap_or(now)
}

struct Ticker {
    subscribers: Arc<Mutex<Vec<TickSender>>>,
    next_tick: Arc<Mutex<DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl Ticker {
    fn spawn(period_secs: u64, sync: bool) -> Self {
        let subscribers: Arc<Mutex<Vec<TickSender>>> = Arc::new(Mutex::new(Vec::new()));
        let first = if sync {
            next_boundary(Utc::now(), period_secs)
        } else {
            Utc::now() + chrono::Duration::seconds(period_secs as i64)
        };
        let next_tick = Arc::new(Mutex::new(first));
        let cancel = CancellationToken::new();

        let task_subscribers = Arc::clone(&subscribers);
        let task_next = Arc::clone(&next_tick);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            debug!(period = period_secs, sync, "ticker started");
            loop {
                let at = *task_next.lock().unwrap_or_else(|e| e.into_inner());
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                {
                    let subscribers = task_subscribers.lock().unwrap_or_else(|e| e.into_inner());
                    for tx in subscribers.iter() {
                        match tx.try_send(at) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(period = period_secs, "tick dropped, receiver is not keeping up")
                            }
                            Err(TrySendError::Closed(_)) => {}
                        }
                    }
                }

                let next = if sync {
                    next_boundary(Utc::now().max(at), period_secs)
                } else {
                    at + chrono::Duration::seconds(period_secs as i64)
                };
                *task_next.lock().unwrap_or_else(|e| e.into_inner()) = next;
            }
            debug!(period = period_secs, sync, "ticker stopped");
        });

        Self {
            subscribers,
            next_tick,
            cancel,
        }
    }
}

/// The process-wide clock: one ticker task per distinct (period, sync).
#[derive(Default)]
pub struct SystemClock {
    tickers: Mutex<HashMap<(u64, bool), Ticker>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn add(&self, tick_tx: TickSender, period_secs: u64, sync: bool) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        let ticker = tickers
            .entry((period_secs, sync))
            .or_insert_with(|| Ticker::spawn(period_secs, sync));
        let mut subscribers = ticker.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if !subscribers.iter().any(|tx| tx.same_channel(&tick_tx)) {
            subscribers.push(tick_tx);
        }
    }

    fn remove(&self, tick_tx: &TickSender) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        let mut empty = Vec::new();
        for (key, ticker) in tickers.iter() {
            let mut subscribers = ticker.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|tx| !tx.same_channel(tick_tx));
            if subscribers.is_empty() {
                empty.push(*key);
            }
        }
        for key in empty {
            if let Some(ticker) = tickers.remove(&key) {
                ticker.cancel.cancel();
            }
        }
    }

    fn eta(&self, tick_tx: &TickSender) -> f64 {
        let tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        for ticker in tickers.values() {
            let subscribed = ticker
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|tx| tx.same_channel(tick_tx));
            if subscribed {
                let next = *ticker.next_tick.lock().unwrap_or_else(|e| e.into_inner());
                let ms = (next - Utc::now()).num_milliseconds().max(0);
                return ms as f64 / 1000.0;
            }
        }
        0.0
    }
}

impl Drop for SystemClock {
    fn drop(&mut self) {
        let tickers = self.tickers.get_mut().unwrap_or_else(|e| e.into_inner());
        for ticker in tickers.values() {
            ticker.cancel.cancel();
        }
    }
}
