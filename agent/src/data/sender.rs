//! Spool drainer
//!
//! On every tick the sender connects to the collector, walks the spool oldest
//! first and sends each item, letting the collector's response code decide
//! whether the item is removed, rejected, or left for the next cycle. A cycle
//! never runs past its time budget.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::spooler::Spooler;
use crate::data::stats::{SenderStats, SentInfo};
use crate::data::transport::Transport;
use crate::error::{SenderError, SenderResult, TransportError};
use crate::proto::StatusMap;
use crate::status::Status;
use crate::ticker::TickReceiver;

pub const CONNECT_ATTEMPTS: u32 = 3;
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(3);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP-style code the collector uses to ask the agent to back off.
pub const CODE_THROTTLED: u16 = 299;

const STATS_DAY: Duration = Duration::from_secs(24 * 3600);

struct Stats {
    last: SenderStats,
    day: SenderStats,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Sender {
    transport: Arc<AsyncMutex<Box<dyn Transport>>>,
    connect_backoff: Duration,
    connect_timeout: Duration,
    status: Status,
    stats: Arc<Mutex<Stats>>,
    running: Mutex<Option<Running>>,
}

impl Sender {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Arc::new(AsyncMutex::new(transport)),
            connect_backoff: CONNECT_BACKOFF,
            connect_timeout: CONNECT_TIMEOUT,
            status: Status::new(&["data-sender", "data-sender-last", "data-sender-1d"]),
            stats: Arc::new(Mutex::new(Stats {
                last: SenderStats::new(Duration::ZERO),
                day: SenderStats::new(STATS_DAY),
            })),
            running: Mutex::new(None),
        }
    }

    /// Delay between connect attempts.
    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// Upper bound of one connect attempt; a cycle budget below it wins.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Drain `spooler` on every tick from `tick_rx`, spending at most
    /// `timeout` per cycle. With `blackhole`, items are removed unsent.
    pub fn start(
        &self,
        spooler: Arc<dyn Spooler>,
        tick_rx: TickReceiver,
        timeout: Duration,
        blackhole: bool,
    ) -> SenderResult<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(SenderError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let task = SendTask {
            spooler,
            transport: Arc::clone(&self.transport),
            timeout,
            blackhole,
            connect_backoff: self.connect_backoff,
            connect_timeout: self.connect_timeout,
            status: self.status.clone(),
            stats: Arc::clone(&self.stats),
        };
        let handle = tokio::spawn(task.run(tick_rx, cancel.clone()));
        *running = Some(Running { cancel, handle });

        self.status.update("data-sender", "Idle");
        info!(timeout_secs = timeout.as_secs(), blackhole, "sender started");
        Ok(())
    }

    /// Stop the send loop, interrupting a cycle in progress.
    pub async fn stop(&self) -> SenderResult<()> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return Ok(());
        };
        running.cancel.cancel();
        let joined = running.handle.await;
        self.transport.lock().await.disconnect_once().await;
        self.status.update("data-sender", "Stopped");
        match joined {
            Ok(()) => {
                info!("sender stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "sender task failed");
                Err(SenderError::Task { reason: e.to_string() })
            }
        }
    }

    pub fn status(&self) -> StatusMap {
        let (last, day) = {
            let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            (stats.last.report_text(), stats.day.report_text())
        };
        self.status.update("data-sender-last", last);
        self.status.update("data-sender-1d", day);
        self.status.all()
    }

    /// Summary of the most recent cycle, if any.
    pub fn last_cycle(&self) -> Option<SentInfo> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).last.report()
    }
}

struct SendTask {
    spooler: Arc<dyn Spooler>,
    transport: Arc<AsyncMutex<Box<dyn Transport>>>,
    timeout: Duration,
    blackhole: bool,
    connect_backoff: Duration,
    connect_timeout: Duration,
    status: Status,
    stats: Arc<Mutex<Stats>>,
}

impl SendTask {
    async fn run(self, mut tick_rx: TickReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tick = tick_rx.recv() => {
                    if tick.is_none() {
                        debug!("sender tick channel closed");
                        break;
                    }
                }
            }

            let mut info = SentInfo::new(Utc::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.send(&mut info) => {
                    if let Err(e) = result {
                        error!(error = %e, "send cycle failed");
                        info.errs += 1;
                    }
                }
            }
            info.end = Utc::now();
            self.record(info);
            self.status.update("data-sender", "Idle");
        }
    }

    fn record(&self, info: SentInfo) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.last.add(info.clone());
        stats.day.add(info);
    }

    async fn send(&self, info: &mut SentInfo) -> SenderResult<()> {
        let started = Instant::now();
        let mut transport = self.transport.lock().await;

        if !self.blackhole && !self.connect(transport.as_mut(), info).await {
            return Ok(());
        }

        self.status.update("data-sender", "Sending");
        let files_cancel = CancellationToken::new();
        let _stop_files = files_cancel.clone().drop_guard();
        let mut files = self.spooler.files(files_cancel);

        while let Some(key) = files.recv().await {
            let elapsed = started.elapsed();
            if elapsed > self.timeout {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "send cycle timed out");
                info.timeouts += 1;
                break;
            }

            let data = match self.spooler.read(&key) {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %key, error = %e, "cannot read spool item");
                    info.errs += 1;
                    continue;
                }
            };

            if self.blackhole {
                debug!(key = %key, "blackhole: removing spool item");
                self.remove(&key, info);
                continue;
            }

            if data.is_empty() {
                warn!(key = %key, "removing empty spool item");
                self.remove(&key, info);
                continue;
            }

            let remaining = self.timeout.saturating_sub(elapsed);
            let sent_at = Instant::now();
            let response = match transport.send_bytes(&data, remaining).await {
                Ok(()) => transport.recv(remaining.min(RECV_TIMEOUT)).await,
                Err(e) => Err(e),
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(key = %key, error = %e, "send failed");
                    match e {
                        TransportError::Timeout { .. } => info.timeouts += 1,
                        _ => info.errs += 1,
                    }
                    transport.disconnect_once().await;
                    break;
                }
            };
            info.send_time += sent_at.elapsed();

            match response.code {
                200..=299 => {
                    info.bytes += data.len() as u64;
                    info.files += 1;
                    self.remove(&key, info);
                    if response.code == CODE_THROTTLED {
                        info!("collector is throttling, stopping send cycle");
                        break;
                    }
                }
                400..=499 => {
                    warn!(key = %key, code = response.code, error = %response.error, "collector rejected spool item");
                    info.bad_files += 1;
                    if let Err(e) = self.spooler.reject(&key) {
                        warn!(key = %key, error = %e, "cannot reject spool item, removing it");
                        self.remove(&key, info);
                    }
                }
                500..=599 => {
                    warn!(code = response.code, error = %response.error, "collector API error, stopping send cycle");
                    info.api_errs += 1;
                    break;
                }
                code => {
                    transport.disconnect_once().await;
                    return Err(SenderError::UnexpectedResponse {
                        code,
                        message: response.error,
                    });
                }
            }
        }

        transport.disconnect_once().await;
        Ok(())
    }

    /// Connect with retries. `false` aborts the cycle until the next tick.
    async fn connect(&self, transport: &mut dyn Transport, info: &mut SentInfo) -> bool {
        let connect_timeout = self.timeout.min(self.connect_timeout).max(Duration::from_secs(1));
        for attempt in 1..=CONNECT_ATTEMPTS {
            self.status.update("data-sender", "Connecting");
            match transport.connect_once(connect_timeout).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "cannot connect to collector");
                    if attempt == CONNECT_ATTEMPTS {
                        info.errs += 1;
                        return false;
                    }
                }
            }
            self.status.update("data-sender", "Waiting to reconnect");
            tokio::time::sleep(self.connect_backoff).await;
        }
        false
    }

    fn remove(&self, key: &str, info: &mut SentInfo) {
        if let Err(e) = self.spooler.remove(key) {
            warn!(key = %key, error = %e, "cannot remove spool item");
            info.errs += 1;
        }
    }
}
