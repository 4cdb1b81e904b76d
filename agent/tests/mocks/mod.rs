//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use qan_agent::data::spooler::{PurgeReport, Spooler};
use qan_agent::data::transport::Transport;
use qan_agent::error::{
    AnalyzerError, AnalyzerResult, InstanceResult, MysqlError, MysqlResult, SpoolResult, TransportError,
    TransportResult,
};
use qan_agent::instance::InstanceApi;
use qan_agent::mrms::{RestartMonitor, Subscription};
use qan_agent::mysql::{Connector, ConnectorFactory, MysqlQuery};
use qan_agent::proto::{MysqlInstance, Response, SpoolLimits, StatusMap};
use qan_agent::qan::{
    FilenameFn, Interval, IntervalIter, IntervalIterFactory, QanConfig, QanResult, RestartSender, Worker,
    WorkerFactory,
};
use qan_agent::ticker::{Clock, Tick, TickReceiver, TickSender};

/// Route library logs to the test harness; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn wait_for<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn test_instance(uuid: &str) -> MysqlInstance {
    MysqlInstance {
        uuid: uuid.to_string(),
        name: format!("db-{}", &uuid[..uuid.len().min(4)]),
        parent_uuid: String::new(),
        dsn: "user:pass@tcp(127.0.0.1:3306)/".to_string(),
        distro: String::new(),
        version: String::new(),
    }
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Default)]
pub struct TransportState {
    pub connect_fails: bool,
    pub connects: usize,
    pub disconnects: usize,
    pub responses: VecDeque<u16>,
    pub sent: Vec<Vec<u8>>,
    /// How long each send takes.
    pub send_delay: Duration,
    /// Timeout handed to each send.
    pub send_timeouts: Vec<Duration>,
}

/// Answers 200 unless told otherwise by `respond`.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, codes: &[u16]) {
        self.state.lock().unwrap().responses.extend(codes.iter().copied());
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().connect_fails = fail;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn delay_sends(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = delay;
    }

    pub fn send_timeouts(&self) -> Vec<Duration> {
        self.state.lock().unwrap().send_timeouts.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect_once(&mut self, _timeout: Duration) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_fails {
            return Err(TransportError::Connect {
                addr: "mock".to_string(),
                reason: "refused".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect_once(&mut self) {
        self.state.lock().unwrap().disconnects += 1;
    }

    async fn send_bytes(&mut self, data: &[u8], timeout: Duration) -> TransportResult<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.send_timeouts.push(timeout);
            state.send_delay
        };
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout {
                op: "send",
                secs: timeout.as_secs_f64(),
            });
        }
        tokio::time::sleep(delay).await;
        self.state.lock().unwrap().sent.push(data.to_vec());
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> TransportResult<Response> {
        let code = self.state.lock().unwrap().responses.pop_front().unwrap_or(200);
        Ok(Response {
            code,
            error: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Spooler

/// Keeps written reports in memory.
#[derive(Default)]
pub struct MockSpooler {
    pub writes: Mutex<Vec<(String, Vec<u8>)>>,
    pub written: Notify,
}

impl MockSpooler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl Spooler for MockSpooler {
    async fn write(&self, service: &str, data: Vec<u8>) -> SpoolResult<()> {
        self.writes.lock().unwrap().push((service.to_string(), data));
        self.written.notify_waiters();
        Ok(())
    }

    fn files(&self, _cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    fn read(&self, key: &str) -> SpoolResult<Vec<u8>> {
        Err(qan_agent::error::SpoolError::NotFound { key: key.to_string() })
    }

    fn remove(&self, _key: &str) -> SpoolResult<()> {
        Ok(())
    }

    fn reject(&self, _key: &str) -> SpoolResult<()> {
        Ok(())
    }

    fn purge(&self, _now: DateTime<Utc>, _limits: SpoolLimits) -> (usize, PurgeReport) {
        (0, PurgeReport::new())
    }

    fn status(&self) -> StatusMap {
        StatusMap::new()
    }
}

// ---------------------------------------------------------------------------
// Connector

#[derive(Default)]
pub struct ConnectorState {
    pub connect_fails: bool,
    pub set_fails: bool,
    pub connects: usize,
    pub closes: usize,
    pub globals: HashMap<String, String>,
    pub set_calls: Vec<Vec<MysqlQuery>>,
    pub uptime: i64,
    /// Held by the next `close`: (entered, release).
    pub close_gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

/// Every connector made by one factory shares this state.
#[derive(Clone)]
pub struct MockConnector {
    pub state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new(version: &str, version_comment: &str) -> Self {
        let mut state = ConnectorState::default();
        state.globals.insert("version".to_string(), version.to_string());
        state
            .globals
            .insert("version_comment".to_string(), version_comment.to_string());
        state
            .globals
            .insert("slow_query_log_file".to_string(), String::new());
        state.uptime = 100;
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn percona() -> Self {
        Self::new("5.6.24-72.2-log", "Percona Server (GPL), Release 72.2")
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().connect_fails = fail;
    }

    pub fn fail_set(&self, fail: bool) {
        self.state.lock().unwrap().set_fails = fail;
    }

    pub fn set_global(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .globals
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_uptime(&self, uptime: i64) {
        self.state.lock().unwrap().uptime = uptime;
    }

    /// Make the next `close` signal `entered` and wait for `release`.
    pub fn hold_next_close(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        self.state.lock().unwrap().close_gate = Some(gate.clone());
        gate
    }

    pub fn set_calls(&self) -> Vec<Vec<MysqlQuery>> {
        self.state.lock().unwrap().set_calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// `set` calls that contained `stmt`.
    pub fn count_stmt(&self, stmt: &str) -> usize {
        self.set_calls()
            .iter()
            .filter(|call| call.iter().any(|q| q.set == stmt))
            .count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&mut self, _tries: u32) -> MysqlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_fails {
            return Err(MysqlError::Connect {
                dsn: "mock".to_string(),
                reason: "refused".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.closes += 1;
            state.close_gate.take()
        };
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
    }

    async fn global_var_string(&mut self, name: &str) -> MysqlResult<Option<String>> {
        Ok(self.state.lock().unwrap().globals.get(name).cloned())
    }

    async fn global_var_number(&mut self, name: &str) -> MysqlResult<Option<f64>> {
        let value = self.state.lock().unwrap().globals.get(name).cloned();
        Ok(value.and_then(|v| v.parse().ok()))
    }

    async fn set(&mut self, queries: &[MysqlQuery]) -> MysqlResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.set_fails {
            return Err(MysqlError::Query {
                query: queries.first().map(|q| q.set.clone()).unwrap_or_default(),
                reason: "denied".to_string(),
            });
        }
        state.set_calls.push(queries.to_vec());
        Ok(())
    }

    async fn uptime(&mut self) -> MysqlResult<i64> {
        let state = self.state.lock().unwrap();
        if state.connect_fails {
            return Err(MysqlError::Query {
                query: "SHOW GLOBAL STATUS LIKE 'Uptime'".to_string(),
                reason: "gone away".to_string(),
            });
        }
        Ok(state.uptime)
    }

    fn dsn(&self) -> String {
        "mock".to_string()
    }
}

#[derive(Clone)]
pub struct MockConnectorFactory {
    pub conn: MockConnector,
    pub made: Arc<AtomicUsize>,
}

impl MockConnectorFactory {
    pub fn new(conn: MockConnector) -> Self {
        Self {
            conn,
            made: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ConnectorFactory for MockConnectorFactory {
    fn make(&self, _dsn: &str) -> Box<dyn Connector> {
        self.made.fetch_add(1, Ordering::SeqCst);
        Box::new(self.conn.clone())
    }
}

// ---------------------------------------------------------------------------
// Clock

/// Ticks only when told to.
#[derive(Default)]
pub struct MockClock {
    pub added: Mutex<Vec<(TickSender, u64, bool)>>,
    pub removed: AtomicUsize,
    pub eta: Mutex<f64>,
}

impl MockClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_eta(eta: f64) -> Arc<Self> {
        let clock = Self::default();
        *clock.eta.lock().unwrap() = eta;
        Arc::new(clock)
    }

    /// Send `tick` to every subscriber.
    pub async fn tick(&self, tick: Tick) {
        let subscribers: Vec<TickSender> = self.added.lock().unwrap().iter().map(|(tx, _, _)| tx.clone()).collect();
        for tx in subscribers {
            let _ = tx.send(tick).await;
        }
    }

    pub fn subscribers(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    pub fn periods(&self) -> Vec<(u64, bool)> {
        self.added.lock().unwrap().iter().map(|(_, p, s)| (*p, *s)).collect()
    }
}

impl Clock for MockClock {
    fn add(&self, tick_tx: TickSender, period_secs: u64, sync: bool) {
        self.added.lock().unwrap().push((tick_tx, period_secs, sync));
    }

    fn remove(&self, tick_tx: &TickSender) {
        self.added.lock().unwrap().retain(|(tx, _, _)| !tx.same_channel(tick_tx));
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn eta(&self, _tick_tx: &TickSender) -> f64 {
        *self.eta.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Restart monitor

#[derive(Default)]
pub struct MockRestartMonitor {
    pub subscribers: Mutex<Vec<(String, u64, RestartSender)>>,
    pub removed: Mutex<Vec<(String, u64)>>,
    next_id: AtomicU64,
}

impl MockRestartMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal a restart of `uuid` to every subscriber.
    pub async fn restart(&self, instance: &MysqlInstance) {
        let senders: Vec<RestartSender> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(uuid, _, _)| *uuid == instance.uuid)
            .map(|(_, _, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(instance.clone()).await;
        }
    }

    pub fn removed(&self) -> Vec<(String, u64)> {
        self.removed.lock().unwrap().clone()
    }
}

impl RestartMonitor for MockRestartMonitor {
    fn add(&self, instance: MysqlInstance) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().unwrap().push((instance.uuid, id, tx));
        Subscription { id, rx }
    }

    fn remove(&self, uuid: &str, id: u64) {
        self.subscribers.lock().unwrap().retain(|(u, i, _)| !(u == uuid && *i == id));
        self.removed.lock().unwrap().push((uuid.to_string(), id));
    }

    fn status(&self) -> StatusMap {
        StatusMap::new()
    }
}

// ---------------------------------------------------------------------------
// Interval iterator

#[derive(Default)]
pub struct IterCounters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub delivered: AtomicUsize,
}

/// Hands out intervals pushed by the test instead of reading a log file.
pub struct MockIntervalIter {
    rx: Option<mpsc::Receiver<Interval>>,
    counters: Arc<IterCounters>,
}

#[async_trait]
impl IntervalIter for MockIntervalIter {
    fn start(&mut self) {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&mut self) {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn next_interval(&mut self) -> Option<Interval> {
        let next = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };
        match next {
            Some(interval) => {
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                Some(interval)
            }
            None => std::future::pending().await,
        }
    }
}

pub struct MockIntervalIterFactory {
    rx: Mutex<Option<mpsc::Receiver<Interval>>>,
    pub counters: Arc<IterCounters>,
    pub tick_rxs: Mutex<Vec<TickReceiver>>,
    pub filename_fns: Mutex<Vec<FilenameFn>>,
}

impl MockIntervalIterFactory {
    /// The first iterator made reads from the returned sender.
    pub fn new() -> (Arc<Self>, mpsc::Sender<Interval>) {
        let (tx, rx) = mpsc::channel(8);
        let factory = Self {
            rx: Mutex::new(Some(rx)),
            counters: Arc::new(IterCounters::default()),
            tick_rxs: Mutex::new(Vec::new()),
            filename_fns: Mutex::new(Vec::new()),
        };
        (Arc::new(factory), tx)
    }

    pub fn delivered(&self) -> usize {
        self.counters.delivered.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    /// Next tick the analyzer put on its own tick channel.
    pub fn try_recv_tick(&self) -> Option<Tick> {
        let mut rxs = self.tick_rxs.lock().unwrap();
        rxs.iter_mut().find_map(|rx| rx.try_recv().ok())
    }
}

impl IntervalIterFactory for MockIntervalIterFactory {
    fn make(&self, filename: FilenameFn, tick_rx: TickReceiver) -> Box<dyn IntervalIter> {
        self.tick_rxs.lock().unwrap().push(tick_rx);
        self.filename_fns.lock().unwrap().push(filename);
        Box::new(MockIntervalIter {
            rx: self.rx.lock().unwrap().take(),
            counters: Arc::clone(&self.counters),
        })
    }
}

pub fn test_interval(number: u64) -> Interval {
    let start = Utc::now();
    Interval {
        number,
        start_time: start,
        stop_time: start + chrono::Duration::seconds(60),
        filename: "/var/lib/mysql/slow.log".to_string(),
        start_offset: number * 100,
        end_offset: (number + 1) * 100,
    }
}

// ---------------------------------------------------------------------------
// Worker

#[derive(Default)]
pub struct WorkerState {
    pub setups: AtomicUsize,
    pub runs: AtomicUsize,
    pub cleanups: AtomicUsize,
    /// When set, `run` waits for `release` before returning.
    pub block: AtomicBool,
    pub release: Notify,
    pub panic_in_run: AtomicBool,
    pub fail_run: AtomicBool,
    pub configs: Mutex<Vec<QanConfig>>,
}

pub struct MockWorker {
    state: Arc<WorkerState>,
}

#[async_trait]
impl Worker for MockWorker {
    async fn setup(&mut self, _interval: &Interval) -> AnalyzerResult<()> {
        self.state.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&mut self) -> AnalyzerResult<Option<QanResult>> {
        self.state.runs.fetch_add(1, Ordering::SeqCst);
        if self.state.block.load(Ordering::SeqCst) {
            self.state.release.notified().await;
        }
        if self.state.panic_in_run.load(Ordering::SeqCst) {
            panic!("worker exploded");
        }
        if self.state.fail_run.load(Ordering::SeqCst) {
            return Err(AnalyzerError::Worker {
                reason: "parse error".to_string(),
            });
        }
        Ok(Some(QanResult {
            rate_limit: 1,
            run_time: 0.1,
            ..QanResult::default()
        }))
    }

    async fn cleanup(&mut self) -> AnalyzerResult<()> {
        self.state.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let mut status = StatusMap::new();
        status.insert(
            "qan-worker".to_string(),
            format!("runs {}", self.state.runs.load(Ordering::SeqCst)),
        );
        status
    }

    fn set_config(&mut self, config: QanConfig) {
        self.state.configs.lock().unwrap().push(config);
    }
}

#[derive(Clone, Default)]
pub struct MockWorkerFactory {
    pub state: Arc<WorkerState>,
}

impl MockWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.state.cleanups.load(Ordering::SeqCst)
    }
}

impl WorkerFactory for MockWorkerFactory {
    fn make(&self, _name: &str, _config: &QanConfig, _conn: Box<dyn Connector>) -> Box<dyn Worker> {
        Box::new(MockWorker {
            state: Arc::clone(&self.state),
        })
    }
}

// ---------------------------------------------------------------------------
// Instance API

pub struct MockInstanceApi {
    /// `entry_link` answers `None` this many times first.
    pub link_after: AtomicUsize,
    pub link_calls: AtomicUsize,
    pub get_calls: Mutex<Vec<String>>,
    pub instances: Mutex<HashMap<String, MysqlInstance>>,
}

impl MockInstanceApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            link_after: AtomicUsize::new(0),
            link_calls: AtomicUsize::new(0),
            get_calls: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_instance(self: Arc<Self>, instance: MysqlInstance) -> Arc<Self> {
        self.instances.lock().unwrap().insert(instance.uuid.clone(), instance);
        self
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.get_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceApi for MockInstanceApi {
    fn entry_link(&self, _resource: &str) -> Option<String> {
        let call = self.link_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.link_after.load(Ordering::SeqCst) {
            return None;
        }
        Some("http://api.test/instances".to_string())
    }

    async fn get_instance(&self, url: &str) -> InstanceResult<Option<MysqlInstance>> {
        self.get_calls.lock().unwrap().push(url.to_string());
        let uuid = url.rsplit('/').next().unwrap_or_default();
        Ok(self.instances.lock().unwrap().get(uuid).cloned())
    }
}
