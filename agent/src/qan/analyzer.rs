//! Per-instance analyzer
//!
//! The analyzer's main loop only reacts to messages: the server became
//! configured, an interval closed, a worker finished, the server restarted,
//! or stop was requested. Configuring the server and running workers happen
//! in their own tasks so the loop never waits on I/O.
//!
//! ```text
//! Unconfigured -> ConfiguringMySQL -> Idle <-> RunningWorker
//!                        ^             |
//!                        +-- restart --+
//! any -> Stopping -> Stopped        main loop panic -> Crashed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::spooler::Spooler;
use crate::error::{AgentError, AnalyzerError, AnalyzerResult, MysqlError, Result};
use crate::instance::Repo;
use crate::mysql::{is_percona_family, server_info, Connector, ConnectorFactory, MysqlQuery};
use crate::proto::{MysqlInstance, StatusMap};
use crate::qan::mysql_config::mysql_commands;
use crate::qan::report::make_report;
use crate::qan::{
    Analyzer, AnalyzerFactory, CollectFrom, FilenameFn, Interval, IntervalIter, IntervalIterFactory,
    QanConfig, RestartReceiver, Worker, WorkerFactory, SERVICE_NAME,
};
use crate::status::Status;
use crate::ticker::{last_boundary, tick_channel, Clock, TickSender};

pub const CONFIGURE_BACKOFF: Duration = Duration::from_secs(5);
/// Beyond this many seconds to the first tick, a tick at the last boundary
/// is injected so the first report is not a whole interval away.
pub const SYNTHETIC_TICK_THRESHOLD: f64 = 60.0;
pub const WORKER_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    Unconfigured,
    ConfiguringMySQL,
    Idle,
    RunningWorker,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for AnalyzerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalyzerState::Unconfigured => "Unconfigured",
            AnalyzerState::ConfiguringMySQL => "Configuring MySQL",
            AnalyzerState::Idle => "Idle",
            AnalyzerState::RunningWorker => "Running worker",
            AnalyzerState::Stopping => "Stopping",
            AnalyzerState::Stopped => "Stopped",
            AnalyzerState::Crashed => "Crashed",
        };
        f.write_str(s)
    }
}

/// State shared by the analyzer handle and its tasks.
struct Shared {
    name: String,
    status_key: String,
    last_interval_key: String,
    status: Status,
    state: Mutex<AnalyzerState>,
    config: Mutex<QanConfig>,
    instance: Mutex<MysqlInstance>,
    worker_status: Mutex<StatusMap>,
    /// Start queries applied and not yet undone.
    mysql_started: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: AnalyzerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.status.update(&self.status_key, state.to_string());
    }

    fn state(&self) -> AnalyzerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> QanConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Collaborators cloned into the analyzer's tasks.
#[derive(Clone)]
struct Deps {
    clock: Arc<dyn Clock>,
    spooler: Arc<dyn Spooler>,
    conn: Arc<AsyncMutex<Box<dyn Connector>>>,
    repo: Arc<Repo>,
    tick_tx: TickSender,
    configure_backoff: Duration,
}

struct LoopParts {
    iter: Box<dyn IntervalIter>,
    worker: Box<dyn Worker>,
    restart_rx: RestartReceiver,
}

pub struct RealAnalyzer {
    shared: Arc<Shared>,
    deps: Deps,
    parts: Mutex<Option<LoopParts>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RealAnalyzer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: QanConfig,
        name: impl Into<String>,
        instance: MysqlInstance,
        restart_rx: RestartReceiver,
        conn: Box<dyn Connector>,
        iter: Box<dyn IntervalIter>,
        worker: Box<dyn Worker>,
        tick_tx: TickSender,
        clock: Arc<dyn Clock>,
        spooler: Arc<dyn Spooler>,
        repo: Arc<Repo>,
    ) -> Self {
        let name = name.into();
        let status_key = format!("{}-analyzer-{}", SERVICE_NAME, name);
        let last_interval_key = format!("{}-last-interval", status_key);
        let status = Status::new(&[status_key.as_str(), last_interval_key.as_str()]);
        let shared = Arc::new(Shared {
            name,
            status_key,
            last_interval_key,
            status,
            state: Mutex::new(AnalyzerState::Unconfigured),
            config: Mutex::new(config),
            instance: Mutex::new(instance),
            worker_status: Mutex::new(StatusMap::new()),
            mysql_started: AtomicBool::new(false),
        });
        shared.set_state(AnalyzerState::Unconfigured);
        Self {
            shared,
            deps: Deps {
                clock,
                spooler,
                conn: Arc::new(AsyncMutex::new(conn)),
                repo,
                tick_tx,
                configure_backoff: CONFIGURE_BACKOFF,
            },
            parts: Mutex::new(Some(LoopParts {
                iter,
                worker,
                restart_rx,
            })),
            running: Mutex::new(None),
        }
    }

    /// Delay between attempts to configure the server.
    pub fn with_configure_backoff(mut self, backoff: Duration) -> Self {
        self.deps.configure_backoff = backoff;
        self
    }

    pub fn state(&self) -> AnalyzerState {
        self.shared.state()
    }
}

#[async_trait]
impl Analyzer for RealAnalyzer {
    async fn start(&self) -> AnalyzerResult<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(AnalyzerError::AlreadyRunning {
                name: self.shared.name.clone(),
            });
        }
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AnalyzerError::AlreadyRunning {
                name: self.shared.name.clone(),
            })?;

        let interval = self.shared.config().interval;
        self.deps.clock.add(self.deps.tick_tx.clone(), interval, true);

        let cancel = CancellationToken::new();
        let main = MainLoop {
            shared: Arc::clone(&self.shared),
            deps: self.deps.clone(),
        };
        let inner = tokio::spawn(main.run(parts, cancel.clone()));
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.await {
                if e.is_panic() {
                    error!(analyzer = %shared.name, "analyzer crashed");
                    shared.set_state(AnalyzerState::Crashed);
                }
            }
        });
        *running = Some((cancel, handle));
        info!(analyzer = %self.shared.name, interval, "analyzer started");
        Ok(())
    }

    async fn stop(&self) -> AnalyzerResult<()> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((cancel, handle)) = running else {
            return Ok(());
        };
        self.deps.clock.remove(&self.deps.tick_tx);
        cancel.cancel();
        let _ = handle.await;
        info!(analyzer = %self.shared.name, "analyzer stopped");
        if self.shared.state() == AnalyzerState::Crashed {
            return Err(AnalyzerError::Worker {
                reason: format!("analyzer {} crashed", self.shared.name),
            });
        }
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let worker = self.shared.worker_status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        self.shared.status.merge(&[worker])
    }

    fn config(&self) -> QanConfig {
        self.shared.config()
    }

    fn set_config(&self, config: QanConfig) {
        *self.shared.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn name(&self) -> String {
        self.shared.name.clone()
    }
}

/// How a worker run ended.
#[derive(Debug)]
enum WorkerOutcome {
    Reported { number: u64, run_time: Duration },
    NoResult { number: u64 },
    Failed { number: u64, reason: String },
    Crashed,
    Cancelled,
}

struct MainLoop {
    shared: Arc<Shared>,
    deps: Deps,
}

impl MainLoop {
    async fn run(self, parts: LoopParts, cancel: CancellationToken) {
        let LoopParts {
            mut iter,
            worker,
            mut restart_rx,
        } = parts;
        let worker = Arc::new(AsyncMutex::new(worker));
        let (configured_tx, mut configured_rx) = mpsc::channel::<()>(1);
        let (done_tx, mut done_rx) = mpsc::channel::<WorkerOutcome>(1);

        let mut configuring = Some(self.spawn_configure(configured_tx.clone()));
        let mut configured = false;
        let mut ever_configured = false;
        let mut busy: Option<AbortHandle> = None;
        let mut restart_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(()) = configured_rx.recv() => {
                    configuring = None;
                    configured = true;
                    info!(analyzer = %self.shared.name, "MySQL configured");
                    if busy.is_none() {
                        self.shared.set_state(AnalyzerState::Idle);
                    }
                    iter.start();
                    if !ever_configured {
                        ever_configured = true;
                        self.maybe_synthetic_tick();
                    }
                }

                interval = iter.next_interval() => {
                    let Some(interval) = interval else {
                        warn!(analyzer = %self.shared.name, "interval iterator closed");
                        break;
                    };
                    if !configured {
                        debug!(analyzer = %self.shared.name, number = interval.number, "MySQL not configured, skipping interval");
                    } else if busy.is_some() {
                        warn!(
                            analyzer = %self.shared.name,
                            number = interval.number,
                            "worker still running, skipping interval"
                        );
                    } else {
                        busy = Some(self.spawn_worker(Arc::clone(&worker), interval, done_tx.clone()));
                        self.shared.set_state(AnalyzerState::RunningWorker);
                    }
                }

                Some(outcome) = done_rx.recv() => {
                    busy = None;
                    self.record_outcome(outcome);
                    if configured {
                        self.shared.set_state(AnalyzerState::Idle);
                    }
                }

                restart = restart_rx.recv(), if restart_open => match restart {
                    Some(_) if configured => {
                        info!(analyzer = %self.shared.name, "MySQL restarted, reconfiguring");
                        configured = false;
                        configuring = Some(self.spawn_configure(configured_tx.clone()));
                    }
                    Some(_) => debug!(analyzer = %self.shared.name, "restart while configuring, ignored"),
                    None => restart_open = false,
                },
            }
        }

        self.shared.set_state(AnalyzerState::Stopping);

        if let Some(abort) = busy {
            match tokio::time::timeout(WORKER_STOP_GRACE, done_rx.recv()).await {
                Ok(Some(outcome)) => self.record_outcome(outcome),
                _ => {
                    warn!(analyzer = %self.shared.name, "worker did not finish, aborting it");
                    abort.abort();
                }
            }
        }

        iter.stop().await;

        // The configure task may have applied the start queries after stop
        // was requested; only its own flag tells.
        if let Some((cancel, handle)) = configuring {
            cancel.cancel();
            let _ = handle.await;
        }
        while configured_rx.try_recv().is_ok() {
            configured = true;
        }
        if configured || self.shared.mysql_started.load(Ordering::SeqCst) {
            self.stop_mysql().await;
        }

        self.shared.set_state(AnalyzerState::Stopped);
    }

    fn maybe_synthetic_tick(&self) {
        let eta = self.deps.clock.eta(&self.deps.tick_tx);
        if eta <= SYNTHETIC_TICK_THRESHOLD {
            return;
        }
        let interval = self.shared.config().interval;
        let tick = last_boundary(Utc::now(), interval);
        debug!(analyzer = %self.shared.name, eta, tick = %tick, "sending synthetic tick");
        if let Err(e) = self.deps.tick_tx.try_send(tick) {
            warn!(analyzer = %self.shared.name, error = %e, "cannot send synthetic tick");
        }
    }

    fn record_outcome(&self, outcome: WorkerOutcome) {
        let text = match outcome {
            WorkerOutcome::Reported { number, run_time } => {
                format!("#{} reported in {}", number, crate::fmt::format_duration(run_time))
            }
            WorkerOutcome::NoResult { number } => format!("#{} no result", number),
            WorkerOutcome::Failed { number, reason } => format!("#{} failed: {}", number, reason),
            WorkerOutcome::Crashed => "worker crashed".to_string(),
            WorkerOutcome::Cancelled => "worker cancelled".to_string(),
        };
        self.shared.status.update(&self.shared.last_interval_key, text);
    }

    fn spawn_configure(&self, configured_tx: mpsc::Sender<()>) -> (CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let task = Configurer {
            shared: Arc::clone(&self.shared),
            deps: self.deps.clone(),
        };
        let handle = tokio::spawn(task.run(cancel.clone(), configured_tx));
        (cancel, handle)
    }

    fn spawn_worker(
        &self,
        worker: Arc<AsyncMutex<Box<dyn Worker>>>,
        interval: Interval,
        done_tx: mpsc::Sender<WorkerOutcome>,
    ) -> AbortHandle {
        let run = WorkerRun {
            shared: Arc::clone(&self.shared),
            spooler: Arc::clone(&self.deps.spooler),
        };
        let handle = tokio::spawn(run.run(worker, interval));
        let abort = handle.abort_handle();
        let name = self.shared.name.clone();
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!(analyzer = %name, "worker crashed");
                    WorkerOutcome::Crashed
                }
                Err(_) => WorkerOutcome::Cancelled,
            };
            let _ = done_tx.send(outcome).await;
        });
        abort
    }

    /// Best effort, single attempt.
    async fn stop_mysql(&self) {
        let stop = self.shared.config().stop;
        if stop.is_empty() {
            return;
        }
        let mut conn = self.deps.conn.lock().await;
        if let Err(e) = conn.connect(1).await {
            warn!(analyzer = %self.shared.name, error = %e, "cannot connect to run stop queries");
            return;
        }
        match conn.set(&stop).await {
            Ok(()) => self.shared.mysql_started.store(false, Ordering::SeqCst),
            Err(e) => warn!(analyzer = %self.shared.name, error = %e, "stop queries failed"),
        }
        conn.close().await;
    }
}

struct Configurer {
    shared: Arc<Shared>,
    deps: Deps,
}

impl Configurer {
    /// Retry until configured or cancelled.
    async fn run(self, cancel: CancellationToken, configured_tx: mpsc::Sender<()>) {
        loop {
            self.shared.set_state(AnalyzerState::ConfiguringMySQL);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                attempt = self.configure_once() => attempt,
            };
            match attempt {
                Ok(()) => {
                    let _ = configured_tx.send(()).await;
                    return;
                }
                Err(e) => {
                    warn!(analyzer = %self.shared.name, error = %e, "cannot configure MySQL, will retry");
                    self.shared.status.update(
                        &self.shared.status_key,
                        format!("{}: {}", AnalyzerState::ConfiguringMySQL, e),
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.deps.configure_backoff) => {}
            }
        }
    }

    async fn configure_once(&self) -> Result<()> {
        let mut conn = self.deps.conn.lock().await;
        conn.connect(1).await?;
        let result = self.apply(&mut **conn).await;
        conn.close().await;
        let (distro, version) = result?;
        self.refresh_instance(distro, version);
        Ok(())
    }

    async fn apply(&self, conn: &mut dyn Connector) -> Result<(String, String)> {
        let (distro, version) = server_info(conn).await?;
        let mut config = self.shared.config();

        if config.collect_from == CollectFrom::Slowlog && is_percona_family(&distro) {
            if let Some(size) = conn.global_var_number("max_slowlog_size").await? {
                if size > 0.0 {
                    info!(analyzer = %self.shared.name, size, "taking over slow log rotation");
                    config.max_slow_log_size = size as u64;
                    conn.set(&[MysqlQuery::set("SET GLOBAL max_slowlog_size = 0")]).await?;
                }
            }
        }

        let (start, stop, rate_limit) = mysql_commands(&distro, &version, &config)?;
        if rate_limit != config.rate_limit {
            warn!(
                analyzer = %self.shared.name,
                requested = config.rate_limit,
                effective = rate_limit,
                "rate limit not supported by this server"
            );
        }
        config.start = start;
        config.stop = stop;
        config.rate_limit = rate_limit;

        conn.set(&config.start).await?;
        *self.shared.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        self.shared.mysql_started.store(true, Ordering::SeqCst);
        Ok((distro, version))
    }

    fn refresh_instance(&self, distro: String, version: String) {
        let updated = {
            let mut instance = self.shared.instance.lock().unwrap_or_else(|e| e.into_inner());
            if instance.distro == distro && instance.version == version {
                return;
            }
            info!(
                analyzer = %self.shared.name,
                distro = %distro,
                version = %version,
                "instance distro or version changed"
            );
            instance.distro = distro;
            instance.version = version;
            instance.clone()
        };
        if let Err(e) = self.deps.repo.update(updated) {
            warn!(analyzer = %self.shared.name, error = %e, "cannot update instance record");
        }
    }
}

struct WorkerRun {
    shared: Arc<Shared>,
    spooler: Arc<dyn Spooler>,
}

impl WorkerRun {
    async fn run(self, worker: Arc<AsyncMutex<Box<dyn Worker>>>, interval: Interval) -> WorkerOutcome {
        let number = interval.number;
        let started = Instant::now();
        let config = self.shared.config();

        let result = {
            let mut worker = worker.lock().await;
            worker.set_config(config.clone());
            let result = match worker.setup(&interval).await {
                Ok(()) => worker.run().await,
                Err(e) => Err(e),
            };
            if let Err(e) = worker.cleanup().await {
                warn!(analyzer = %self.shared.name, number, error = %e, "worker cleanup failed");
            }
            *self.shared.worker_status.lock().unwrap_or_else(|e| e.into_inner()) = worker.status();
            result
        };

        let result = match result {
            Ok(Some(result)) => result,
            Ok(None) => return WorkerOutcome::NoResult { number },
            Err(e) => {
                warn!(analyzer = %self.shared.name, number, error = %e, "worker failed");
                return WorkerOutcome::Failed {
                    number,
                    reason: e.to_string(),
                };
            }
        };
        if !result.error.is_empty() {
            warn!(analyzer = %self.shared.name, number, error = %result.error, "worker reported an error");
        }

        let report = make_report(&config, &interval, result);
        let written = match serde_json::to_vec(&report) {
            Ok(bytes) => self.spooler.write(SERVICE_NAME, bytes).await.map_err(AgentError::from),
            Err(e) => Err(AgentError::from(e)),
        };
        match written {
            Ok(()) => WorkerOutcome::Reported {
                number,
                run_time: started.elapsed(),
            },
            Err(e) => {
                warn!(analyzer = %self.shared.name, number, error = %e, "cannot spool report");
                WorkerOutcome::Failed {
                    number,
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Builds [`RealAnalyzer`]s wired to the shared clock, spooler and repo.
pub struct RealAnalyzerFactory {
    clock: Arc<dyn Clock>,
    spooler: Arc<dyn Spooler>,
    repo: Arc<Repo>,
    connectors: Arc<dyn ConnectorFactory>,
    iters: Arc<dyn IntervalIterFactory>,
    workers: Arc<dyn WorkerFactory>,
    configure_backoff: Duration,
}

impl RealAnalyzerFactory {
    pub fn new(
        clock: Arc<dyn Clock>,
        spooler: Arc<dyn Spooler>,
        repo: Arc<Repo>,
        connectors: Arc<dyn ConnectorFactory>,
        iters: Arc<dyn IntervalIterFactory>,
        workers: Arc<dyn WorkerFactory>,
    ) -> Self {
        Self {
            clock,
            spooler,
            repo,
            connectors,
            iters,
            workers,
            configure_backoff: CONFIGURE_BACKOFF,
        }
    }

    pub fn with_configure_backoff(mut self, backoff: Duration) -> Self {
        self.configure_backoff = backoff;
        self
    }

    fn filename_fn(&self, config: &QanConfig, dsn: &str) -> FilenameFn {
        if config.collect_from == CollectFrom::Perfschema {
            return Arc::new(|| async { Ok::<_, AnalyzerError>(String::new()) }.boxed());
        }
        let conn = Arc::new(AsyncMutex::new(self.connectors.make(dsn)));
        Arc::new(move || {
            let conn = Arc::clone(&conn);
            async move {
                let mut conn = conn.lock().await;
                conn.connect(1).await.map_err(interval_error)?;
                let file = conn.global_var_string("slow_query_log_file").await;
                conn.close().await;
                file.map_err(interval_error)?.ok_or_else(|| AnalyzerError::Interval {
                    reason: "slow_query_log_file is not set".to_string(),
                })
            }
            .boxed()
        })
    }
}

fn interval_error(e: MysqlError) -> AnalyzerError {
    AnalyzerError::Interval { reason: e.to_string() }
}

impl AnalyzerFactory for RealAnalyzerFactory {
    fn make(
        &self,
        config: QanConfig,
        name: String,
        instance: MysqlInstance,
        restart_rx: RestartReceiver,
    ) -> Box<dyn Analyzer> {
        let (tick_tx, tick_rx) = tick_channel();
        let iter = self.iters.make(self.filename_fn(&config, &instance.dsn), tick_rx);
        let worker = self
            .workers
            .make(&name, &config, self.connectors.make(&instance.dsn));
        let conn = self.connectors.make(&instance.dsn);
        let analyzer = RealAnalyzer::new(
            config,
            name,
            instance,
            restart_rx,
            conn,
            iter,
            worker,
            tick_tx,
            Arc::clone(&self.clock),
            Arc::clone(&self.spooler),
            Arc::clone(&self.repo),
        )
        .with_configure_backoff(self.configure_backoff);
        Box::new(analyzer)
    }
}
