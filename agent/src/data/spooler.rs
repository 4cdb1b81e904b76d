//! Durable report spool
//!
//! Reports are serialized, wrapped in a [`Data`] envelope and written to one
//! file per report under the spool directory. A single background task owns
//! every disk write and the periodic purge; producers only enqueue onto a
//! bounded channel and give up after a short timeout instead of blocking.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::serializer::Serializer;
use crate::error::{SpoolError, SpoolResult};
use crate::fmt::format_bytes;
use crate::proto::{Data, SpoolLimits, StatusMap, PROTOCOL_VERSION};
use crate::status::Status;
use crate::ticker::TickReceiver;

pub const WRITE_QUEUE_SIZE: usize = 100;
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
pub const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const CONTENT_TYPE_JSON: &str = "application/json";

pub const REASON_PURGED: &str = "purged";
pub const REASON_AGE: &str = "age";
pub const REASON_SIZE: &str = "size";
pub const REASON_FILES: &str = "files";

const TMP_SUFFIX: &str = ".tmp";

/// Keys removed by a purge, by reason. Always holds all four reasons.
pub type PurgeReport = HashMap<String, Vec<String>>;

/// Local store of reports waiting to be sent.
#[async_trait]
pub trait Spooler: Send + Sync {
    /// Serialize, wrap and enqueue `data`. Fails with [`SpoolError::Timeout`]
    /// if the write queue stays full for longer than [`WRITE_TIMEOUT`].
    async fn write(&self, service: &str, data: Vec<u8>) -> SpoolResult<()>;

    /// Stored keys, oldest first. Enumeration stops when `cancel` fires or
    /// the receiver is dropped.
    fn files(&self, cancel: CancellationToken) -> mpsc::Receiver<String>;

    /// Raw envelope bytes of `key`.
    fn read(&self, key: &str) -> SpoolResult<Vec<u8>>;

    fn remove(&self, key: &str) -> SpoolResult<()>;

    /// Move `key` to the trash directory.
    fn reject(&self, key: &str) -> SpoolResult<()>;

    /// Evict items per `limits`; see [`SpoolLimits`] for the all-zero case.
    fn purge(&self, now: DateTime<Utc>, limits: SpoolLimits) -> (usize, PurgeReport);

    fn status(&self) -> StatusMap;
}

/// `<service>_<unix-nanos>`
pub fn make_key(service: &str, nanos: i64) -> String {
    format!("{}_{}", service, nanos)
}

/// Split a key into service and timestamp.
pub fn parse_key(key: &str) -> SpoolResult<(&str, i64)> {
    let invalid = || SpoolError::InvalidKey { key: key.to_string() };
    let (service, ts) = key.rsplit_once('_').ok_or_else(invalid)?;
    if service.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let nanos = ts.parse::<i64>().map_err(|_| invalid())?;
    Ok((service, nanos))
}

#[derive(Debug, Clone, Copy)]
struct SpoolEntry {
    nanos: i64,
    size: u64,
}

#[derive(Debug, Default)]
struct SpoolState {
    files: HashMap<String, SpoolEntry>,
    size: u64,
}

impl SpoolState {
    fn insert(&mut self, key: String, entry: SpoolEntry) {
        self.size += entry.size;
        if let Some(old) = self.files.insert(key, entry) {
            self.size -= old.size;
        }
    }

    fn forget(&mut self, key: &str) {
        if let Some(old) = self.files.remove(key) {
            self.size -= old.size;
        }
    }

    fn oldest(&self) -> Option<i64> {
        self.files.values().map(|e| e.nanos).min()
    }

    /// Keys sorted by timestamp, oldest first.
    fn sorted_keys(&self) -> Vec<(String, SpoolEntry)> {
        let mut keys: Vec<(String, SpoolEntry)> =
            self.files.iter().map(|(k, e)| (k.clone(), *e)).collect();
        keys.sort_by(|a, b| a.1.nanos.cmp(&b.1.nanos).then_with(|| a.0.cmp(&b.0)));
        keys
    }
}

struct WriteItem {
    key: String,
    nanos: i64,
    bytes: Vec<u8>,
}

struct Running {
    write_tx: mpsc::Sender<WriteItem>,
    serializer: Arc<dyn Serializer>,
    cancel: CancellationToken,
    handle: JoinHandle<Option<TickReceiver>>,
}

/// File-per-report spooler.
pub struct DiskSpooler {
    dir: PathBuf,
    trash_dir: PathBuf,
    hostname: String,
    state: Arc<Mutex<SpoolState>>,
    limits: Arc<Mutex<SpoolLimits>>,
    purge_tick: Mutex<Option<TickReceiver>>,
    purge_interval: Duration,
    running: Mutex<Option<Running>>,
    last_nanos: AtomicI64,
    status: Status,
}

impl DiskSpooler {
    pub fn new(dir: impl Into<PathBuf>, hostname: impl Into<String>, limits: SpoolLimits) -> Self {
        let dir = dir.into();
        let trash_dir = dir.join(crate::basedir::TRASH_DIR);
        Self {
            dir,
            trash_dir,
            hostname: hostname.into(),
            state: Arc::new(Mutex::new(SpoolState::default())),
            limits: Arc::new(Mutex::new(limits)),
            purge_tick: Mutex::new(None),
            purge_interval: PURGE_INTERVAL,
            running: Mutex::new(None),
            last_nanos: AtomicI64::new(0),
            status: Status::new(&["data-spooler"]),
        }
    }

    /// Purge on ticks from `rx` instead of the internal 15 minute timer.
    pub fn with_purge_tick(self, rx: TickReceiver) -> Self {
        *self.purge_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    pub fn set_limits(&self, limits: SpoolLimits) {
        *self.limits.lock().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    pub fn limits(&self) -> SpoolLimits {
        *self.limits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Number of items on disk.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).files.len()
    }

    /// Total bytes on disk.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).size
    }

    /// Scan the spool directory and start the writer task.
    pub fn start(&self, serializer: Box<dyn Serializer>) -> SpoolResult<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(SpoolError::AlreadyRunning);
        }

        for dir in [&self.dir, &self.trash_dir] {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let scanned = scan_dir(&self.dir, true)?;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = SpoolState::default();
            for (key, entry) in scanned {
                state.insert(key, entry);
            }
            info!(
                dir = %self.dir.display(),
                count = state.files.len(),
                size = state.size,
                "spool opened"
            );
        }

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let cancel = CancellationToken::new();
        let purge_tick = self.purge_tick.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = WriterTask {
            dir: self.dir.clone(),
            state: Arc::clone(&self.state),
            limits: Arc::clone(&self.limits),
            status: self.status.clone(),
            purge_interval: self.purge_interval,
        };
        let handle = tokio::spawn(task.run(write_rx, purge_tick, cancel.clone()));

        *running = Some(Running {
            write_tx,
            serializer: Arc::from(serializer),
            cancel,
            handle,
        });
        self.status.update("data-spooler", "Idle");
        Ok(())
    }

    /// Flush queued writes and stop the writer task.
    pub async fn stop(&self) -> SpoolResult<()> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return Ok(());
        };
        running.cancel.cancel();
        drop(running.write_tx);
        match running.handle.await {
            Ok(purge_tick) => {
                *self.purge_tick.lock().unwrap_or_else(|e| e.into_inner()) = purge_tick;
            }
            Err(e) => error!(error = %e, "spool writer task failed"),
        }
        self.status.update("data-spooler", "Stopped");
        info!("spool stopped");
        Ok(())
    }

    fn next_nanos(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self
                .last_nanos
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn path_of(&self, key: &str) -> SpoolResult<PathBuf> {
        parse_key(key)?;
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl Spooler for DiskSpooler {
    async fn write(&self, service: &str, data: Vec<u8>) -> SpoolResult<()> {
        let (write_tx, serializer) = {
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            let running = running.as_ref().ok_or(SpoolError::NotRunning)?;
            (running.write_tx.clone(), Arc::clone(&running.serializer))
        };

        let payload = serializer.to_bytes(&data)?;
        let nanos = self.next_nanos();
        let envelope = Data {
            protocol_version: PROTOCOL_VERSION.to_string(),
            created: Utc.timestamp_nanos(nanos),
            hostname: self.hostname.clone(),
            service: service.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: serializer.encoding().to_string(),
            data: payload,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| SpoolError::Encode { reason: e.to_string() })?;
        let item = WriteItem {
            key: make_key(service, nanos),
            nanos,
            bytes,
        };

        match write_tx.send_timeout(item, WRITE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => {
                warn!(key = %item.key, "spool write queue full, dropping report");
                Err(SpoolError::Timeout)
            }
            Err(SendTimeoutError::Closed(_)) => Err(SpoolError::NotRunning),
        }
    }

    fn files(&self, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let keys = self.state.lock().unwrap_or_else(|e| e.into_inner()).sorted_keys();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for (key, _) in keys {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(key) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }

    fn read(&self, key: &str) -> SpoolResult<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                // Gone from disk, e.g. purged before the writer indexed it.
                self.state.lock().unwrap_or_else(|e| e.into_inner()).forget(key);
                SpoolError::NotFound { key: key.to_string() }
            }
            _ => io_error(&path, e),
        })
    }

    fn remove(&self, key: &str) -> SpoolResult<()> {
        let path = self.path_of(key)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path, e)),
        }
        state.forget(key);
        Ok(())
    }

    fn reject(&self, key: &str) -> SpoolResult<()> {
        let path = self.path_of(key)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.trash_dir).map_err(|e| io_error(&self.trash_dir, e))?;
        fs::rename(&path, self.trash_dir.join(key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SpoolError::NotFound { key: key.to_string() },
            _ => io_error(&path, e),
        })?;
        state.forget(key);
        warn!(key = %key, "spool item rejected to trash");
        Ok(())
    }

    fn purge(&self, now: DateTime<Utc>, limits: SpoolLimits) -> (usize, PurgeReport) {
        purge_dir(&self.dir, &self.state, &self.status, now, limits)
    }

    fn status(&self) -> StatusMap {
        let (count, size, oldest) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.files.len(), state.size, state.oldest())
        };
        self.status.update("data-spooler-count", count.to_string());
        self.status.update("data-spooler-size", format_bytes(size));
        let oldest = oldest
            .map(|n| Utc.timestamp_nanos(n).to_rfc3339())
            .unwrap_or_default();
        self.status.update("data-spooler-oldest", oldest);
        self.status.all()
    }
}

struct WriterTask {
    dir: PathBuf,
    state: Arc<Mutex<SpoolState>>,
    limits: Arc<Mutex<SpoolLimits>>,
    status: Status,
    purge_interval: Duration,
}

impl WriterTask {
    async fn run(
        self,
        mut write_rx: mpsc::Receiver<WriteItem>,
        mut purge_tick: Option<TickReceiver>,
        cancel: CancellationToken,
    ) -> Option<TickReceiver> {
        let mut purge_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.purge_interval,
            self.purge_interval,
        );
        debug!("spool writer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = write_rx.recv() => match item {
                    Some(item) => self.write_file(item),
                    None => break,
                },
                _ = purge_timer.tick(), if purge_tick.is_none() => self.purge(Utc::now()),
                tick = recv_tick(&mut purge_tick), if purge_tick.is_some() => match tick {
                    Some(at) => self.purge(at),
                    None => purge_tick = None,
                },
            }
        }

        // Queued reports are flushed, not lost.
        write_rx.close();
        while let Some(item) = write_rx.recv().await {
            self.write_file(item);
        }
        debug!("spool writer stopped");
        purge_tick
    }

    fn write_file(&self, item: WriteItem) {
        self.status.update("data-spooler", format!("Writing {}", item.key));
        let path = self.dir.join(&item.key);
        let tmp = self.dir.join(format!("{}{}", item.key, TMP_SUFFIX));
        let size = item.bytes.len() as u64;
        let written = fs::write(&tmp, &item.bytes).and_then(|_| fs::rename(&tmp, &path));
        match written {
            Ok(()) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.insert(item.key, SpoolEntry { nanos: item.nanos, size });
            }
            Err(e) => {
                error!(key = %item.key, error = %e, "cannot write spool file");
                let _ = fs::remove_file(&tmp);
            }
        }
        self.status.update("data-spooler", "Idle");
    }

    fn purge(&self, now: DateTime<Utc>) {
        let limits = *self.limits.lock().unwrap_or_else(|e| e.into_inner());
        if limits.is_purge_all() {
            // Periodic purge never wipes the spool.
            return;
        }
        purge_dir(&self.dir, &self.state, &self.status, now, limits);
    }
}

async fn recv_tick(rx: &mut Option<TickReceiver>) -> Option<DateTime<Utc>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn purge_dir(
    dir: &Path,
    state: &Mutex<SpoolState>,
    status: &Status,
    now: DateTime<Utc>,
    limits: SpoolLimits,
) -> (usize, PurgeReport) {
    let mut report: PurgeReport = [REASON_PURGED, REASON_AGE, REASON_SIZE, REASON_FILES]
        .iter()
        .map(|r| (r.to_string(), Vec::new()))
        .collect();

    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    status.update("data-spooler", "Purging");

    let mut entries = match scan_dir(dir, false) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "cannot scan spool for purge");
            status.update("data-spooler", "Idle");
            return (0, report);
        }
    };
    entries.sort_by(|a, b| b.1.nanos.cmp(&a.1.nanos).then_with(|| b.0.cmp(&a.0)));

    let purge_all = limits.is_purge_all();
    let now_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let max_age_nanos = i64::try_from(limits.max_age)
        .unwrap_or(i64::MAX)
        .saturating_mul(1_000_000_000);
    let mut total_size: u64 = 0;
    let mut total_count: u64 = 0;
    let mut removed = 0;
    let mut kept = SpoolState::default();

    for (key, entry) in entries {
        total_size += entry.size;
        total_count += 1;

        let reason = if purge_all {
            Some(REASON_PURGED)
        } else if limits.max_age > 0 && now_nanos.saturating_sub(entry.nanos) > max_age_nanos {
            Some(REASON_AGE)
        } else if limits.max_size > 0 && total_size > limits.max_size {
            Some(REASON_SIZE)
        } else if limits.max_files > 0 && total_count > limits.max_files {
            Some(REASON_FILES)
        } else {
            None
        };

        match reason {
            None => kept.insert(key, entry),
            Some(reason) => match fs::remove_file(dir.join(&key)) {
                Ok(()) => {
                    removed += 1;
                    if let Some(keys) = report.get_mut(reason) {
                        keys.push(key);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "cannot purge spool file");
                    kept.insert(key, entry);
                }
            },
        }
    }

    *state = kept;
    status.update("data-spooler", "Idle");
    if removed > 0 {
        info!(
            removed,
            purged = report[REASON_PURGED].len(),
            age = report[REASON_AGE].len(),
            size = report[REASON_SIZE].len(),
            files = report[REASON_FILES].len(),
            "spool purged"
        );
    }
    (removed, report)
}

/// List valid spool files in `dir`. Malformed names are erased; with
/// `clean_tmp` leftover partial writes are erased too.
fn scan_dir(dir: &Path, clean_tmp: bool) -> SpoolResult<Vec<(String, SpoolEntry)>> {
    let mut found = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat spool file");
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            erase(&path);
            continue;
        };
        if name.ends_with(TMP_SUFFIX) {
            if clean_tmp {
                erase(&path);
            }
            continue;
        }
        match parse_key(&name) {
            Ok((_, nanos)) => found.push((name, SpoolEntry { nanos, size: meta.len() })),
            Err(_) => {
                warn!(file = %name, "erasing spool file with malformed key");
                erase(&path);
            }
        }
    }
    Ok(found)
}

fn erase(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "cannot erase spool file");
    }
}

fn io_error(path: &Path, source: io::Error) -> SpoolError {
    SpoolError::Io {
        path: path.display().to_string(),
        source,
    }
}
