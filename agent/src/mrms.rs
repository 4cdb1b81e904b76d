//! MySQL restart monitoring
//!
//! Analyzers subscribe their instance and get the instance record on their
//! channel whenever the server is judged to have restarted. The uptime
//! monitor polls `Uptime` and treats a decrease as a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mysql::{Connector, ConnectorFactory};
use crate::proto::{MysqlInstance, StatusMap};
use crate::qan::{RestartReceiver, RestartSender};
use crate::status::Status;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESTART_CHANNEL_SIZE: usize = 1;

/// A restart channel and the id needed to unsubscribe it.
pub struct Subscription {
    pub id: u64,
    pub rx: RestartReceiver,
}

pub trait RestartMonitor: Send + Sync {
    fn add(&self, instance: MysqlInstance) -> Subscription;

    /// Drop one subscription; the instance stops being polled once it has none.
    fn remove(&self, uuid: &str, id: u64);

    fn status(&self) -> StatusMap;
}

struct Monitored {
    instance: MysqlInstance,
    conn: Arc<AsyncMutex<Box<dyn Connector>>>,
    connected: bool,
    last_uptime: Option<i64>,
    subscribers: Vec<(u64, RestartSender)>,
}

type Instances = Arc<Mutex<HashMap<String, Monitored>>>;

pub struct UptimeMonitor {
    factory: Arc<dyn ConnectorFactory>,
    poll_interval: Duration,
    instances: Instances,
    next_id: AtomicU64,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    status: Status,
}

impl UptimeMonitor {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            factory,
            poll_interval: DEFAULT_POLL_INTERVAL,
            instances: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
            status: Status::new(&["mrms-monitor"]),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let instances = Arc::clone(&self.instances);
        let status = self.status.clone();
        let poll_interval = self.poll_interval;
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(poll_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = timer.tick() => poll_all(&instances, &status).await,
                }
            }
        });
        *running = Some((cancel, handle));
        self.status.update("mrms-monitor", "Idle");
        info!(poll_ms = self.poll_interval.as_millis() as u64, "restart monitor started");
    }

    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
        let mut conns: Vec<Arc<AsyncMutex<Box<dyn Connector>>>> = Vec::new();
        {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            for monitored in instances.values_mut() {
                if monitored.connected {
                    monitored.connected = false;
                    conns.push(Arc::clone(&monitored.conn));
                }
            }
        }
        for conn in conns {
            conn.lock().await.close().await;
        }
        self.status.update("mrms-monitor", "Stopped");
    }

    /// Poll every instance once.
    pub async fn check_now(&self) {
        poll_all(&self.instances, &self.status).await;
    }
}

impl RestartMonitor for UptimeMonitor {
    fn add(&self, instance: MysqlInstance) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(RESTART_CHANNEL_SIZE);
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let monitored = instances.entry(instance.uuid.clone()).or_insert_with(|| Monitored {
            conn: Arc::new(AsyncMutex::new(self.factory.make(&instance.dsn))),
            instance: instance.clone(),
            connected: false,
            last_uptime: None,
            subscribers: Vec::new(),
        });
        monitored.subscribers.push((id, tx));
        debug!(instance = %instance.uuid, id, "restart subscription added");
        Subscription { id, rx }
    }

    fn remove(&self, uuid: &str, id: u64) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let empty = match instances.get_mut(uuid) {
            Some(monitored) => {
                monitored.subscribers.retain(|(sub, _)| *sub != id);
                monitored.subscribers.is_empty()
            }
            None => false,
        };
        if empty {
            instances.remove(uuid);
            debug!(instance = %uuid, "instance no longer monitored");
        }
    }

    fn status(&self) -> StatusMap {
        let count = self.instances.lock().unwrap_or_else(|e| e.into_inner()).len();
        self.status.update("mrms-monitor-instances", count.to_string());
        self.status.all()
    }
}

async fn poll_all(instances: &Instances, status: &Status) {
    let targets: Vec<(String, Arc<AsyncMutex<Box<dyn Connector>>>, bool)> = instances
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .map(|(uuid, m)| (uuid.clone(), Arc::clone(&m.conn), m.connected))
        .collect();
    if targets.is_empty() {
        return;
    }
    status.update("mrms-monitor", "Checking");

    for (uuid, conn, connected) in targets {
        let mut conn = conn.lock().await;
        if !connected {
            if let Err(e) = conn.connect(1).await {
                debug!(instance = %uuid, error = %e, "restart monitor cannot connect");
                continue;
            }
        }
        let uptime = conn.uptime().await;
        if uptime.is_err() {
            conn.close().await;
        }
        drop(conn);

        let mut instances = instances.lock().unwrap_or_else(|e| e.into_inner());
        let Some(monitored) = instances.get_mut(&uuid) else {
            continue;
        };
        match uptime {
            Ok(uptime) => {
                monitored.connected = true;
                let restarted = matches!(monitored.last_uptime, Some(last) if uptime < last);
                monitored.last_uptime = Some(uptime);
                if restarted {
                    info!(instance = %uuid, uptime, "MySQL restart detected");
                    notify(monitored);
                }
            }
            Err(e) => {
                warn!(instance = %uuid, error = %e, "cannot read MySQL uptime");
                monitored.connected = false;
            }
        }
    }
    status.update("mrms-monitor", "Idle");
}

fn notify(monitored: &Monitored) {
    for (id, tx) in &monitored.subscribers {
        match tx.try_send(monitored.instance.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(instance = %monitored.instance.uuid, id, "restart already pending for subscriber")
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
