//! Query analytics
//!
//! An analyzer per monitored instance configures the server, cuts time into
//! intervals, hands each interval to a worker and spools the resulting
//! report. Workers and interval sources plug in through the traits below.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{AnalyzerResult, ConfigError, ConfigResult};
use crate::mysql::{Connector, MysqlQuery};
use crate::proto::{MysqlInstance, StatusMap};
use crate::ticker::TickReceiver;

pub mod analyzer;
pub mod event;
pub mod interval;
pub mod manager;
pub mod mysql_config;
pub mod report;

pub use analyzer::{RealAnalyzer, RealAnalyzerFactory};
pub use event::Class;
pub use interval::{FileIntervalIter, FileIntervalIterFactory};
pub use manager::QanManager;
pub use report::{make_report, Report};

pub const SERVICE_NAME: &str = "qan";

pub const DEFAULT_INTERVAL: u64 = 60;
pub const MIN_INTERVAL: u64 = 60;
pub const MAX_INTERVAL: u64 = 3600;
pub const DEFAULT_WORKER_RUN_TIME: u64 = 55;
pub const DEFAULT_MAX_SLOW_LOG_SIZE: u64 = 1 << 30;
pub const DEFAULT_REMOVE_OLD_SLOW_LOGS: u32 = 1;
pub const DEFAULT_REPORT_LIMIT: usize = 200;
pub const DEFAULT_RATE_LIMIT: u32 = 1;

/// One analysis window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub number: u64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    /// Slow log file the offsets refer to; empty for performance schema.
    pub filename: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// What a worker produced for one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QanResult {
    pub global: Option<Class>,
    pub class: Vec<Class>,
    pub rate_limit: u32,
    /// Seconds the worker spent.
    pub run_time: f64,
    pub stop_offset: u64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectFrom {
    #[default]
    Slowlog,
    Perfschema,
}

impl CollectFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectFrom::Slowlog => "slowlog",
            CollectFrom::Perfschema => "perfschema",
        }
    }
}

/// Per-instance analyzer configuration. Zero values are filled with
/// defaults by [`QanConfig::with_defaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QanConfig {
    /// Instance uuid.
    pub uuid: String,
    pub collect_from: CollectFrom,
    /// Seconds per interval.
    pub interval: u64,
    /// Time budget of one worker run, seconds.
    pub worker_run_time: u64,
    pub max_slow_log_size: u64,
    pub remove_old_slow_logs: u32,
    pub example_queries: Option<bool>,
    pub report_limit: usize,
    /// Log every Nth query; 1 disables rate limiting.
    pub rate_limit: u32,
    pub start: Vec<MysqlQuery>,
    pub stop: Vec<MysqlQuery>,
}

impl QanConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.interval == 0 {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.worker_run_time == 0 {
            self.worker_run_time = DEFAULT_WORKER_RUN_TIME.min(self.interval.saturating_sub(5).max(1));
        }
        if self.max_slow_log_size == 0 {
            self.max_slow_log_size = DEFAULT_MAX_SLOW_LOG_SIZE;
        }
        if self.remove_old_slow_logs == 0 {
            self.remove_old_slow_logs = DEFAULT_REMOVE_OLD_SLOW_LOGS;
        }
        if self.example_queries.is_none() {
            self.example_queries = Some(true);
        }
        if self.report_limit == 0 {
            self.report_limit = DEFAULT_REPORT_LIMIT;
        }
        if self.rate_limit == 0 {
            self.rate_limit = DEFAULT_RATE_LIMIT;
        }
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field: &str, value: String| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
        };
        if self.uuid.is_empty() {
            return Err(invalid("uuid", String::new()));
        }
        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&self.interval) {
            return Err(invalid("interval", self.interval.to_string()));
        }
        if self.worker_run_time == 0 || self.worker_run_time >= self.interval {
            return Err(invalid("worker_run_time", self.worker_run_time.to_string()));
        }
        if self.report_limit == 0 {
            return Err(invalid("report_limit", "0".to_string()));
        }
        Ok(())
    }

    pub fn example_queries(&self) -> bool {
        self.example_queries.unwrap_or(true)
    }
}

/// Parses or samples query events for one interval.
#[async_trait]
pub trait Worker: Send {
    async fn setup(&mut self, interval: &Interval) -> AnalyzerResult<()>;

    /// `Ok(None)` means nothing to report for the interval.
    async fn run(&mut self) -> AnalyzerResult<Option<QanResult>>;

    async fn cleanup(&mut self) -> AnalyzerResult<()>;

    fn status(&self) -> StatusMap;

    fn set_config(&mut self, config: QanConfig);
}

pub trait WorkerFactory: Send + Sync {
    fn make(&self, name: &str, config: &QanConfig, conn: Box<dyn Connector>) -> Box<dyn Worker>;
}

/// Resolves the file intervals are measured against.
pub type FilenameFn = Arc<dyn Fn() -> BoxFuture<'static, AnalyzerResult<String>> + Send + Sync>;

/// Restartable stream of contiguous intervals.
#[async_trait]
pub trait IntervalIter: Send {
    /// Begin consuming ticks; no-op if running.
    fn start(&mut self);

    /// Stop consuming ticks, keeping the open interval; no-op if stopped.
    async fn stop(&mut self);

    /// Next closed interval. Cancel safe.
    async fn next_interval(&mut self) -> Option<Interval>;
}

pub trait IntervalIterFactory: Send + Sync {
    fn make(&self, filename: FilenameFn, tick_rx: TickReceiver) -> Box<dyn IntervalIter>;
}

pub type RestartSender = mpsc::Sender<MysqlInstance>;
pub type RestartReceiver = mpsc::Receiver<MysqlInstance>;

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn start(&self) -> AnalyzerResult<()>;

    async fn stop(&self) -> AnalyzerResult<()>;

    fn status(&self) -> StatusMap;

    fn config(&self) -> QanConfig;

    fn set_config(&self, config: QanConfig);

    fn name(&self) -> String;
}

pub trait AnalyzerFactory: Send + Sync {
    fn make(
        &self,
        config: QanConfig,
        name: String,
        instance: MysqlInstance,
        restart_rx: RestartReceiver,
    ) -> Box<dyn Analyzer>;
}
