//! Interval results shaped for the collector.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::qan::event::Class;
use crate::qan::{Interval, QanConfig, QanResult};

pub const LRQ_CLASS_ID: &str = "0";
pub const LRQ_FINGERPRINT: &str = "LRQ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Instance uuid.
    pub uuid: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub run_time: f64,
    pub global: Option<Class>,
    /// Classes by summed query time, slowest first.
    pub class: Vec<Class>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slow_log_file: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub stop_offset: u64,
    pub rate_limit: u32,
}

/// Build the report for `interval`, keeping at most `config.report_limit`
/// classes and folding the rest into the low-ranking queries class. Query
/// examples are left out unless `config` asks for them.
pub fn make_report(config: &QanConfig, interval: &Interval, result: QanResult) -> Report {
    let mut classes = result.class;
    let mut global = result.global;
    classes.sort_by(|a, b| {
        b.query_time_sum()
            .partial_cmp(&a.query_time_sum())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    if config.report_limit > 0 && classes.len() > config.report_limit {
        let rest = classes.split_off(config.report_limit);
        let mut lrq = Class::new(LRQ_CLASS_ID, LRQ_FINGERPRINT);
        for class in &rest {
            lrq.add_class(class);
        }
        classes.push(lrq);
    }

    if !config.example_queries() {
        for class in &mut classes {
            class.example = None;
        }
        if let Some(global) = global.as_mut() {
            global.example = None;
        }
    }

    Report {
        uuid: config.uuid.clone(),
        start_ts: interval.start_time,
        end_ts: interval.stop_time,
        run_time: result.run_time,
        global,
        class: classes,
        slow_log_file: interval.filename.clone(),
        start_offset: interval.start_offset,
        end_offset: interval.end_offset,
        stop_offset: result.stop_offset,
        rate_limit: result.rate_limit.max(1),
    }
}
