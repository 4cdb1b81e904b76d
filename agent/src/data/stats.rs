//! Rolling send statistics.
//!
//! Each completed send cycle produces one [`SentInfo`]. [`SenderStats`]
//! keeps the most recent entries that together span its retention window and
//! sums them on demand.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::fmt::{format_bytes, format_duration, format_mbps};

/// Summary of one send cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SentInfo {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Time spent sending, excluding connect time.
    pub send_time: Duration,
    pub bytes: u64,
    pub files: u64,
    pub errs: u64,
    pub api_errs: u64,
    pub timeouts: u64,
    pub bad_files: u64,
}

impl SentInfo {
    pub fn new(begin: DateTime<Utc>) -> Self {
        Self {
            begin,
            end: begin,
            send_time: Duration::ZERO,
            bytes: 0,
            files: 0,
            errs: 0,
            api_errs: 0,
            timeouts: 0,
            bad_files: 0,
        }
    }

    fn span(&self) -> Duration {
        (self.end - self.begin).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Round-robin window of send summaries.
#[derive(Debug)]
pub struct SenderStats {
    window: chrono::Duration,
    entries: VecDeque<SentInfo>,
    full: bool,
}

impl SenderStats {
    /// A zero window keeps only the latest entry.
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(1)),
            entries: VecDeque::new(),
            full: false,
        }
    }

    pub fn add(&mut self, info: SentInfo) {
        self.entries.push_front(info);

        let newest_end = self.entries[0].end;
        if !self.full {
            if let Some(oldest) = self.entries.back() {
                if newest_end - oldest.begin >= self.window {
                    self.full = true;
                }
            }
        }
        if !self.full {
            return;
        }

        // Drop the oldest while the rest still covers the window.
        while self.entries.len() > 1 {
            let second_oldest = &self.entries[self.entries.len() - 2];
            if newest_end - second_oldest.begin >= self.window {
                self.entries.pop_back();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retained entries, newest first.
    pub fn dump(&self) -> Vec<SentInfo> {
        self.entries.iter().cloned().collect()
    }

    /// Sum of all retained entries; `begin`/`end` span oldest to newest.
    pub fn report(&self) -> Option<SentInfo> {
        let newest = self.entries.front()?;
        let oldest = self.entries.back()?;
        let mut total = SentInfo::new(oldest.begin);
        total.end = newest.end;
        for info in &self.entries {
            total.send_time += info.send_time;
            total.bytes += info.bytes;
            total.files += info.files;
            total.errs += info.errs;
            total.api_errs += info.api_errs;
            total.timeouts += info.timeouts;
            total.bad_files += info.bad_files;
        }
        Some(total)
    }

    /// Human readable summary of [`report`](Self::report).
    pub fn report_text(&self) -> String {
        match self.report() {
            Some(info) => format_report(&info),
            None => "no data sent".to_string(),
        }
    }
}

pub fn format_report(info: &SentInfo) -> String {
    let span = info.span();
    let busy = if span.is_zero() {
        100.0
    } else {
        (info.send_time.as_secs_f64() / span.as_secs_f64() * 100.0).min(100.0)
    };
    format!(
        "{} in {} files at {}, {} of {} ({:.1}% busy), {} errors, {} API errors, {} timeouts, {} bad files",
        format_bytes(info.bytes),
        info.files,
        format_mbps(info.bytes, info.send_time.as_secs_f64()),
        format_duration(info.send_time),
        format_duration(span),
        busy,
        info.errs,
        info.api_errs,
        info.timeouts,
        info.bad_files,
    )
}
