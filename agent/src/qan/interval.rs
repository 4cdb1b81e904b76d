//! Tick-driven interval iterator over a growing log file
//!
//! Every tick closes the open interval at the current end of the file and
//! opens the next one there, so intervals are contiguous. The first tick only
//! opens an interval. Rotation (a new file name) closes the interval at the
//! old file's size and starts the next one at offset 0 of the new file; a
//! file that shrank was truncated and is read again from 0.

use std::fs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::qan::{FilenameFn, Interval, IntervalIter, IntervalIterFactory};
use crate::ticker::TickReceiver;

#[derive(Debug, Clone)]
struct OpenInterval {
    number: u64,
    start_time: DateTime<Utc>,
    filename: String,
    start_offset: u64,
}

struct IterState {
    tick_rx: TickReceiver,
    open: Option<OpenInterval>,
    /// Closed but not yet handed out when the iterator was stopped.
    pending: Option<Interval>,
    number: u64,
}

pub struct FileIntervalIter {
    filename: FilenameFn,
    interval_tx: mpsc::Sender<Interval>,
    interval_rx: mpsc::Receiver<Interval>,
    state: Option<IterState>,
    running: Option<(CancellationToken, JoinHandle<IterState>)>,
}

impl FileIntervalIter {
    pub fn new(filename: FilenameFn, tick_rx: TickReceiver) -> Self {
        let (interval_tx, interval_rx) = mpsc::channel(1);
        Self {
            filename,
            interval_tx,
            interval_rx,
            state: Some(IterState {
                tick_rx,
                open: None,
                pending: None,
                number: 0,
            }),
            running: None,
        }
    }
}

#[async_trait]
impl IntervalIter for FileIntervalIter {
    fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let Some(state) = self.state.take() else {
            return;
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            state,
            self.filename.clone(),
            self.interval_tx.clone(),
            cancel.clone(),
        ));
        self.running = Some((cancel, handle));
        debug!("interval iterator started");
    }

    async fn stop(&mut self) {
        let Some((cancel, handle)) = self.running.take() else {
            return;
        };
        cancel.cancel();
        match handle.await {
            Ok(state) => self.state = Some(state),
            Err(e) => warn!(error = %e, "interval iterator task failed"),
        }
        debug!("interval iterator stopped");
    }

    async fn next_interval(&mut self) -> Option<Interval> {
        self.interval_rx.recv().await
    }
}

async fn run(
    mut state: IterState,
    filename: FilenameFn,
    interval_tx: mpsc::Sender<Interval>,
    cancel: CancellationToken,
) -> IterState {
    loop {
        if let Some(interval) = state.pending.take() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    state.pending = Some(interval);
                    break;
                }
                sent = interval_tx.send(interval.clone()) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        let tick = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = state.tick_rx.recv() => match tick {
                Some(tick) => tick,
                None => break,
            },
        };

        let current = match (filename)().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "cannot resolve log file, skipping tick");
                continue;
            }
        };
        let current_size = file_size(&current);

        let Some(open) = state.open.take() else {
            state.number += 1;
            state.open = Some(OpenInterval {
                number: state.number,
                start_time: tick,
                filename: current,
                start_offset: current_size,
            });
            continue;
        };

        let (interval, next_offset) = if open.filename != current {
            // Rotated: finish the old file, start the new one from the top.
            let old_size = file_size(&open.filename).max(open.start_offset);
            (close(open, tick, old_size), 0)
        } else if current_size < open.start_offset {
            debug!(file = %current, "log file truncated");
            let mut open = open;
            open.start_offset = 0;
            (close(open, tick, current_size), current_size)
        } else {
            (close(open, tick, current_size), current_size)
        };

        state.number += 1;
        state.open = Some(OpenInterval {
            number: state.number,
            start_time: tick,
            filename: current,
            start_offset: next_offset,
        });

        state.pending = Some(interval);
    }
    state
}

fn close(open: OpenInterval, stop_time: DateTime<Utc>, end_offset: u64) -> Interval {
    Interval {
        number: open.number,
        start_time: open.start_time,
        stop_time,
        filename: open.filename,
        start_offset: open.start_offset,
        end_offset,
    }
}

fn file_size(path: &str) -> u64 {
    if path.is_empty() {
        return 0;
    }
    match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(file = %path, error = %e, "cannot stat log file");
            0
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileIntervalIterFactory;

impl IntervalIterFactory for FileIntervalIterFactory {
    fn make(&self, filename: FilenameFn, tick_rx: TickReceiver) -> Box<dyn IntervalIter> {
        Box::new(FileIntervalIter::new(filename, tick_rx))
    }
}
