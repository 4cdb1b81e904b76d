//! Component status map
//!
//! Each component owns a `Status` with one entry per reported process
//! (`data-spooler`, `qan-analyzer-db1`, ...). Updates are cheap and never
//! block on I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::proto::StatusMap;

#[derive(Debug, Clone, Default)]
pub struct Status {
    inner: Arc<RwLock<StatusMap>>,
}

impl Status {
    /// Create a status map with the given processes set to `""`.
    pub fn new(procs: &[&str]) -> Self {
        let map = procs.iter().map(|p| (p.to_string(), String::new())).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn update(&self, proc_name: &str, status: impl Into<String>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(proc_name.to_string(), status.into());
    }

    pub fn get(&self, proc_name: &str) -> String {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(proc_name).cloned().unwrap_or_default()
    }

    pub fn remove(&self, proc_name: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(proc_name);
    }

    /// Snapshot of every entry.
    pub fn all(&self) -> StatusMap {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot merged with `others`; later maps win on key collisions.
    pub fn merge(&self, others: &[StatusMap]) -> StatusMap {
        let mut all: HashMap<String, String> = self.all();
        for other in others {
            all.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }
}
