//! Aggregated query-class metrics produced by workers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const QUERY_TIME: &str = "Query_time";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeStats {
    pub sum: f64,
    pub min: f64,
    pub avg: f64,
    #[serde(default)]
    pub med: f64,
    #[serde(default)]
    pub p95: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NumberStats {
    pub sum: u64,
    pub min: u64,
    pub avg: u64,
    #[serde(default)]
    pub med: u64,
    #[serde(default)]
    pub p95: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoolStats {
    /// Number of events where the flag was true.
    pub sum: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub time_metrics: BTreeMap<String, TimeStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub number_metrics: BTreeMap<String, NumberStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bool_metrics: BTreeMap<String, BoolStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Example {
    pub query: String,
    #[serde(default)]
    pub db: String,
    pub ts: String,
    pub query_time: f64,
}

/// One query class: every query sharing a fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Class {
    pub id: String,
    pub fingerprint: String,
    pub metrics: Metrics,
    pub total_queries: u64,
    #[serde(default)]
    pub unique_queries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Example>,
}

impl Class {
    pub fn new(id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fingerprint: fingerprint.into(),
            ..Self::default()
        }
    }

    /// Summed query time of the class, the ranking key of reports.
    pub fn query_time_sum(&self) -> f64 {
        self.metrics
            .time_metrics
            .get(QUERY_TIME)
            .map(|s| s.sum)
            .unwrap_or(0.0)
    }

    /// Fold `other` into this class. Percentiles cannot be merged and are
    /// dropped; the slowest example wins.
    pub fn add_class(&mut self, other: &Class) {
        let (n1, n2) = (self.total_queries, other.total_queries);
        let total = n1 + n2;
        let first = n1 == 0;
        self.total_queries = total;
        self.unique_queries += other.unique_queries.max(1);

        for (name, stats) in &other.metrics.time_metrics {
            let merged = self.metrics.time_metrics.entry(name.clone()).or_default();
            let empty = first || merged.sum == 0.0 && merged.max == 0.0;
            merged.sum += stats.sum;
            merged.min = if empty { stats.min } else { merged.min.min(stats.min) };
            merged.max = merged.max.max(stats.max);
            merged.avg = if total > 0 { merged.sum / total as f64 } else { 0.0 };
            merged.med = 0.0;
            merged.p95 = 0.0;
        }

        for (name, stats) in &other.metrics.number_metrics {
            let merged = self.metrics.number_metrics.entry(name.clone()).or_default();
            let empty = first || merged.sum == 0 && merged.max == 0;
            merged.sum += stats.sum;
            merged.min = if empty { stats.min } else { merged.min.min(stats.min) };
            merged.max = merged.max.max(stats.max);
            merged.avg = if total > 0 { merged.sum / total } else { 0 };
            merged.med = 0;
            merged.p95 = 0;
        }

        for (name, stats) in &other.metrics.bool_metrics {
            self.metrics.bool_metrics.entry(name.clone()).or_default().sum += stats.sum;
        }

        if let Some(example) = &other.example {
            let slower = match &self.example {
                Some(current) => example.query_time > current.query_time,
                None => true,
            };
            if slower {
                self.example = Some(example.clone());
            }
        }
    }
}
