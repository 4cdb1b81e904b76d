//! Human-readable formatting helpers for status and throughput reports.

use std::time::Duration;

/// Format a byte count with SI suffixes: `"512 B"`, `"1.5 kB"`, `"100.3 MB"`.
pub fn format_bytes(bytes: u64) -> String {
    const K: f64 = 1000.0;
    let f = bytes as f64;
    if f >= K * K * K {
        format!("{:.1} GB", f / (K * K * K))
    } else if f >= K * K {
        format!("{:.1} MB", f / (K * K))
    } else if f >= K {
        format!("{:.1} kB", f / K)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a transfer rate in megabits per second.
pub fn format_mbps(bytes: u64, secs: f64) -> String {
    if secs <= 0.0 {
        return "0.00 Mbps".to_string();
    }
    let mbps = (bytes as f64 * 8.0) / secs / 1_000_000.0;
    format!("{:.2} Mbps", mbps)
}

/// Format a duration: `"850ms"`, `"45.2s"`, `"3m5s"`, `"1h2m3s"`.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    if secs < 60 {
        return format!("{:.1}s", d.as_secs_f64());
    }
    if secs < 3600 {
        return format!("{}m{}s", secs / 60, secs % 60);
    }
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
