//! Integration tests for the disk spooler

mod mocks;

use std::fs;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use qan_agent::data::serializer::decode;
use qan_agent::data::spooler::{REASON_AGE, REASON_FILES, REASON_PURGED, REASON_SIZE};
use qan_agent::data::{DiskSpooler, GzipSerializer, JsonSerializer, Spooler};
use qan_agent::proto::{Data, SpoolLimits};
use qan_agent::ticker::tick_channel;

use mocks::wait_for;

fn create_test_spooler() -> (DiskSpooler, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let spooler = DiskSpooler::new(temp_dir.path().join("data"), "db1.test", SpoolLimits::default());
    (spooler, temp_dir)
}

async fn collect_files(spooler: &DiskSpooler) -> Vec<String> {
    let mut rx = spooler.files(CancellationToken::new());
    let mut keys = Vec::new();
    while let Some(key) = rx.recv().await {
        keys.push(key);
    }
    keys
}

async fn write_n(spooler: &DiskSpooler, n: usize) {
    let before = spooler.count();
    for i in 0..n {
        let report = format!(r#"{{"report":{},"pad":"{}"}}"#, i, "x".repeat(64));
        spooler.write("qan", report.into_bytes()).await.unwrap();
    }
    assert!(wait_for(Duration::from_secs(2), || spooler.count() == before + n).await);
}

#[tokio::test]
async fn test_write_read_round_trip() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(GzipSerializer::default())).unwrap();

    spooler.write("qan", br#"{"class":[]}"#.to_vec()).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || spooler.count() == 1).await);

    let keys = collect_files(&spooler).await;
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("qan_"));

    let envelope: Data = serde_json::from_slice(&spooler.read(&keys[0]).unwrap()).unwrap();
    assert_eq!(envelope.protocol_version, "1.0");
    assert_eq!(envelope.hostname, "db1.test");
    assert_eq!(envelope.service, "qan");
    assert_eq!(envelope.content_type, "application/json");
    assert_eq!(envelope.content_encoding, "gzip");
    let payload = decode(&envelope.content_encoding, &envelope.data).unwrap();
    assert_eq!(payload, br#"{"class":[]}"#);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_files_are_oldest_first() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 5).await;

    let keys = collect_files(&spooler).await;
    assert_eq!(keys.len(), 5);
    let mut sorted = keys.clone();
    sorted.sort_by_key(|k| k.rsplit_once('_').unwrap().1.parse::<i64>().unwrap());
    assert_eq!(keys, sorted);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_remove_then_files_omits_key() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 3).await;

    let keys = collect_files(&spooler).await;
    spooler.remove(&keys[1]).unwrap();
    // Removing twice is fine.
    spooler.remove(&keys[1]).unwrap();

    let remaining = collect_files(&spooler).await;
    assert_eq!(remaining, vec![keys[0].clone(), keys[2].clone()]);
    assert_eq!(spooler.count(), 2);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_of_vanished_file_forgets_key() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 2).await;

    let keys = collect_files(&spooler).await;
    fs::remove_file(spooler.dir().join(&keys[0])).unwrap();
    assert!(matches!(
        spooler.read(&keys[0]),
        Err(qan_agent::error::SpoolError::NotFound { .. })
    ));
    assert_eq!(spooler.count(), 1);
    assert_eq!(collect_files(&spooler).await, vec![keys[1].clone()]);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_reject_moves_to_trash() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 1).await;

    let key = collect_files(&spooler).await.remove(0);
    spooler.reject(&key).unwrap();

    assert!(spooler.trash_dir().join(&key).exists());
    assert!(!spooler.dir().join(&key).exists());
    assert!(collect_files(&spooler).await.is_empty());

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_all_zero_limits_removes_everything() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 4).await;

    let (removed, report) = spooler.purge(Utc::now(), SpoolLimits::PURGE_ALL);
    assert_eq!(removed, 4);
    assert_eq!(report[REASON_PURGED].len(), 4);
    assert!(report[REASON_AGE].is_empty());
    assert!(report[REASON_SIZE].is_empty());
    assert!(report[REASON_FILES].is_empty());
    assert_eq!(spooler.count(), 0);
    assert_eq!(spooler.size(), 0);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_max_files_keeps_newest() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 5).await;
    let keys = collect_files(&spooler).await;

    let limits = SpoolLimits {
        max_age: 0,
        max_size: 0,
        max_files: 2,
    };
    let (removed, report) = spooler.purge(Utc::now(), limits);
    assert_eq!(removed, 3);
    assert_eq!(report[REASON_FILES].len(), 3);
    assert_eq!(collect_files(&spooler).await, keys[3..].to_vec());

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_size_removes_oldest_only() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 3).await;
    let keys = collect_files(&spooler).await;
    let total = spooler.size();

    let limits = SpoolLimits {
        max_age: 0,
        max_size: total - 10,
        max_files: 0,
    };
    let (removed, report) = spooler.purge(Utc::now(), limits);
    assert_eq!(removed, 1);
    assert_eq!(report[REASON_SIZE], vec![keys[0].clone()]);
    assert!(report[REASON_PURGED].is_empty());
    assert!(report[REASON_AGE].is_empty());
    assert!(report[REASON_FILES].is_empty());

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_age_uses_key_timestamp() {
    let (spooler, _temp_dir) = create_test_spooler();
    let dir = spooler.dir().to_path_buf();
    fs::create_dir_all(&dir).unwrap();
    let old_nanos = (Utc::now() - chrono::Duration::hours(2)).timestamp_nanos_opt().unwrap();
    fs::write(dir.join(format!("qan_{}", old_nanos)), b"{}").unwrap();

    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 1).await;
    assert_eq!(spooler.count(), 2);

    let limits = SpoolLimits {
        max_age: 3600,
        max_size: 0,
        max_files: 0,
    };
    let (removed, report) = spooler.purge(Utc::now(), limits);
    assert_eq!(removed, 1);
    assert_eq!(report[REASON_AGE], vec![format!("qan_{}", old_nanos)]);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_with_huge_max_age_keeps_items() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 3).await;

    let limits = SpoolLimits {
        max_age: u64::MAX,
        max_size: 0,
        max_files: 0,
    };
    let (removed, report) = spooler.purge(Utc::now(), limits);
    assert_eq!(removed, 0);
    assert!(report[REASON_AGE].is_empty());
    assert_eq!(spooler.count(), 3);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_cleans_tmp_and_malformed_files() {
    let (spooler, _temp_dir) = create_test_spooler();
    let dir = spooler.dir().to_path_buf();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("qan_100.tmp"), b"partial").unwrap();
    fs::write(dir.join("garbage"), b"??").unwrap();
    fs::write(dir.join("qan_200"), b"{}").unwrap();

    spooler.start(Box::new(JsonSerializer)).unwrap();
    assert_eq!(spooler.count(), 1);
    assert!(!dir.join("qan_100.tmp").exists());
    assert!(!dir.join("garbage").exists());
    assert_eq!(collect_files(&spooler).await, vec!["qan_200".to_string()]);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_periodic_purge_on_tick() {
    let temp_dir = TempDir::new().unwrap();
    let (tick_tx, tick_rx) = tick_channel();
    let limits = SpoolLimits {
        max_age: 0,
        max_size: 0,
        max_files: 1,
    };
    let spooler = DiskSpooler::new(temp_dir.path().join("data"), "db1.test", limits).with_purge_tick(tick_rx);
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 3).await;

    tick_tx.send(Utc::now()).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || spooler.count() == 1).await);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_periodic_purge_never_wipes_with_zero_limits() {
    let temp_dir = TempDir::new().unwrap();
    let (tick_tx, tick_rx) = tick_channel();
    let spooler =
        DiskSpooler::new(temp_dir.path().join("data"), "db1.test", SpoolLimits::PURGE_ALL).with_purge_tick(tick_rx);
    spooler.start(Box::new(JsonSerializer)).unwrap();
    write_n(&spooler, 2).await;

    tick_tx.send(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(spooler.count(), 2);

    spooler.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_flushes_queued_writes_and_restart_rescans() {
    let (spooler, _temp_dir) = create_test_spooler();
    spooler.start(Box::new(JsonSerializer)).unwrap();
    for i in 0..10 {
        spooler.write("qan", format!("{{\"n\":{}}}", i).into_bytes()).await.unwrap();
    }
    spooler.stop().await.unwrap();
    assert!(!spooler.is_running());
    assert!(spooler.write("qan", b"{}".to_vec()).await.is_err());

    spooler.start(Box::new(JsonSerializer)).unwrap();
    assert_eq!(spooler.count(), 10);
    let status = spooler.status();
    assert_eq!(status["data-spooler-count"], "10");
    assert!(!status["data-spooler-oldest"].is_empty());
    spooler.stop().await.unwrap();
}
