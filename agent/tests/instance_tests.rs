//! Integration tests for the instance repository

mod mocks;

use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;

use qan_agent::error::InstanceError;
use qan_agent::Repo;

use mocks::{test_instance, MockInstanceApi};

const UUID: &str = "3130000000000000000000000000000a";

#[test]
fn test_add_persists_and_rejects_duplicates() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("instance");
    let repo = Repo::new(&dir, MockInstanceApi::new());
    repo.init().unwrap();

    repo.add(test_instance(UUID), true).unwrap();
    assert!(dir.join(format!("{}.json", UUID)).exists());

    let mut changed = test_instance(UUID);
    changed.name = "other".to_string();
    assert!(matches!(
        repo.add(changed, true),
        Err(InstanceError::Duplicate { .. })
    ));
    assert_eq!(repo.cached(UUID).unwrap().name, test_instance(UUID).name);

    assert!(matches!(
        repo.add(test_instance(""), false),
        Err(InstanceError::Invalid { .. })
    ));

    // A fresh repo reads back what was written.
    let reloaded = Repo::new(&dir, MockInstanceApi::new());
    assert_eq!(reloaded.init().unwrap(), 1);
    assert_eq!(reloaded.list(), vec![test_instance(UUID)]);
}

#[test]
fn test_concurrent_adds_of_one_uuid_admit_one() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::new(temp_dir.path().join("instance"), MockInstanceApi::new());
    repo.init().unwrap();

    let added = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = &repo;
                scope.spawn(move || {
                    let mut instance = test_instance(UUID);
                    instance.name = format!("db{}", i);
                    repo.add(instance, true).is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });
    assert_eq!(added, 1);
    assert_eq!(repo.list().len(), 1);
}

#[test]
fn test_add_without_disk_write() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("instance");
    let repo = Repo::new(&dir, MockInstanceApi::new());
    repo.init().unwrap();

    repo.add(test_instance(UUID), false).unwrap();
    assert!(repo.cached(UUID).is_some());
    assert!(!dir.join(format!("{}.json", UUID)).exists());
}

#[test]
fn test_update_and_remove() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("instance");
    let repo = Repo::new(&dir, MockInstanceApi::new());
    repo.init().unwrap();

    let mut instance = test_instance(UUID);
    assert!(matches!(
        repo.update(instance.clone()),
        Err(InstanceError::NotFound { .. })
    ));

    repo.add(instance.clone(), true).unwrap();
    instance.version = "8.0.36".to_string();
    repo.update(instance).unwrap();
    assert_eq!(repo.cached(UUID).unwrap().version, "8.0.36");

    fs::remove_file(dir.join(format!("{}.json", UUID))).unwrap();
    // The file is already gone; removing still succeeds.
    repo.remove(UUID).unwrap();
    assert!(repo.cached(UUID).is_none());
    repo.remove(UUID).unwrap();
}

#[test]
fn test_init_skips_bad_files() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("instance");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("broken.json"), b"{").unwrap();
    fs::write(dir.join("empty.json"), b"").unwrap();
    fs::write(dir.join("nouuid.json"), br#"{"name":"x"}"#).unwrap();
    fs::write(dir.join("notes.txt"), b"ignored").unwrap();
    fs::write(
        dir.join(format!("{}.json", UUID)),
        serde_json::to_vec(&test_instance(UUID)).unwrap(),
    )
    .unwrap();

    let repo = Repo::new(&dir, MockInstanceApi::new());
    assert_eq!(repo.init().unwrap(), 1);
    assert!(repo.cached(UUID).is_some());
}

#[tokio::test]
async fn test_get_fetches_on_miss_and_caches() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("instance");
    let api = MockInstanceApi::new().with_instance(test_instance(UUID));
    let repo = Repo::new(&dir, api.clone());
    repo.init().unwrap();

    let instance = repo.get(UUID, true).await.unwrap();
    assert_eq!(instance, test_instance(UUID));
    assert_eq!(api.get_calls(), vec![format!("http://api.test/instances/{}", UUID)]);
    assert!(dir.join(format!("{}.json", UUID)).exists());

    // Cached now.
    repo.get(UUID, true).await.unwrap();
    assert_eq!(api.get_calls().len(), 1);

    // Bypassing the cache asks the API again.
    repo.get(UUID, false).await.unwrap();
    assert_eq!(api.get_calls().len(), 2);
}

#[tokio::test]
async fn test_get_unknown_instance() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::new(temp_dir.path().join("instance"), MockInstanceApi::new());
    repo.init().unwrap();

    assert!(matches!(
        repo.get(UUID, true).await,
        Err(InstanceError::NotFound { .. })
    ));
    assert!(repo.cached(UUID).is_none());
}

#[tokio::test]
async fn test_get_waits_for_api_link() {
    let temp_dir = TempDir::new().unwrap();
    let api = MockInstanceApi::new().with_instance(test_instance(UUID));
    api.link_after.store(2, Ordering::SeqCst);
    let repo = Repo::new(temp_dir.path().join("instance"), api.clone()).with_link_backoff(Duration::from_millis(5));
    repo.init().unwrap();

    repo.get(UUID, true).await.unwrap();
    assert_eq!(api.link_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_get_gives_up_without_api_link() {
    let temp_dir = TempDir::new().unwrap();
    let api = MockInstanceApi::new().with_instance(test_instance(UUID));
    api.link_after.store(100, Ordering::SeqCst);
    let repo = Repo::new(temp_dir.path().join("instance"), api.clone()).with_link_backoff(Duration::from_millis(5));
    repo.init().unwrap();

    assert!(matches!(
        repo.get(UUID, true).await,
        Err(InstanceError::NoLink { .. })
    ));
    assert!(api.get_calls().is_empty());
}
