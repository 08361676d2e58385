// tests/storage_tests.rs

use chrono::{TimeZone, Utc};
use keypool_proxy::config::StorageConfig;
use keypool_proxy::pool::{DisableReason, KeyRecord, KeyStatus};
use keypool_proxy::storage::{self, InMemoryPersistence, JsonFilePersistence, KeyPersistence};

fn disabled_record() -> KeyRecord {
    let mut record = KeyRecord::new("sk-storage-test-00001").with_status(KeyStatus::RateLimited);
    record.disable_reason = Some(DisableReason::ProviderRateLimit);
    record.disabled_until = Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
    record.failure_count = 3;
    record.consecutive_failures = 1;
    record
}

#[tokio::test]
async fn memory_backend_replaces_pool_on_save() {
    let store = InMemoryPersistence::with_keys(vec![KeyRecord::new("sk-old-key-0000001")]);
    store.save_keys(&[disabled_record()]).await.unwrap();

    let loaded = store.load_keys().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "sk-storage-test-00001");
    assert!(store.load_strategy_config().await.unwrap().is_none());
}

#[tokio::test]
async fn json_file_keeps_disablement_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    JsonFilePersistence::new(&path).save_keys(&[disabled_record()]).await.unwrap();

    let reopened = JsonFilePersistence::new(&path);
    let loaded = reopened.load_keys().await.unwrap();
    assert_eq!(loaded[0].status, KeyStatus::RateLimited);
    assert_eq!(loaded[0].disable_reason, Some(DisableReason::ProviderRateLimit));
    assert_eq!(loaded[0].disabled_until, disabled_record().disabled_until);
    assert_eq!(loaded[0].failure_count, 3);
}

#[tokio::test]
async fn corrupt_key_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(JsonFilePersistence::new(&path).load_keys().await.is_err());
}

#[tokio::test]
async fn blank_key_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    std::fs::write(&path, "\n").unwrap();

    assert!(JsonFilePersistence::new(&path).load_keys().await.unwrap().is_empty());
}

#[test]
fn backend_follows_configuration() {
    let file = storage::from_config(&StorageConfig {
        keys_file: Some("data/test-keys.json".into()),
        ..StorageConfig::default()
    })
    .unwrap();
    assert_eq!(file.backend_name(), "json_file");

    let memory = storage::from_config(&StorageConfig {
        keys_file: None,
        ..StorageConfig::default()
    })
    .unwrap();
    assert_eq!(memory.backend_name(), "memory");
}
