mod common;

use common::{chat_request, manual_clock, Reply, ScriptedUpstream, TestConfigBuilder};
use keypool_proxy::key_manager::KeyManager;
use keypool_proxy::pool::{KeyFilter, KeyRecord, KeyStatus, Strategy, StrategyConfig};
use keypool_proxy::storage::{InMemoryPersistence, JsonFilePersistence, KeyPersistence};
use std::collections::BTreeMap;
use std::sync::Arc;

const K1: &str = "sk-manager-k1-0000001";
const K2: &str = "sk-manager-k2-0000002";
const K3: &str = "sk-manager-k3-0000003";

fn manager(
    config: keypool_proxy::AppConfig,
    upstream: Arc<ScriptedUpstream>,
    persistence: Arc<dyn KeyPersistence>,
) -> KeyManager {
    let (_, clock) = manual_clock();
    KeyManager::new(Arc::new(config), upstream, persistence, clock)
}

#[tokio::test]
async fn start_loads_persisted_keys_seeds_config_and_refreshes() {
    let mut persisted = KeyRecord::new(K1).with_status(KeyStatus::Active);
    persisted.success_count = 7;
    let persistence = Arc::new(InMemoryPersistence::with_keys(vec![persisted]));
    let upstream = ScriptedUpstream::new();
    upstream.balance_for(K2, 25.0, Some(25.0));

    let config = TestConfigBuilder::new().with_api_key(K1).with_api_key(K2).build();
    let manager = manager(config, upstream.clone(), persistence);
    manager.start().await.unwrap();

    let k1 = manager.store().get(K1).unwrap();
    assert_eq!(k1.success_count, 7, "persisted state wins over the seed");
    let k2 = manager.store().get(K2).unwrap();
    assert_eq!(k2.status, KeyStatus::Active);
    assert_eq!(k2.balance, 25.0);
    assert_eq!(upstream.balance_calls(), 2);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn failed_initial_refresh_is_not_fatal() {
    let upstream = ScriptedUpstream::new();
    upstream.balance_error(K1);
    let config = TestConfigBuilder::new().with_api_key(K1).build();
    let manager = manager(config, upstream, Arc::new(InMemoryPersistence::new()));

    manager.start().await.unwrap();
    assert_eq!(manager.store().get(K1).unwrap().status, KeyStatus::Unknown);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn stop_flushes_state_to_persistence() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let upstream = ScriptedUpstream::new();
    let config = TestConfigBuilder::new().with_api_key(K1).build();
    let manager = manager(config, upstream, persistence.clone());
    manager.start().await.unwrap();

    manager.dispatcher().dispatch(&chat_request("qwen")).await.unwrap();
    manager.stop().await.unwrap();

    let saved = persistence.saved().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].success_count, 1);
    assert_eq!(saved[0].total_tokens, 42);
}

#[tokio::test]
async fn state_survives_a_restart_through_the_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    let config = TestConfigBuilder::new().with_api_key(K1).build();

    let first = manager(config.clone(), ScriptedUpstream::new(), Arc::new(JsonFilePersistence::new(&path)));
    first.start().await.unwrap();
    first.dispatcher().dispatch(&chat_request("qwen")).await.unwrap();
    first.stop().await.unwrap();

    let second = manager(config, ScriptedUpstream::new(), Arc::new(JsonFilePersistence::new(&path)));
    second.start().await.unwrap();
    assert_eq!(second.store().get(K1).unwrap().success_count, 1);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn add_and_remove_keys() {
    let upstream = ScriptedUpstream::new();
    upstream.balance_for(K3, 8.0, None);
    let manager = manager(TestConfigBuilder::new().build(), upstream, Arc::new(InMemoryPersistence::new()));
    manager.start().await.unwrap();

    let view = manager.add_key(&format!("  {K3}  ")).await.unwrap();
    assert_eq!(view.status, KeyStatus::Active);
    assert_eq!(view.balance, 8.0);
    assert_ne!(view.key, K3, "admin views must not expose the credential");
    assert!(manager.add_key(K3).await.is_err());
    assert!(manager.add_key("   ").await.is_err());

    assert_eq!(manager.list_keys(KeyFilter::All).len(), 1);
    manager.remove_key(K3).unwrap();
    assert!(manager.list_keys(KeyFilter::All).is_empty());
    assert!(manager.remove_key(K3).is_err());
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn persisted_strategy_table_overrides_configuration() {
    let persistence = Arc::new(InMemoryPersistence::new());
    persistence
        .set_strategy_config(StrategyConfig {
            default: Strategy::HighBalance,
            models: BTreeMap::from([("deepseek-chat".to_string(), Strategy::LowTpm)]),
        })
        .await;
    let config = TestConfigBuilder::new()
        .with_default_strategy(Strategy::Normal)
        .with_model_strategy("qwen", Strategy::HighScore)
        .build();
    let manager = manager(config, ScriptedUpstream::new(), persistence);
    manager.start().await.unwrap();

    let strategies = manager.strategies();
    assert_eq!(strategies.default, Strategy::HighBalance);
    assert_eq!(strategies.resolve(Some("qwen")), Strategy::HighScore);
    assert_eq!(strategies.resolve(Some("deepseek-chat")), Strategy::LowTpm);
    manager.log_model_strategies();
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn model_strategy_routes_requests() {
    let upstream = ScriptedUpstream::new();
    upstream.balance_for(K1, 5.0, Some(5.0));
    upstream.balance_for(K2, 500.0, Some(500.0));
    let config = TestConfigBuilder::new()
        .with_api_key(K1)
        .with_api_key(K2)
        .with_model_strategy("big-model", Strategy::HighBalance)
        .with_model_strategy("cheap-model", Strategy::LowBalance)
        .build();
    let manager = manager(config, upstream.clone(), Arc::new(InMemoryPersistence::new()));
    manager.start().await.unwrap();

    let dispatcher = manager.dispatcher();
    dispatcher.dispatch(&chat_request("big-model")).await.unwrap();
    dispatcher.dispatch(&chat_request("cheap-model")).await.unwrap();
    assert_eq!(upstream.forwarded_keys(), vec![K2, K1]);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_requests_within_grace() {
    let upstream = ScriptedUpstream::new();
    upstream.reply_for(K1, Reply::Hang);
    let config = TestConfigBuilder::new().with_api_key(K1).build();
    let manager = Arc::new(manager(config, upstream, Arc::new(InMemoryPersistence::new())));
    manager.start().await.unwrap();

    let dispatcher = manager.dispatcher();
    let request = tokio::spawn(async move { dispatcher.dispatch(&chat_request("qwen")).await });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // Grace is one second; the hung request is abandoned and stop still completes
    let started = std::time::Instant::now();
    manager.stop().await.unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_millis(900));
    request.abort();
}
