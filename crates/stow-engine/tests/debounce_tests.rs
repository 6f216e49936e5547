//! Debounced writes driven through the engine on a paused clock

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stow_engine::{EngineConfig, MemoryStore, PersistenceEngine};
use stow_test_utils::CounterFeature;

const INTERVAL: Duration = Duration::from_secs(10);

fn engine(store: &Arc<MemoryStore>) -> PersistenceEngine {
    let config = EngineConfig::new()
        .with_min_save_interval(INTERVAL)
        .with_export_defaults(false);
    PersistenceEngine::builder(config).store(store.clone()).build().unwrap()
}

async fn started() -> (PersistenceEngine, Arc<MemoryStore>, Arc<CounterFeature>) {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    let counter = CounterFeature::new();
    engine.register_owner(counter.clone()).unwrap();
    engine.init().unwrap();
    (engine, store, counter)
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_is_written_once() {
    let (_engine, store, counter) = started().await;
    let saves = store.save_count();

    for limit in 21..=25 {
        counter.limit.set(limit);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(store.save_count(), saves);

    tokio::time::sleep(INTERVAL).await;

    assert_eq!(store.save_count(), saves + 1);
    assert_eq!(store.snapshot().get("feature.counter.limit"), Some(&json!(25)));
}

#[tokio::test(start_paused = true)]
async fn changes_before_init_are_covered_by_the_initial_save() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    let counter = CounterFeature::new();
    engine.register_owner(counter.clone()).unwrap();

    counter.limit.set(5);
    assert!(engine.scheduler().is_pending());

    engine.init().unwrap();
    assert!(!engine.scheduler().is_pending());
    let saves = store.save_count();

    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(store.save_count(), saves);
}

#[tokio::test(start_paused = true)]
async fn second_burst_waits_for_the_interval() {
    let (engine, store, counter) = started().await;
    let saves = store.save_count();

    counter.limit.set(30);
    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(store.save_count(), saves + 1);

    counter.limit.set(31);
    tokio::time::sleep(INTERVAL / 2).await;
    assert_eq!(store.save_count(), saves + 1);
    assert!(engine.scheduler().is_pending());

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(store.save_count(), saves + 2);
    assert_eq!(engine.scheduler().scheduled_writes(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_change_immediately() {
    let (engine, store, counter) = started().await;
    let saves = store.save_count();

    counter.limit.set(77);
    engine.shutdown().unwrap();
    assert_eq!(store.save_count(), saves + 1);

    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(store.save_count(), saves + 1);
    assert_eq!(store.snapshot().get("feature.counter.limit"), Some(&json!(77)));
}
