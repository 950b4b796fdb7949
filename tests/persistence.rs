//! 持久化缓存：文件存储跨重启恢复、熔断状态恢复、显式清空与损坏值处理。

mod common;

use std::{sync::Arc, time::Duration};

use common::fixtures::{endpoints, fast_config, set_latencies, HarnessBuilder};
use common::mock_engine::MockTunnelEngine;
use common::test_env::init_test_env;

use tunnel_orchestrator_lib::core::config::loader::{load_or_init_at, save_at};
use tunnel_orchestrator_lib::endpoint::persist::{
    KEY_BREAKER_SNAPSHOT, KEY_CANDIDATES, KEY_HEALTH_SNAPSHOT, KEY_LAST_KNOWN_GOOD,
    KEY_PROBE_RESULTS,
};
use tunnel_orchestrator_lib::endpoint::{
    CircuitState, Endpoint, JsonFileKvStore, KvStore, MemoryKvStore, OrchestratorError,
    SelectOptions,
};

#[ctor::ctor]
fn __init_env() {
    init_test_env();
}

const ALL_KEYS: [&str; 4] = [
    KEY_CANDIDATES,
    KEY_PROBE_RESULTS,
    KEY_HEALTH_SNAPSHOT,
    KEY_LAST_KNOWN_GOOD,
];

/// 后台写入是异步的，轮询直到所有键落盘。
async fn wait_for_keys(store: &dyn KvStore, keys: &[&str]) {
    for _ in 0..200 {
        let mut present = 0;
        for key in keys {
            if store.get_string(key).await.unwrap().is_some() {
                present += 1;
            }
        }
        if present == keys.len() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("persisted keys did not appear: {keys:?}");
}

/// 轮询直到键的值满足条件
async fn wait_for_value(store: &dyn KvStore, key: &str, accept: impl Fn(&str) -> bool) {
    for _ in 0..200 {
        if let Some(raw) = store.get_string(key).await.unwrap() {
            if accept(&raw) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("persisted value for {key} never matched");
}

#[tokio::test]
async fn state_survives_restart_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("orchestrator-cache.json");
    let eps = endpoints(3);

    {
        let store = Arc::new(JsonFileKvStore::open(&path).await.unwrap());
        let engine = Arc::new(MockTunnelEngine::new());
        set_latencies(&engine, &eps, &[120, 60, 300]);
        let h = HarnessBuilder::new(fast_config())
            .engine(engine)
            .store(store.clone())
            .build();
        let ok = h
            .orchestrator
            .connect_best(eps.clone(), SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(ok.endpoint_id, eps[1].id);
        wait_for_keys(&*store, &ALL_KEYS).await;
        // 健康快照在连接成功后写入，包含三次探测
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let store = Arc::new(JsonFileKvStore::open(&path).await.unwrap());
    let h = HarnessBuilder::new(fast_config()).store(store).build();
    let summary = h.orchestrator.restore().await;
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.probe_results, 3);
    assert_eq!(summary.health_entries, 3);
    assert!(summary.last_known_good);

    let lkg = h.orchestrator.connector().last_known_good().unwrap();
    assert_eq!(lkg.endpoint.id, eps[1].id);
    assert_eq!(h.orchestrator.candidate_pool().len(), 3);
    let metrics = h.orchestrator.registry().get(&eps[1].id).unwrap();
    assert_eq!(metrics.connect_count, 1);

    // 恢复的探测结果直接参与选择，不再调用引擎
    let sel = h
        .orchestrator
        .select_best_endpoint(eps.clone(), SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(sel.endpoint.id, eps[1].id);
    assert_eq!(h.engine.delay_calls(), 0);
}

#[tokio::test]
async fn open_breaker_survives_restart() {
    let store = Arc::new(MemoryKvStore::new());
    let ep = Endpoint::new("flaky");
    {
        let h = HarnessBuilder::new(fast_config()).store(store.clone()).build();
        h.engine.refuse_connect("flaky");
        for _ in 0..3 {
            let err = h.orchestrator.connect(&ep).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::ConnectFailed { .. }), "{err:?}");
        }
        assert_eq!(h.orchestrator.breaker().state(&ep.id), CircuitState::Open);
        wait_for_value(&*store, KEY_BREAKER_SNAPSHOT, |raw| raw.contains("\"open\"")).await;
    }

    let h = HarnessBuilder::new(fast_config()).store(store).build();
    let summary = h.orchestrator.restore().await;
    assert_eq!(summary.breaker_entries, 1);
    assert_eq!(h.orchestrator.breaker().state(&ep.id), CircuitState::Open);
    assert_eq!(
        h.orchestrator.breaker().snapshot(&ep.id).unwrap().consecutive_failures,
        3
    );

    let err = h.orchestrator.connect(&ep).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CircuitOpen { .. }), "{err:?}");
    assert!(h.engine.connect_log().is_empty());
}

#[tokio::test]
async fn later_selection_keeps_restored_endpoints_in_pool() {
    let store = Arc::new(MemoryKvStore::new());
    let old = endpoints(3);
    {
        let h = HarnessBuilder::new(fast_config()).store(store.clone()).build();
        set_latencies(&h.engine, &old, &[80, 90, 100]);
        h.orchestrator
            .select_best_endpoint(old.clone(), SelectOptions::default())
            .await
            .unwrap();
        wait_for_keys(&*store, &[KEY_CANDIDATES]).await;
    }

    let h = HarnessBuilder::new(fast_config()).store(store).build();
    assert_eq!(h.orchestrator.restore().await.candidates, 3);
    let fresh = Endpoint::new("fresh");
    h.engine.set_probe("fresh", common::mock_engine::MockProbe::Latency(70));
    let sel = h
        .orchestrator
        .select_best_endpoint(vec![fresh.clone()], SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(sel.endpoint.id, fresh.id);

    let pool = h.orchestrator.candidate_pool();
    assert_eq!(pool.len(), 4);
    for ep in &old {
        assert_eq!(pool.find(&ep.id).as_ref(), Some(ep));
    }
}

#[tokio::test]
async fn clear_cache_wipes_memory_and_store() {
    let store = Arc::new(MemoryKvStore::new());
    let h = HarnessBuilder::new(fast_config()).store(store.clone()).build();
    let eps = endpoints(2);
    set_latencies(&h.engine, &eps, &[70, 140]);
    h.orchestrator
        .connect_best(eps.clone(), SelectOptions::default())
        .await
        .unwrap();
    wait_for_keys(&*store, &ALL_KEYS).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.orchestrator.clear_cache().await.unwrap();
    assert!(store.keys().is_empty());
    assert!(h.orchestrator.registry().is_empty());
    assert!(h.orchestrator.probe_engine().cached(&eps[0].id).is_none());
    assert!(h.orchestrator.connector().last_known_good().is_none());
    assert_eq!(h.orchestrator.get_connection_stats().total_attempts, 0);
}

#[tokio::test]
async fn corrupt_or_foreign_values_are_cache_misses() {
    let store = Arc::new(MemoryKvStore::new());
    store.set_string(KEY_HEALTH_SNAPSHOT, "{not json").await.unwrap();
    store
        .set_string(KEY_CANDIDATES, r#"{"unexpected":true}"#)
        .await
        .unwrap();
    store.set_string(KEY_PROBE_RESULTS, "[]").await.unwrap();

    let h = HarnessBuilder::new(fast_config()).store(store).build();
    let summary = h.orchestrator.restore().await;
    assert_eq!(summary.health_entries, 0);
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.probe_results, 0);
    assert!(!summary.last_known_good);
    assert!(h.orchestrator.candidate_pool().is_empty());
}

#[test]
fn config_file_roundtrip_keeps_custom_sections() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = load_or_init_at(dir.path()).unwrap();
    assert_eq!(cfg.batch.concurrency, 6);
    cfg.batch.concurrency = 3;
    cfg.scoring.preferred_regions = vec!["hk".into()];
    save_at(&cfg, dir.path()).unwrap();

    let reloaded = load_or_init_at(dir.path()).unwrap();
    assert_eq!(reloaded.batch.concurrency, 3);
    assert_eq!(reloaded.scoring.preferred_regions, vec!["hk".to_string()]);
    assert_eq!(reloaded.reconnect.max_attempts, 5);
}
