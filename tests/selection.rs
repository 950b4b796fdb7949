//! 端点选择与连接综合测试：批量探测、评分排序、熔断与回退连接。

mod common;

use std::{collections::HashSet, time::Duration};

use common::fixtures::{endpoints, fast_config, set_latencies, HarnessBuilder};
use common::mock_engine::{CountingGate, MockProbe};
use common::test_env::init_test_env;

use tunnel_orchestrator_lib::endpoint::{
    scoring, CircuitState, Endpoint, HealthMetrics, OrchestratorError, ProbeOutcome, ProbeResult,
    ScoringContext, SelectOptions,
};
use tunnel_orchestrator_lib::events::{ConnectionEvent, Event, HealthEvent, SelectionEvent};

#[ctor::ctor]
fn __init_env() {
    init_test_env();
}

// ============================================================================
// 选择
// ============================================================================

#[tokio::test(start_paused = true)]
async fn selects_a_responsive_endpoint_and_never_a_timed_out_one() {
    let h = HarnessBuilder::new(fast_config()).build();
    let eps = endpoints(10);
    set_latencies(&h.engine, &eps[..7], &[80, 95, 110, 120, 130, 140, 150]);
    for ep in &eps[7..] {
        h.engine.set_probe(&ep.payload, MockProbe::Hang);
    }

    let sel = h
        .orchestrator
        .select_best_endpoint(eps.clone(), SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(sel.endpoint.id, eps[0].id, "lowest latency wins among untested endpoints");
    assert!(!sel.last_resort);
    assert_eq!(sel.tested, 10);
    assert_eq!(sel.latency_ms, Some(80));

    let timed_out: HashSet<_> = eps[7..].iter().map(|e| e.id.clone()).collect();
    assert!(sel.ranked[..7].iter().all(|c| !timed_out.contains(&c.endpoint.id)));
    assert!(sel.ranked[7..].iter().all(|c| c.last_resort));
    for c in &sel.ranked[7..] {
        assert_eq!(c.result.outcome, ProbeOutcome::Timeout);
    }
}

#[tokio::test(start_paused = true)]
async fn all_failed_probes_fall_back_to_last_resort() {
    let h = HarnessBuilder::new(fast_config()).build();
    let eps = endpoints(3);
    h.engine.set_probe(&eps[0].payload, MockProbe::Error);
    h.engine.set_probe(&eps[1].payload, MockProbe::Hang);
    h.engine.set_probe(&eps[2].payload, MockProbe::Latency(0));

    let sel = h
        .orchestrator
        .select_best_endpoint(eps.clone(), SelectOptions::default())
        .await
        .unwrap();
    assert!(sel.last_resort);
    // Timeout 排在 Failed 之前
    assert_eq!(sel.endpoint.id, eps[1].id);
    assert_eq!(sel.score, 0.0);
}

#[tokio::test]
async fn empty_candidate_list_is_rejected() {
    let h = HarnessBuilder::new(fast_config()).build();
    let err = h
        .orchestrator
        .select_best_endpoint(Vec::new(), SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::NoCandidates);
    assert!(h.events.snapshot().iter().any(|e| matches!(
        e,
        Event::Selection(SelectionEvent::Failed { .. })
    )));
}

#[tokio::test]
async fn duplicate_payloads_are_tested_once() {
    let h = HarnessBuilder::new(fast_config()).build();
    let a = Endpoint::new("dup");
    h.engine.set_probe("dup", MockProbe::Latency(120));
    let sel = h
        .orchestrator
        .select_best_endpoint(vec![a.clone(), a.clone(), a], SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(sel.tested, 1);
    assert_eq!(h.engine.delay_calls(), 1);
    assert_eq!(h.orchestrator.candidate_pool().len(), 1);
}

#[tokio::test]
async fn preferred_region_breaks_latency_tie() {
    let mut cfg = fast_config();
    cfg.scoring.preferred_regions = vec!["sg".into()];
    let h = HarnessBuilder::new(cfg).build();
    let plain = Endpoint::new("plain").with_hints(Some("vless"), Some("us"));
    let local = Endpoint::new("local").with_hints(Some("vless"), Some("SG"));
    h.engine.set_probe("plain", MockProbe::Latency(100));
    h.engine.set_probe("local", MockProbe::Latency(100));

    let sel = h
        .orchestrator
        .select_best_endpoint(vec![plain, local.clone()], SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(sel.endpoint.id, local.id);
}

#[tokio::test]
async fn selection_publishes_batch_and_completion_events() {
    let h = HarnessBuilder::new(fast_config()).build();
    let eps = endpoints(4);
    set_latencies(&h.engine, &eps, &[200, 150, 90, 400]);
    let sel = h
        .orchestrator
        .select_best_endpoint(eps.clone(), SelectOptions::default())
        .await
        .unwrap();

    let events = h.events.take_all();
    let batch = events.iter().find_map(|e| match e {
        Event::Selection(SelectionEvent::BatchFinished { id, tested, succeeded, .. }) => {
            Some((id.clone(), *tested, *succeeded))
        }
        _ => None,
    });
    let (batch_id, tested, succeeded) = batch.expect("batch finished event");
    assert_eq!((tested, succeeded), (4, 4));

    let completed = events.iter().find_map(|e| match e {
        Event::Selection(SelectionEvent::Completed { id, endpoint_id, candidates, .. }) => {
            Some((id.clone(), endpoint_id.clone(), *candidates))
        }
        _ => None,
    });
    let (id, endpoint_id, candidates) = completed.expect("completed event");
    assert_eq!(id, batch_id);
    assert_eq!(id, sel.selection_id);
    assert_eq!(endpoint_id, eps[2].id.to_string());
    assert_eq!(candidates, 4);
}

#[tokio::test(start_paused = true)]
async fn concurrent_selections_are_serialized() {
    let h = HarnessBuilder::new(fast_config()).build();
    let eps = endpoints(6);
    set_latencies(&h.engine, &eps, &[300, 250, 200, 150, 100, 50]);
    h.engine.set_probe_delay(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        h.orchestrator
            .select_best_endpoint(eps[..3].to_vec(), SelectOptions::default()),
        h.orchestrator
            .select_best_endpoint(eps[3..].to_vec(), SelectOptions::default()),
    );
    assert_eq!(a.unwrap().endpoint.id, eps[2].id);
    assert_eq!(b.unwrap().endpoint.id, eps[5].id);
    // 两次选择不重叠，同时在途的探测不超过一批
    assert!(h.engine.max_in_flight() <= 3);
}

// ============================================================================
// 熔断
// ============================================================================

#[tokio::test(start_paused = true)]
async fn repeated_connect_failures_open_breaker_and_block_selection() {
    let h = HarnessBuilder::new(fast_config()).build();
    let ep = Endpoint::new("flaky");
    h.engine.set_probe("flaky", MockProbe::Latency(90));
    h.engine.refuse_connect("flaky");

    for _ in 0..3 {
        let err = h.orchestrator.connect(&ep).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ConnectFailed { .. }), "{err:?}");
    }
    assert_eq!(h.orchestrator.breaker().state(&ep.id), CircuitState::Open);

    let err = h
        .orchestrator
        .select_best_endpoint(vec![ep.clone()], SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::NoUsableEndpoint);
    assert_eq!(h.engine.delay_calls(), 0, "open endpoint is not probed");

    let before = h.engine.connect_log().len();
    let err = h.orchestrator.connect(&ep).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CircuitOpen { .. }));
    assert_eq!(h.engine.connect_log().len(), before);

    assert!(h.events.snapshot().iter().any(|e| matches!(
        e,
        Event::Health(HealthEvent::BreakerTripped { consecutive_failures: 3, .. })
    )));
}

// ============================================================================
// 连接
// ============================================================================

#[tokio::test(start_paused = true)]
async fn connect_best_falls_back_along_ranking_with_one_permission_request() {
    let h = HarnessBuilder::new(fast_config()).build();
    let eps = endpoints(3);
    set_latencies(&h.engine, &eps, &[50, 120, 300]);
    h.engine.refuse_connect(&eps[0].payload);

    let success = h
        .orchestrator
        .connect_best(eps.clone(), SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(success.endpoint_id, eps[1].id);
    assert_eq!(h.gate.calls(), 1);

    let log = h.engine.connect_log();
    assert_eq!(log.first().map(String::as_str), Some("node-0"));
    assert_eq!(log.last().map(String::as_str), Some("node-1"));
    assert_eq!(
        h.orchestrator.connector().active_endpoint().map(|e| e.id),
        Some(eps[1].id.clone())
    );

    let stats = h.orchestrator.get_connection_stats();
    assert_eq!(stats.successful_attempts, 1);
    assert_eq!(stats.total_attempts as usize, log.len());
    assert_eq!(stats.per_endpoint[&eps[1].id].successes, 1);
    assert_eq!(stats.per_endpoint[&eps[0].id].successes, 0);
}

#[tokio::test]
async fn denied_permission_stops_before_engine_is_touched() {
    let h = HarnessBuilder::new(fast_config())
        .gate(CountingGate::denying())
        .build();
    let eps = endpoints(2);
    set_latencies(&h.engine, &eps, &[80, 90]);

    let err = h
        .orchestrator
        .connect_best(eps, SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::PermissionDenied);
    assert!(h.engine.connect_log().is_empty());
    assert!(h.sink.messages().iter().any(|m| m.contains("permission denied")));
}

#[tokio::test(start_paused = true)]
async fn overlapping_connect_is_rejected_immediately() {
    let h = HarnessBuilder::new(fast_config()).build();
    let a = Endpoint::new("a");
    let b = Endpoint::new("b");
    h.engine.set_connect_delay(Duration::from_millis(100));

    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.orchestrator.connect(&b).await
    };
    let (first, second) = tokio::join!(h.orchestrator.connect(&a), second);
    assert_eq!(first.unwrap().endpoint_id, a.id);
    assert_eq!(second.unwrap_err(), OrchestratorError::AlreadyInProgress);
    assert_eq!(h.engine.connect_log(), vec!["a".to_string()]);
}

#[tokio::test]
async fn successful_connect_updates_registry_and_publishes_event() {
    let h = HarnessBuilder::new(fast_config()).build();
    let ep = Endpoint::new("solid").with_label("Solid");
    let ok = h.orchestrator.connect(&ep).await.unwrap();
    assert_eq!(ok.attempts, 1);

    let metrics = h.orchestrator.registry().get(&ep.id).unwrap();
    assert_eq!(metrics.total_attempts, 1);
    assert_eq!(metrics.connect_count, 1);
    assert_eq!(
        h.orchestrator.connector().last_known_good().map(|l| l.endpoint.id),
        Some(ep.id.clone())
    );
    assert!(h.events.snapshot().iter().any(|e| matches!(
        e,
        Event::Connection(ConnectionEvent::Succeeded { attempts: 1, .. })
    )));
    assert!(h.sink.messages().iter().any(|m| m == "connected via Solid"));
}

// ============================================================================
// 评分
// ============================================================================

#[test]
fn reliable_history_outranks_a_faster_flaky_endpoint() {
    let steady = Endpoint::new("steady");
    let flaky = Endpoint::new("flaky");
    let mut ctx = ScoringContext::default();
    for (ep, ok, latency) in [(&steady, 9, 120.0), (&flaky, 4, 60.0)] {
        ctx.health.insert(
            ep.id.clone(),
            HealthMetrics {
                total_attempts: 10,
                successful_attempts: ok,
                latency_count: ok,
                avg_latency_ms: latency,
                ..Default::default()
            },
        );
    }
    let results = vec![
        (
            flaky.clone(),
            ProbeResult::new(flaky.id.clone(), ProbeOutcome::Measured { latency_ms: 60 }, 0),
        ),
        (
            steady.clone(),
            ProbeResult::new(steady.id.clone(), ProbeOutcome::Measured { latency_ms: 120 }, 0),
        ),
    ];
    let ranked = scoring::rank(&results, &ctx);
    assert_eq!(ranked[0].endpoint.id, steady.id);
    assert!(ranked[0].score > ranked[1].score);
}
