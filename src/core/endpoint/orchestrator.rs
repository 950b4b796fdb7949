//! 编排器门面：显式装配所有服务，对外提供选择、连接、重连与统计接口。

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::core::config::model::OrchestratorConfig;
use crate::events::structured::EventBus;

use super::{
    adaptive::AdaptiveCalculator,
    batch::{BatchOptions, BatchReport, BatchTester},
    cache::TierTtl,
    circuit_breaker::CircuitBreaker,
    connect::{ConnectRequest, ConnectSuccess, ConnectionManager, ConnectionStats},
    error::OrchestratorError,
    events::{emit_batch_finished, emit_selection_completed, emit_selection_failed},
    external::{CandidateProvider, KvStore, PermissionGate, StatusSink, TunnelEngine},
    health::HealthRegistry,
    model::{dedupe_endpoints, now_epoch_ms, CandidatePool, Endpoint},
    monitor::{Monitor, MonitorDeps, MonitorHandle, QualityStats},
    persist::PersistentCache,
    probe::ProbeEngine,
    reconnect::{ReconnectController, ReconnectDeps, ReconnectResult},
    scoring::{self, ScoredCandidate, ScoringContext},
};

/// 宿主提供的外部协作方
pub struct Collaborators {
    pub engine: Arc<dyn TunnelEngine>,
    pub permission: Arc<dyn PermissionGate>,
    pub store: Arc<dyn KvStore>,
    pub sink: Arc<dyn StatusSink>,
    pub events: Arc<dyn EventBus>,
    pub candidates: Arc<dyn CandidateProvider>,
}

/// 单次选择的覆盖参数，未设置的项取配置值。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub early_stop_count: Option<usize>,
    pub disable_early_stop: bool,
    pub probe_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub selection_id: String,
    pub endpoint: Endpoint,
    pub score: f64,
    pub latency_ms: Option<u32>,
    pub last_resort: bool,
    /// 全部可用候选的排序结果，首项即 `endpoint`
    pub ranked: Vec<ScoredCandidate>,
    pub tested: usize,
    pub skipped: usize,
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub health_entries: usize,
    pub breaker_entries: usize,
    pub probe_results: usize,
    pub candidates: usize,
    pub last_known_good: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<HealthRegistry>,
    breaker: Arc<CircuitBreaker>,
    probe: ProbeEngine,
    batch: BatchTester,
    connector: Arc<ConnectionManager>,
    reconnect: Arc<ReconnectController>,
    persist: Arc<PersistentCache>,
    monitor: Arc<Monitor>,
    pool: Arc<CandidatePool>,
    select_gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn StatusSink>,
    events: Arc<dyn EventBus>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collab: Collaborators) -> Self {
        let Collaborators {
            engine,
            permission,
            store,
            sink,
            events,
            candidates,
        } = collab;

        let ttl = TierTtl::from(&config.probe.ttl);
        let registry = Arc::new(HealthRegistry::new());
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker, events.clone()));
        let probe = ProbeEngine::new(engine.clone(), registry.clone(), config.probe.target.clone(), ttl);
        let batch = BatchTester::new(probe.clone(), breaker.clone(), sink.clone(), &config.batch);
        let adaptive = AdaptiveCalculator::new(
            config.retry.clone(),
            config.reconnect.clone(),
            registry.clone(),
        );
        let persist = Arc::new(PersistentCache::new(store, config.cache.clone(), ttl));
        let connector = Arc::new(ConnectionManager::new(
            engine,
            permission.clone(),
            registry.clone(),
            breaker.clone(),
            adaptive.clone(),
            persist.clone(),
            sink.clone(),
            events.clone(),
            config.cache.attempt_history_limit,
        ));
        let pool = Arc::new(CandidatePool::new());
        let probe_timeout = Duration::from_millis(config.probe.timeout_ms);
        let reconnect = Arc::new(ReconnectController::new(
            config.reconnect.clone(),
            config.scoring.clone(),
            ReconnectDeps {
                connector: connector.clone(),
                registry: registry.clone(),
                breaker: breaker.clone(),
                batch: batch.clone(),
                batch_options: BatchOptions::from_config(&config.batch, probe_timeout),
                adaptive,
                provider: candidates,
                pool: pool.clone(),
                persist: persist.clone(),
                permission,
                sink: sink.clone(),
                events: events.clone(),
            },
        ));
        let select_gate = Arc::new(tokio::sync::Mutex::new(()));
        let monitor = Arc::new(Monitor::new(
            config.monitor.clone(),
            config.cache.clone(),
            config.scoring.clone(),
            probe_timeout,
            MonitorDeps {
                probe: probe.clone(),
                registry: registry.clone(),
                breaker: breaker.clone(),
                connector: connector.clone(),
                reconnect: reconnect.clone(),
                persist: persist.clone(),
                pool: pool.clone(),
                select_gate: select_gate.clone(),
                events: events.clone(),
            },
        ));

        Self {
            config,
            registry,
            breaker,
            probe,
            batch,
            connector,
            reconnect,
            persist,
            monitor,
            pool,
            select_gate,
            sink,
            events,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn probe_engine(&self) -> &ProbeEngine {
        &self.probe
    }

    pub fn connector(&self) -> &Arc<ConnectionManager> {
        &self.connector
    }

    pub fn reconnect_controller(&self) -> &Arc<ReconnectController> {
        &self.reconnect
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn candidate_pool(&self) -> &Arc<CandidatePool> {
        &self.pool
    }

    /// 从持久化缓存恢复健康快照、熔断状态、探测结果、候选列表与最近成功端点。
    pub async fn restore(&self) -> RestoreSummary {
        let now_ms = now_epoch_ms();
        let mut summary = RestoreSummary::default();
        if let Some(health) = self.persist.load_health_at(now_ms).await {
            summary.health_entries = self.registry.restore(health);
        }
        if let Some(breakers) = self.persist.load_breakers().await {
            summary.breaker_entries = self.breaker.restore(breakers);
        }
        let results = self.persist.load_probe_results_at(now_ms).await;
        summary.probe_results = self.probe.restore_results(results, now_ms);
        if let Some(candidates) = self.persist.load_candidates_at(now_ms).await {
            summary.candidates = candidates.len();
            self.pool.merge(&candidates);
        }
        if let Some(lkg) = self.persist.load_last_known_good().await {
            self.pool.merge(std::slice::from_ref(&lkg.endpoint));
            self.connector.set_last_known_good(Some(lkg));
            summary.last_known_good = true;
        }
        tracing::info!(
            target = "cache",
            health_entries = summary.health_entries,
            breaker_entries = summary.breaker_entries,
            probe_results = summary.probe_results,
            candidates = summary.candidates,
            last_known_good = summary.last_known_good,
            "persisted state restored"
        );
        summary
    }

    fn batch_options(&self, opts: &SelectOptions) -> BatchOptions {
        let timeout = opts
            .probe_timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.probe.timeout_ms));
        let mut out = BatchOptions::from_config(&self.config.batch, timeout);
        if let Some(c) = opts.concurrency {
            out.concurrency = c;
        }
        if opts.batch_size.is_some() {
            out.batch_size = opts.batch_size;
        }
        if opts.early_stop_count.is_some() {
            out.early_stop_count = opts.early_stop_count;
        }
        if opts.disable_early_stop {
            out.early_stop_count = None;
        }
        out
    }

    /// 测试候选并选出最佳端点。并发调用在内部排队，依次执行。
    pub async fn select_best_endpoint(
        &self,
        candidates: Vec<Endpoint>,
        opts: SelectOptions,
    ) -> Result<Selection, OrchestratorError> {
        let _gate = self.select_gate.lock().await;
        let selection_id = Uuid::new_v4().to_string();
        let events = self.events.as_ref();

        if candidates.is_empty() {
            let err = OrchestratorError::NoCandidates;
            emit_selection_failed(events, &selection_id, &err.to_string());
            return Err(err);
        }
        let candidates = dedupe_endpoints(&candidates);
        // 候选池只增不减，健康记录中的旧端点在重连时仍可找回
        self.pool.merge(&candidates);
        self.persist.spawn_save_candidates(candidates.clone());
        self.sink
            .message(&format!("testing {} endpoints", candidates.len()));

        let report: BatchReport = self.batch.run(&candidates, &self.batch_options(&opts)).await;
        emit_batch_finished(
            events,
            &selection_id,
            report.results.len(),
            report.success_count(),
            report.skipped.len(),
            report.batches_run,
            report.stopped_early,
        );

        let now_ms = now_epoch_ms();
        let ctx = ScoringContext::capture(
            &self.registry,
            &self.breaker,
            self.connector.recent_successes_at(now_ms),
            &self.config.scoring,
            now_ms,
        );
        let ranked = scoring::rank(&report.results, &ctx);
        self.persist.spawn_save_probe_results(self.probe.cache_snapshot());

        let Some(best) = ranked.first().cloned() else {
            let err = OrchestratorError::NoUsableEndpoint;
            emit_selection_failed(events, &selection_id, &err.to_string());
            self.sink.message("no usable endpoint");
            return Err(err);
        };
        emit_selection_completed(
            events,
            &selection_id,
            &best.endpoint.id,
            best.score,
            best.result.latency_ms(),
            candidates.len(),
            best.last_resort,
        );
        self.sink
            .message(&format!("selected {}", best.endpoint.display_name()));
        Ok(Selection {
            selection_id,
            endpoint: best.endpoint.clone(),
            score: best.score,
            latency_ms: best.result.latency_ms(),
            last_resort: best.last_resort,
            tested: report.results.len(),
            skipped: report.skipped.len(),
            stopped_early: report.stopped_early,
            ranked,
        })
    }

    /// 选择后连接；单端点失败时沿排序列表回退。
    pub async fn connect_best(
        &self,
        candidates: Vec<Endpoint>,
        opts: SelectOptions,
    ) -> Result<ConnectSuccess, OrchestratorError> {
        let selection = self.select_best_endpoint(candidates, opts).await?;
        let mut permission_checked = false;
        let mut last_err = OrchestratorError::NoUsableEndpoint;
        for candidate in &selection.ranked {
            let req = ConnectRequest {
                check_permission: !permission_checked,
            };
            match self.connector.connect(&candidate.endpoint, req).await {
                Ok(success) => return Ok(success),
                Err(err @ OrchestratorError::CircuitOpen { .. }) => last_err = err,
                Err(err @ OrchestratorError::ConnectFailed { .. }) => {
                    permission_checked = true;
                    tracing::info!(
                        target = "connect",
                        endpoint = %candidate.endpoint.id,
                        "falling back to next ranked endpoint"
                    );
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    pub async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectSuccess, OrchestratorError> {
        self.pool.merge(std::slice::from_ref(endpoint));
        self.connector.connect(endpoint, ConnectRequest::default()).await
    }

    pub async fn handle_unexpected_disconnect(&self) -> Result<ReconnectResult, OrchestratorError> {
        self.reconnect.on_unexpected_disconnect().await
    }

    /// 用户主动断开：开启抑制窗口并断开隧道。
    pub async fn manual_disconnect(&self) -> i64 {
        let until = self.reconnect.record_manual_disconnect_at(now_epoch_ms());
        self.connector.disconnect().await;
        self.monitor.reset_quality();
        until
    }

    pub fn get_quality_stats(&self) -> QualityStats {
        self.monitor.quality_stats()
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        self.connector.stats()
    }

    /// 显式清空：健康登记、熔断状态、探测缓存、尝试历史与持久化键。
    pub async fn clear_cache(&self) -> Result<(), OrchestratorError> {
        self.registry.clear();
        self.breaker.clear_all();
        self.probe.clear();
        self.connector.clear_history();
        self.monitor.reset_quality();
        self.persist
            .clear()
            .await
            .map_err(|e| OrchestratorError::Storage(format!("{e:#}")))
    }

    pub fn spawn_monitor(&self) -> MonitorHandle {
        MonitorHandle::spawn(self.monitor.clone())
    }
}
