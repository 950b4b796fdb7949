//! 自动重连控制器
//!
//! 隧道意外断开且不在手动断开抑制窗口内时触发，按升级顺序尝试：
//! 快速重连最近成功端点、缓存的可靠端点、全量发现并选择、紧急模式。
//! 整个周期的连接尝试总数有上限，步骤之间带抖动的指数退避。
//! 前面步骤尝试过的端点不会在后续步骤中重复尝试。

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use uuid::Uuid;

use crate::core::config::model::{ReconnectCfg, ScoringCfg};
use crate::events::structured::EventBus;

use super::{
    adaptive::AdaptiveCalculator,
    batch::{BatchOptions, BatchTester},
    circuit_breaker::CircuitBreaker,
    connect::{ConnectRequest, ConnectionManager},
    error::OrchestratorError,
    events::{
        emit_manual_disconnect, emit_reconnect_finished, emit_reconnect_started,
        emit_reconnect_strategy,
    },
    external::{CandidateProvider, PermissionGate, StatusSink},
    health::HealthRegistry,
    model::{dedupe_endpoints, now_epoch_ms, CandidatePool, Endpoint, EndpointId},
    persist::PersistentCache,
    scoring::{self, ScoringContext},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectStrategy {
    QuickReconnect,
    CachedReliable,
    FreshDiscovery,
    Emergency,
}

impl ReconnectStrategy {
    pub const ORDER: [ReconnectStrategy; 4] = [
        ReconnectStrategy::QuickReconnect,
        ReconnectStrategy::CachedReliable,
        ReconnectStrategy::FreshDiscovery,
        ReconnectStrategy::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectStrategy::QuickReconnect => "quick_reconnect",
            ReconnectStrategy::CachedReliable => "cached_reliable",
            ReconnectStrategy::FreshDiscovery => "fresh_discovery",
            ReconnectStrategy::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub strategy: ReconnectStrategy,
    pub endpoint_id: EndpointId,
    /// 本周期内消耗的端点尝试数
    pub attempts: u32,
    /// 依次尝试过的策略
    pub strategies_tried: Vec<ReconnectStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectResult {
    Reconnected(ReconnectOutcome),
    /// 手动断开后的抑制窗口内
    Suppressed,
    AlreadyRunning,
    Disabled,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 重连控制器依赖的服务句柄
pub struct ReconnectDeps {
    pub connector: Arc<ConnectionManager>,
    pub registry: Arc<HealthRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub batch: BatchTester,
    pub batch_options: BatchOptions,
    pub adaptive: AdaptiveCalculator,
    pub provider: Arc<dyn CandidateProvider>,
    pub pool: Arc<CandidatePool>,
    pub persist: Arc<PersistentCache>,
    pub permission: Arc<dyn PermissionGate>,
    pub sink: Arc<dyn StatusSink>,
    pub events: Arc<dyn EventBus>,
}

pub struct ReconnectController {
    cfg: ReconnectCfg,
    scoring: ScoringCfg,
    deps: ReconnectDeps,
    running: AtomicBool,
    suppressed_until_ms: AtomicI64,
}

impl ReconnectController {
    pub fn new(cfg: ReconnectCfg, scoring: ScoringCfg, deps: ReconnectDeps) -> Self {
        Self {
            cfg,
            scoring,
            deps,
            running: AtomicBool::new(false),
            suppressed_until_ms: AtomicI64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 记录一次手动断开，返回抑制窗口结束时间。
    pub fn record_manual_disconnect_at(&self, now_ms: i64) -> i64 {
        let until = now_ms + self.cfg.manual_suppression_secs as i64 * 1000;
        self.suppressed_until_ms.store(until, Ordering::Release);
        emit_manual_disconnect(self.deps.events.as_ref(), until);
        until
    }

    pub fn is_suppressed_at(&self, now_ms: i64) -> bool {
        now_ms < self.suppressed_until_ms.load(Ordering::Acquire)
    }

    pub fn suppressed_until_ms(&self) -> i64 {
        self.suppressed_until_ms.load(Ordering::Acquire)
    }

    pub async fn on_unexpected_disconnect(&self) -> Result<ReconnectResult, OrchestratorError> {
        self.on_unexpected_disconnect_at(now_epoch_ms()).await
    }

    pub async fn on_unexpected_disconnect_at(
        &self,
        now_ms: i64,
    ) -> Result<ReconnectResult, OrchestratorError> {
        if !self.cfg.enabled {
            return Ok(ReconnectResult::Disabled);
        }
        if self.is_suppressed_at(now_ms) {
            tracing::info!(target = "connect", "unexpected disconnect ignored: manual suppression active");
            return Ok(ReconnectResult::Suppressed);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(ReconnectResult::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.deps.connector.set_active(None);
        self.run_cycle(now_ms).await
    }

    async fn run_cycle(&self, now_ms: i64) -> Result<ReconnectResult, OrchestratorError> {
        let cycle_id = Uuid::new_v4().to_string();
        let events = self.deps.events.as_ref();
        emit_reconnect_started(events, &cycle_id);
        self.deps.sink.message("connection lost, reconnecting");

        let granted = match self.deps.permission.request_permission().await {
            Ok(granted) => granted,
            Err(err) => {
                tracing::warn!(target = "connect", error = %format!("{err:#}"), "permission request failed");
                false
            }
        };
        if !granted {
            emit_reconnect_finished(events, &cycle_id, false, 0);
            return Err(OrchestratorError::PermissionDenied);
        }

        let max_attempts = self.cfg.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut tried: HashSet<EndpointId> = HashSet::new();
        let mut strategies_tried = Vec::new();
        let mut backoff_step = 0u32;

        for (step, strategy) in ReconnectStrategy::ORDER.into_iter().enumerate() {
            if attempts >= max_attempts {
                break;
            }
            if attempts > 0 {
                let delay = self.deps.adaptive.reconnect_backoff(backoff_step);
                backoff_step += 1;
                tracing::debug!(
                    target = "connect",
                    cycle_id = %cycle_id,
                    delay_ms = delay.as_millis() as u64,
                    "reconnection backoff"
                );
                tokio::time::sleep(delay).await;
            }

            emit_reconnect_strategy(events, &cycle_id, strategy.as_str(), step as u32 + 1);
            self.deps
                .sink
                .message(&format!("reconnecting: {}", strategy.as_str().replace('_', " ")));
            strategies_tried.push(strategy);

            let targets = self.targets_for(strategy, now_ms, &tried).await;
            for endpoint in targets {
                if attempts >= max_attempts {
                    break;
                }
                if !tried.insert(endpoint.id.clone()) {
                    continue;
                }
                attempts += 1;
                let req = ConnectRequest {
                    check_permission: false,
                };
                match self.deps.connector.connect(&endpoint, req).await {
                    Ok(success) => {
                        emit_reconnect_finished(events, &cycle_id, true, attempts);
                        return Ok(ReconnectResult::Reconnected(ReconnectOutcome {
                            strategy,
                            endpoint_id: success.endpoint_id,
                            attempts,
                            strategies_tried,
                        }));
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "connect",
                            cycle_id = %cycle_id,
                            strategy = strategy.as_str(),
                            endpoint = %endpoint.id,
                            category = err.category(),
                            "reconnection attempt failed"
                        );
                    }
                }
            }
        }

        emit_reconnect_finished(events, &cycle_id, false, attempts);
        self.deps.sink.message("reconnection failed");
        Err(OrchestratorError::AllReconnectionStrategiesExhausted { attempts })
    }

    async fn targets_for(
        &self,
        strategy: ReconnectStrategy,
        now_ms: i64,
        tried: &HashSet<EndpointId>,
    ) -> Vec<Endpoint> {
        match strategy {
            ReconnectStrategy::QuickReconnect => self.quick_target(now_ms).into_iter().collect(),
            ReconnectStrategy::CachedReliable => self.reliable_targets(tried),
            ReconnectStrategy::FreshDiscovery => self.discover(now_ms, tried).await,
            ReconnectStrategy::Emergency => self.emergency_targets(tried),
        }
    }

    fn quick_target(&self, now_ms: i64) -> Option<Endpoint> {
        let lkg = self.deps.connector.last_known_good()?;
        let window_ms = self.cfg.quick_window_secs as i64 * 1000;
        if now_ms - lkg.at_ms > window_ms {
            return None;
        }
        let rate = self
            .deps
            .registry
            .get(&lkg.endpoint.id)
            .map(|m| m.success_rate())
            .unwrap_or(0.0);
        if rate <= self.cfg.quick_min_success_rate {
            return None;
        }
        Some(lkg.endpoint)
    }

    fn lookup(&self, id: &EndpointId) -> Option<Endpoint> {
        self.deps.pool.find(id).or_else(|| {
            self.deps
                .connector
                .last_known_good()
                .map(|lkg| lkg.endpoint)
                .filter(|ep| &ep.id == id)
        })
    }

    fn reliable_targets(&self, tried: &HashSet<EndpointId>) -> Vec<Endpoint> {
        self.deps
            .registry
            .reliable_ids()
            .into_iter()
            .filter(|id| !tried.contains(id) && !self.deps.breaker.is_open(id))
            .filter_map(|id| self.lookup(&id))
            .take(self.cfg.cached_reliable_limit)
            .collect()
    }

    async fn refreshed_candidates(&self, now_ms: i64) -> Vec<Endpoint> {
        match self.deps.provider.fetch_candidates().await {
            Ok(list) if !list.is_empty() => {
                let list = dedupe_endpoints(&list);
                self.deps.pool.merge(&list);
                self.deps.persist.spawn_save_candidates(list.clone());
                return list;
            }
            Ok(_) => tracing::debug!(target = "connect", "candidate provider returned nothing"),
            Err(err) => {
                tracing::warn!(target = "connect", error = %format!("{err:#}"), "candidate refresh failed")
            }
        }
        if let Some(persisted) = self.deps.persist.load_candidates_at(now_ms).await {
            if !persisted.is_empty() {
                self.deps.pool.merge(&persisted);
                return persisted;
            }
        }
        self.deps.pool.snapshot()
    }

    async fn discover(&self, now_ms: i64, tried: &HashSet<EndpointId>) -> Vec<Endpoint> {
        let candidates: Vec<Endpoint> = self
            .refreshed_candidates(now_ms)
            .await
            .into_iter()
            .filter(|ep| !tried.contains(&ep.id))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        let report = self.deps.batch.run(&candidates, &self.deps.batch_options).await;
        let ctx = ScoringContext::capture(
            &self.deps.registry,
            &self.deps.breaker,
            self.deps.connector.recent_successes_at(now_epoch_ms()),
            &self.scoring,
            now_epoch_ms(),
        );
        scoring::select(&report.results, &ctx)
            .map(|best| vec![best.endpoint])
            .unwrap_or_default()
    }

    /// 健康历史（最可靠的优先），然后是候选池中的其余端点。
    fn emergency_targets(&self, tried: &HashSet<EndpointId>) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self
            .deps
            .registry
            .ids_by_reliability()
            .into_iter()
            .filter_map(|id| self.lookup(&id))
            .collect();
        out.extend(self.deps.pool.snapshot());
        dedupe_endpoints(&out)
            .into_iter()
            .filter(|ep| !tried.contains(&ep.id) && !self.deps.breaker.is_open(&ep.id))
            .collect()
    }
}
