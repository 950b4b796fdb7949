//! 连接尝试管理
//!
//! 单次连接流程：权限检查（仅首次）→ 连接 → 校验状态 → 成功 / 重试 / 失败。
//! 全局同一时刻最多一个连接流程，后来者立即得到 `AlreadyInProgress`。
//! 健康登记表与熔断器在每个流程结束时更新一次，每次尝试写入尝试日志。

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::structured::EventBus;

use super::{
    adaptive::AdaptiveCalculator,
    circuit_breaker::CircuitBreaker,
    error::OrchestratorError,
    events::{emit_connect_failed, emit_connect_succeeded},
    external::{PermissionGate, StatusSink, TunnelEngine, TunnelStatus},
    health::HealthRegistry,
    model::{now_epoch_ms, ConnectionAttempt, Endpoint, EndpointId, LastKnownGood},
    persist::PersistentCache,
    scoring::RECENT_WINDOW_MS,
};

const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub check_permission: bool,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self {
            check_permission: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSuccess {
    pub endpoint_id: EndpointId,
    pub attempts: u32,
    pub connect_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConnectionStats {
    pub attempts: u32,
    pub successes: u32,
    pub avg_connection_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub avg_connection_time_ms: f64,
    pub per_endpoint: HashMap<EndpointId, EndpointConnectionStats>,
}

/// 进行中标记，离开作用域时释放。
struct InProgressGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ConnectionManager {
    engine: Arc<dyn TunnelEngine>,
    permission: Arc<dyn PermissionGate>,
    registry: Arc<HealthRegistry>,
    breaker: Arc<CircuitBreaker>,
    adaptive: AdaptiveCalculator,
    persist: Arc<PersistentCache>,
    sink: Arc<dyn StatusSink>,
    events: Arc<dyn EventBus>,
    in_progress: AtomicBool,
    history: Mutex<VecDeque<ConnectionAttempt>>,
    history_limit: usize,
    last_known_good: Mutex<Option<LastKnownGood>>,
    active: Mutex<Option<Endpoint>>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        permission: Arc<dyn PermissionGate>,
        registry: Arc<HealthRegistry>,
        breaker: Arc<CircuitBreaker>,
        adaptive: AdaptiveCalculator,
        persist: Arc<PersistentCache>,
        sink: Arc<dyn StatusSink>,
        events: Arc<dyn EventBus>,
        history_limit: usize,
    ) -> Self {
        Self {
            engine,
            permission,
            registry,
            breaker,
            adaptive,
            persist,
            sink,
            events,
            in_progress: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            last_known_good: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        req: ConnectRequest,
    ) -> Result<ConnectSuccess, OrchestratorError> {
        let Some(_guard) = InProgressGuard::acquire(&self.in_progress) else {
            tracing::debug!(target = "connect", endpoint = %endpoint.id, "connect rejected: already in progress");
            return Err(OrchestratorError::AlreadyInProgress);
        };
        let result = self.run_sequence(endpoint, req).await;
        if let Err(err) = &result {
            emit_connect_failed(self.events.as_ref(), &endpoint.id, err.category(), &err.to_string());
        }
        result
    }

    async fn run_sequence(
        &self,
        endpoint: &Endpoint,
        req: ConnectRequest,
    ) -> Result<ConnectSuccess, OrchestratorError> {
        let id = &endpoint.id;
        if self.breaker.is_open(id) {
            return Err(OrchestratorError::CircuitOpen {
                endpoint_id: id.to_string(),
            });
        }

        if req.check_permission {
            let granted = match self.permission.request_permission().await {
                Ok(granted) => granted,
                Err(err) => {
                    tracing::warn!(target = "connect", error = %format!("{err:#}"), "permission request failed");
                    false
                }
            };
            if !granted {
                self.sink.message("network permission denied");
                return Err(OrchestratorError::PermissionDenied);
            }
        }

        let max_attempts = self.adaptive.retries_for(id);
        let timeout = self.adaptive.timeout_for(id);
        let started = Instant::now();
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.adaptive.retry_delay(attempt - 1, id);
                tracing::debug!(
                    target = "connect",
                    endpoint = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying connection"
                );
                tokio::time::sleep(delay).await;
            }
            self.sink.message(&format!(
                "connecting to {} (attempt {}/{})",
                endpoint.display_name(),
                attempt + 1,
                max_attempts
            ));

            let attempt_started = Instant::now();
            let outcome = self.attempt_once(endpoint, timeout).await;
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;
            match outcome {
                Ok(()) => {
                    self.log_attempt(id, true, elapsed_ms, None);
                    if self.breaker.record_success(id) {
                        self.persist.spawn_save_breakers(self.breaker.snapshot_all());
                    }
                    self.registry.record_attempt(id, true, elapsed_ms);
                    let lkg = LastKnownGood {
                        endpoint: endpoint.clone(),
                        at_ms: now_epoch_ms(),
                    };
                    self.set_last_known_good(Some(lkg.clone()));
                    self.set_active(Some(endpoint.clone()));
                    self.persist.spawn_save_last_known_good(lkg);
                    self.persist.spawn_save_health(self.registry.snapshot());
                    emit_connect_succeeded(self.events.as_ref(), id, attempt + 1, elapsed_ms);
                    self.sink.message(&format!("connected via {}", endpoint.display_name()));
                    return Ok(ConnectSuccess {
                        endpoint_id: id.clone(),
                        attempts: attempt + 1,
                        connect_ms: elapsed_ms,
                    });
                }
                Err(reason) => {
                    tracing::debug!(
                        target = "connect",
                        endpoint = %id,
                        attempt = attempt + 1,
                        reason = %reason,
                        "connection attempt failed"
                    );
                    self.log_attempt(id, false, elapsed_ms, Some(reason.clone()));
                    if let Err(err) = self.bounded_disconnect().await {
                        tracing::debug!(target = "connect", error = %err, "cleanup disconnect failed");
                    }
                    last_reason = reason;
                }
            }
        }

        let total_ms = started.elapsed().as_millis() as u64;
        self.registry.record_attempt(id, false, total_ms);
        self.breaker.record_failure(id);
        self.persist.spawn_save_breakers(self.breaker.snapshot_all());
        self.persist.spawn_save_health(self.registry.snapshot());
        Err(OrchestratorError::ConnectFailed {
            endpoint_id: id.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt_once(&self, endpoint: &Endpoint, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.engine.connect(endpoint)).await {
            Err(_) => return Err(format!("connect timed out after {} ms", timeout.as_millis())),
            Ok(Err(err)) => return Err(format!("{err:#}")),
            Ok(Ok(())) => {}
        }
        self.verify().await
    }

    /// 轮询引擎状态直到 Connected 或校验超时。每次查询都受剩余时间约束。
    async fn verify(&self) -> Result<(), String> {
        let limit = self.adaptive.verify_timeout();
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.engine.status()).await {
                Ok(Ok(TunnelStatus::Connected)) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::debug!(target = "connect", error = %format!("{err:#}"), "status query failed");
                }
                Err(_) => {
                    return Err(format!("status query timed out after {} ms", limit.as_millis()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err("tunnel did not reach connected state".to_string());
            }
            tokio::time::sleep(VERIFY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// 断开调用同样受校验超时约束，挂起的引擎不会卡住连接流程。
    async fn bounded_disconnect(&self) -> Result<(), String> {
        let limit = self.adaptive.verify_timeout();
        match tokio::time::timeout(limit, self.engine.disconnect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(_) => Err(format!("disconnect timed out after {} ms", limit.as_millis())),
        }
    }

    fn log_attempt(&self, id: &EndpointId, success: bool, connect_ms: u64, error: Option<String>) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(ConnectionAttempt {
            endpoint_id: id.clone(),
            at_ms: now_epoch_ms(),
            success,
            connect_ms,
            error,
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ConnectionAttempt> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ConnectionStats {
        let history = self.history();
        let mut stats = ConnectionStats::default();
        let mut total_connect_ms = 0u64;
        let mut per_connect_ms: HashMap<EndpointId, u64> = HashMap::new();
        for attempt in &history {
            stats.total_attempts += 1;
            let entry = stats.per_endpoint.entry(attempt.endpoint_id.clone()).or_default();
            entry.attempts += 1;
            if attempt.success {
                stats.successful_attempts += 1;
                total_connect_ms += attempt.connect_ms;
                entry.successes += 1;
                *per_connect_ms.entry(attempt.endpoint_id.clone()).or_default() += attempt.connect_ms;
            }
        }
        if stats.successful_attempts > 0 {
            stats.avg_connection_time_ms = total_connect_ms as f64 / stats.successful_attempts as f64;
        }
        for (id, entry) in stats.per_endpoint.iter_mut() {
            if entry.successes > 0 {
                let sum = per_connect_ms.get(id).copied().unwrap_or(0);
                entry.avg_connection_time_ms = sum as f64 / entry.successes as f64;
            }
        }
        stats
    }

    /// 最近 24 小时内各端点的成功连接次数
    pub fn recent_successes_at(&self, now_ms: i64) -> HashMap<EndpointId, u32> {
        let mut out = HashMap::new();
        for attempt in self.history() {
            if attempt.success && now_ms - attempt.at_ms <= RECENT_WINDOW_MS {
                *out.entry(attempt.endpoint_id).or_insert(0) += 1;
            }
        }
        out
    }

    pub fn last_known_good(&self) -> Option<LastKnownGood> {
        self.last_known_good.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_last_known_good(&self, lkg: Option<LastKnownGood>) {
        if let Ok(mut g) = self.last_known_good.lock() {
            *g = lkg;
        }
    }

    pub fn active_endpoint(&self) -> Option<Endpoint> {
        self.active.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_active(&self, endpoint: Option<Endpoint>) {
        if let Ok(mut g) = self.active.lock() {
            *g = endpoint;
        }
    }

    /// 断开当前隧道并清除活动端点
    pub async fn disconnect(&self) {
        self.set_active(None);
        if let Err(err) = self.bounded_disconnect().await {
            tracing::warn!(target = "connect", error = %err, "disconnect failed");
        }
    }

    pub fn clear_history(&self) {
        if let Ok(mut h) = self.history.lock() {
            h.clear();
        }
        self.set_last_known_good(None);
    }
}
