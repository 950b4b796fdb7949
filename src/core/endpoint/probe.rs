//! 延迟探测引擎
//!
//! 对单个端点发起一次延迟测量。相同缓存键的并发探测共享同一个进行中的
//! future，只产生一次外部调用；缓存命中直接返回。完成后写入分级 TTL 缓存
//! 并转发到健康登记表。任何异常、超时或非正数结果都在这里被规范化为
//! `ProbeOutcome`，不会向调用方传播错误。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};

use super::{
    cache::{CacheEntry, TierTtl, TtlCache},
    error::ProbeError,
    external::TunnelEngine,
    health::HealthRegistry,
    model::{now_epoch_ms, Endpoint, EndpointId, ProbeOutcome, ProbeResult},
};

type InFlight = Shared<BoxFuture<'static, ProbeResult>>;

struct ProbeInner {
    engine: Arc<dyn TunnelEngine>,
    registry: Arc<HealthRegistry>,
    cache: TtlCache<ProbeResult>,
    ttl: TierTtl,
    target: String,
    pending: Mutex<HashMap<String, InFlight>>,
}

#[derive(Clone)]
pub struct ProbeEngine {
    inner: Arc<ProbeInner>,
}

impl ProbeEngine {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        registry: Arc<HealthRegistry>,
        target: impl Into<String>,
        ttl: TierTtl,
    ) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                engine,
                registry,
                cache: TtlCache::new(),
                ttl,
                target: target.into(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// 缓存键：端点标识与固定探测目标。
    pub fn cache_key(&self, id: &EndpointId) -> String {
        format!("{}|{}", id, self.inner.target)
    }

    /// 探测端点延迟，优先使用缓存。
    pub async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
        let key = self.cache_key(&endpoint.id);
        if let Some(hit) = self.inner.cache.get_at(&key, now_epoch_ms()) {
            tracing::trace!(target = "endpoint", endpoint = %endpoint.id, "probe cache hit");
            return hit;
        }
        self.join_or_start(key, endpoint, timeout).await
    }

    /// 跳过缓存读取的探测，结果仍会写回缓存。
    pub async fn probe_fresh(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
        let key = self.cache_key(&endpoint.id);
        self.join_or_start(key, endpoint, timeout).await
    }

    /// 读取缓存中的结果，不触发探测。
    pub fn cached(&self, id: &EndpointId) -> Option<ProbeResult> {
        self.inner.cache.get_at(&self.cache_key(id), now_epoch_ms())
    }

    pub fn invalidate(&self, id: &EndpointId) {
        self.inner.cache.remove(&self.cache_key(id));
    }

    pub fn cache_snapshot(&self) -> Vec<ProbeResult> {
        self.cache_snapshot_at(now_epoch_ms())
    }

    pub fn cache_snapshot_at(&self, now_ms: i64) -> Vec<ProbeResult> {
        self.inner
            .cache
            .entries_at(now_ms)
            .into_iter()
            .map(|(_, e)| e.value)
            .collect()
    }

    /// 恢复持久化的探测结果，按测量时间与等级 TTL 计算剩余有效期。
    pub fn restore_results(&self, results: Vec<ProbeResult>, now_ms: i64) -> usize {
        let mut restored = 0;
        for result in results {
            let entry = CacheEntry {
                ttl_ms: self.inner.ttl.ttl_ms(result.tier()),
                written_at_ms: result.measured_at_ms,
                value: result,
            };
            if entry.is_expired(now_ms) {
                continue;
            }
            let key = self.cache_key(&entry.value.endpoint_id);
            self.inner.cache.insert_entry(key, entry);
            restored += 1;
        }
        restored
    }

    pub fn prune_expired_at(&self, now_ms: i64) -> usize {
        self.inner.cache.prune_at(now_ms)
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    async fn join_or_start(&self, key: String, endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
        let in_flight = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = pending.get(&key) {
                tracing::trace!(target = "endpoint", endpoint = %endpoint.id, "joining in-flight probe");
                existing.clone()
            } else {
                // 外部调用放在独立任务中，调用方被取消时探测仍会完成并清理
                let handle = tokio::spawn(measure_and_store(
                    self.inner.clone(),
                    endpoint.clone(),
                    key.clone(),
                    timeout,
                ));
                let id = endpoint.id.clone();
                let fut: InFlight = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(err) => {
                            tracing::warn!(target = "endpoint", endpoint = %id, error = %err, "probe task aborted");
                            ProbeResult::new(id, ProbeOutcome::Failed, now_epoch_ms())
                        }
                    }
                }
                .boxed()
                .shared();
                pending.insert(key, fut.clone());
                fut
            }
        };
        in_flight.await
    }
}

async fn measure_and_store(
    inner: Arc<ProbeInner>,
    endpoint: Endpoint,
    key: String,
    timeout: Duration,
) -> ProbeResult {
    let outcome = match measure(inner.engine.as_ref(), &endpoint, &inner.target, timeout).await {
        Ok(latency_ms) => ProbeOutcome::Measured { latency_ms },
        Err(ProbeError::Timeout) => ProbeOutcome::Timeout,
        Err(err) => {
            tracing::debug!(target = "endpoint", endpoint = %endpoint.id, error = %err, "probe failed");
            ProbeOutcome::Failed
        }
    };
    let now_ms = now_epoch_ms();
    let result = ProbeResult::new(endpoint.id.clone(), outcome, now_ms);
    inner
        .cache
        .insert_at(key.clone(), result.clone(), inner.ttl.ttl_ms(result.tier()), now_ms);
    inner.registry.record_probe_at(&endpoint.id, &outcome, now_ms);
    if let Ok(mut pending) = inner.pending.lock() {
        pending.remove(&key);
    }
    tracing::debug!(
        target = "endpoint",
        endpoint = %endpoint.id,
        latency_ms = ?outcome.latency_ms(),
        tier = result.tier().as_str(),
        "probe completed"
    );
    result
}

/// 单次外部测量，超时后放弃等待，迟到的结果被丢弃。
async fn measure(
    engine: &dyn TunnelEngine,
    endpoint: &Endpoint,
    target: &str,
    timeout: Duration,
) -> Result<u32, ProbeError> {
    match tokio::time::timeout(timeout, engine.delay_test(endpoint, target)).await {
        Err(_) => Err(ProbeError::Timeout),
        Ok(Err(err)) => Err(ProbeError::Engine(format!("{err:#}"))),
        Ok(Ok(value)) => match ProbeOutcome::from_engine(value) {
            ProbeOutcome::Measured { latency_ms } => Ok(latency_ms),
            _ => Err(ProbeError::NonPositive(value)),
        },
    }
}
