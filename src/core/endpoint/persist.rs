//! 持久化缓存层
//!
//! 在外部键值存储之上保存候选列表、探测结果、健康快照、熔断状态与最近成功端点。
//! 每个值都是带保存时间的 JSON 信封，过期或无法解析的值按未命中处理。
//! 写入是整值覆盖；探测结果超过上限时先淘汰质量最差的，再淘汰最旧的。
//! 后台保存按快照捕获顺序编号，同一键上较旧的快照不会覆盖较新的。

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::core::config::model::CacheCfg;

use super::{
    cache::TierTtl,
    circuit_breaker::CircuitSnapshot,
    external::KvStore,
    health::HealthMetrics,
    model::{now_epoch_ms, Endpoint, EndpointId, LastKnownGood, ProbeResult},
};

pub const KEY_CANDIDATES: &str = "orchestrator.candidates";
pub const KEY_PROBE_RESULTS: &str = "orchestrator.probe_results";
pub const KEY_HEALTH_SNAPSHOT: &str = "orchestrator.health_snapshot";
pub const KEY_LAST_KNOWN_GOOD: &str = "orchestrator.last_known_good";
pub const KEY_BREAKER_SNAPSHOT: &str = "orchestrator.breaker_snapshot";

const ALL_KEYS: [&str; 5] = [
    KEY_CANDIDATES,
    KEY_PROBE_RESULTS,
    KEY_HEALTH_SNAPSHOT,
    KEY_LAST_KNOWN_GOOD,
    KEY_BREAKER_SNAPSHOT,
];

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateEnvelope {
    saved_at_epoch_ms: i64,
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeEnvelope {
    saved_at_epoch_ms: i64,
    results: BTreeMap<EndpointId, ProbeResult>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthEnvelope {
    saved_at_epoch_ms: i64,
    entries: BTreeMap<EndpointId, HealthMetrics>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastKnownGoodEnvelope {
    saved_at_epoch_ms: i64,
    last_known_good: LastKnownGood,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakerEnvelope {
    saved_at_epoch_ms: i64,
    entries: BTreeMap<EndpointId, CircuitSnapshot>,
}

pub struct PersistentCache {
    store: Arc<dyn KvStore>,
    cfg: CacheCfg,
    ttl: TierTtl,
    /// 后台保存序号，捕获快照时分配
    seq: AtomicU64,
    /// 各键最近一次落盘的序号；持锁期间同一时刻只有一个写入
    written: tokio::sync::Mutex<HashMap<&'static str, u64>>,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn KvStore>, cfg: CacheCfg, ttl: TierTtl) -> Self {
        Self {
            store,
            cfg,
            ttl,
            seq: AtomicU64::new(0),
            written: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 按序写入：序号早于该键已落盘序号的保存被丢弃，返回是否写入。
    pub async fn write_ordered<F>(&self, key: &'static str, seq: u64, save: F) -> Result<bool>
    where
        F: Future<Output = Result<()>>,
    {
        let mut written = self.written.lock().await;
        if written.get(key).is_some_and(|last| *last > seq) {
            tracing::debug!(target = "cache", key, seq, "stale snapshot skipped");
            return Ok(false);
        }
        save.await?;
        written.insert(key, seq);
        Ok(true)
    }

    fn spawn_ordered<F, Fut>(self: &Arc<Self>, key: &'static str, save: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let seq = self.next_seq();
        let cache = self.clone();
        tokio::spawn(async move {
            let fut = save(cache.clone());
            if let Err(err) = cache.write_ordered(key, seq, fut).await {
                tracing::warn!(target = "cache", key, error = %format!("{err:#}"), "background save failed");
            }
        });
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_string(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(target = "cache", key, error = %format!("{err:#}"), "cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!(target = "cache", key, error = %err, "cache value corrupted, ignoring");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).with_context(|| format!("serialize {key}"))?;
        self.store
            .set_string(key, &json)
            .await
            .with_context(|| format!("write {key}"))?;
        tracing::debug!(target = "cache", key, bytes = json.len(), "cache value saved");
        Ok(())
    }

    pub async fn save_candidates_at(&self, endpoints: &[Endpoint], now_ms: i64) -> Result<()> {
        let envelope = CandidateEnvelope {
            saved_at_epoch_ms: now_ms,
            endpoints: endpoints.to_vec(),
        };
        self.write(KEY_CANDIDATES, &envelope).await
    }

    pub async fn load_candidates_at(&self, now_ms: i64) -> Option<Vec<Endpoint>> {
        let envelope: CandidateEnvelope = self.read(KEY_CANDIDATES).await?;
        let ttl_ms = self.cfg.candidate_list_ttl_secs as i64 * 1000;
        if now_ms - envelope.saved_at_epoch_ms >= ttl_ms {
            tracing::debug!(target = "cache", "persisted candidate list expired");
            return None;
        }
        Some(envelope.endpoints)
    }

    pub async fn save_probe_results_at(&self, results: &[ProbeResult], now_ms: i64) -> Result<()> {
        let kept = cap_probe_results(results, self.cfg.max_probe_entries);
        let envelope = ProbeEnvelope {
            saved_at_epoch_ms: now_ms,
            results: kept
                .into_iter()
                .map(|r| (r.endpoint_id.clone(), r))
                .collect(),
        };
        self.write(KEY_PROBE_RESULTS, &envelope).await
    }

    /// 逐条按等级 TTL 过滤过期结果。
    pub async fn load_probe_results_at(&self, now_ms: i64) -> Vec<ProbeResult> {
        let Some(envelope) = self.read::<ProbeEnvelope>(KEY_PROBE_RESULTS).await else {
            return Vec::new();
        };
        envelope
            .results
            .into_values()
            .filter(|r| now_ms - r.measured_at_ms < self.ttl.ttl_ms(r.tier()))
            .collect()
    }

    pub async fn save_health_at(
        &self,
        entries: &HashMap<EndpointId, HealthMetrics>,
        now_ms: i64,
    ) -> Result<()> {
        let envelope = HealthEnvelope {
            saved_at_epoch_ms: now_ms,
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.write(KEY_HEALTH_SNAPSHOT, &envelope).await
    }

    pub async fn load_health_at(&self, now_ms: i64) -> Option<HashMap<EndpointId, HealthMetrics>> {
        let envelope: HealthEnvelope = self.read(KEY_HEALTH_SNAPSHOT).await?;
        let ttl_ms = self.cfg.health_snapshot_ttl_secs as i64 * 1000;
        if now_ms - envelope.saved_at_epoch_ms >= ttl_ms {
            tracing::debug!(target = "cache", "persisted health snapshot expired");
            return None;
        }
        Some(envelope.entries.into_iter().collect())
    }

    pub async fn save_last_known_good_at(&self, lkg: &LastKnownGood, now_ms: i64) -> Result<()> {
        let envelope = LastKnownGoodEnvelope {
            saved_at_epoch_ms: now_ms,
            last_known_good: lkg.clone(),
        };
        self.write(KEY_LAST_KNOWN_GOOD, &envelope).await
    }

    pub async fn load_last_known_good(&self) -> Option<LastKnownGood> {
        self.read::<LastKnownGoodEnvelope>(KEY_LAST_KNOWN_GOOD)
            .await
            .map(|e| e.last_known_good)
    }

    pub async fn save_breakers_at(
        &self,
        entries: &HashMap<EndpointId, CircuitSnapshot>,
        now_ms: i64,
    ) -> Result<()> {
        let envelope = BreakerEnvelope {
            saved_at_epoch_ms: now_ms,
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.write(KEY_BREAKER_SNAPSHOT, &envelope).await
    }

    /// 熔断快照不设有效期：冷却判断基于各条目自身的失败时间。
    pub async fn load_breakers(&self) -> Option<HashMap<EndpointId, CircuitSnapshot>> {
        self.read::<BreakerEnvelope>(KEY_BREAKER_SNAPSHOT)
            .await
            .map(|e| e.entries.into_iter().collect())
    }

    /// 删除所有键，并让清空前捕获的待写快照失效。
    pub async fn clear(&self) -> Result<()> {
        let mut written = self.written.lock().await;
        let fence = self.next_seq();
        for key in ALL_KEYS {
            self.store
                .remove(key)
                .await
                .with_context(|| format!("remove {key}"))?;
            written.insert(key, fence);
        }
        tracing::info!(target = "cache", "persisted cache cleared");
        Ok(())
    }

    pub fn spawn_save_candidates(self: &Arc<Self>, endpoints: Vec<Endpoint>) {
        self.spawn_ordered(KEY_CANDIDATES, move |cache| async move {
            cache.save_candidates_at(&endpoints, now_epoch_ms()).await
        });
    }

    pub fn spawn_save_probe_results(self: &Arc<Self>, results: Vec<ProbeResult>) {
        self.spawn_ordered(KEY_PROBE_RESULTS, move |cache| async move {
            cache.save_probe_results_at(&results, now_epoch_ms()).await
        });
    }

    pub fn spawn_save_health(self: &Arc<Self>, entries: HashMap<EndpointId, HealthMetrics>) {
        self.spawn_ordered(KEY_HEALTH_SNAPSHOT, move |cache| async move {
            cache.save_health_at(&entries, now_epoch_ms()).await
        });
    }

    pub fn spawn_save_last_known_good(self: &Arc<Self>, lkg: LastKnownGood) {
        self.spawn_ordered(KEY_LAST_KNOWN_GOOD, move |cache| async move {
            cache.save_last_known_good_at(&lkg, now_epoch_ms()).await
        });
    }

    pub fn spawn_save_breakers(self: &Arc<Self>, entries: HashMap<EndpointId, CircuitSnapshot>) {
        self.spawn_ordered(KEY_BREAKER_SNAPSHOT, move |cache| async move {
            cache.save_breakers_at(&entries, now_epoch_ms()).await
        });
    }
}

/// 超过上限时淘汰：等级分最低的先走，同分时最旧的先走。
pub fn cap_probe_results(results: &[ProbeResult], max_entries: usize) -> Vec<ProbeResult> {
    if results.len() <= max_entries {
        return results.to_vec();
    }
    let mut ordered = results.to_vec();
    ordered.sort_by(|a, b| {
        b.tier()
            .score()
            .cmp(&a.tier().score())
            .then_with(|| b.measured_at_ms.cmp(&a.measured_at_ms))
    });
    ordered.truncate(max_entries);
    ordered
}
