//! 端点健康登记表
//!
//! 每个端点维护滚动统计：成功率、延迟历史与可靠性标记。
//! 所有更新都是追加式算术，读取返回快照，不持有内部引用。

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::model::{now_epoch_ms, EndpointId, ProbeOutcome};

/// 延迟环形缓冲区容量
pub const LATENCY_RING_CAPACITY: usize = 20;

const RELIABLE_MIN_ATTEMPTS: u32 = 3;
const RELIABLE_MIN_RATE: f64 = 0.7;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub cumulative_latency_ms: u64,
    /// 参与平均延迟计算的样本数
    pub latency_count: u32,
    pub avg_latency_ms: f64,
    pub latency_samples: VecDeque<u32>,
    pub last_attempt_ms: i64,
    pub connect_count: u32,
    pub cumulative_connect_ms: u64,
    pub avg_connect_ms: f64,
}

impl HealthMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        (self.successful_attempts as f64 / self.total_attempts as f64).clamp(0.0, 1.0)
    }

    pub fn is_reliable(&self) -> bool {
        self.total_attempts >= RELIABLE_MIN_ATTEMPTS && self.success_rate() > RELIABLE_MIN_RATE
    }

    pub fn has_history(&self) -> bool {
        self.total_attempts > 0
    }

    fn push_latency(&mut self, latency_ms: u32) {
        self.cumulative_latency_ms = self.cumulative_latency_ms.saturating_add(latency_ms as u64);
        self.latency_count = self.latency_count.saturating_add(1);
        self.avg_latency_ms = self.cumulative_latency_ms as f64 / self.latency_count as f64;
        if self.latency_samples.len() >= LATENCY_RING_CAPACITY {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    fn count_attempt(&mut self, success: bool, now_ms: i64) {
        self.total_attempts = self.total_attempts.saturating_add(1);
        if success {
            self.successful_attempts = self.successful_attempts.saturating_add(1);
        }
        self.last_attempt_ms = now_ms;
    }
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    entries: DashMap<EndpointId, HealthMetrics>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次探测；探测同样计为一次尝试，成功与否取决于是否测得延迟。
    pub fn record_probe(&self, id: &EndpointId, outcome: &ProbeOutcome) {
        self.record_probe_at(id, outcome, now_epoch_ms());
    }

    pub fn record_probe_at(&self, id: &EndpointId, outcome: &ProbeOutcome, now_ms: i64) {
        let mut entry = self.entries.entry(id.clone()).or_default();
        entry.count_attempt(outcome.is_success(), now_ms);
        if let Some(latency) = outcome.latency_ms() {
            entry.push_latency(latency);
        }
    }

    /// 记录一次连接尝试；成功的尝试计入平均连接耗时。
    pub fn record_attempt(&self, id: &EndpointId, success: bool, duration_ms: u64) {
        self.record_attempt_at(id, success, duration_ms, now_epoch_ms());
    }

    pub fn record_attempt_at(&self, id: &EndpointId, success: bool, duration_ms: u64, now_ms: i64) {
        let mut entry = self.entries.entry(id.clone()).or_default();
        entry.count_attempt(success, now_ms);
        if success {
            entry.connect_count = entry.connect_count.saturating_add(1);
            entry.cumulative_connect_ms = entry.cumulative_connect_ms.saturating_add(duration_ms);
            entry.avg_connect_ms = entry.cumulative_connect_ms as f64 / entry.connect_count as f64;
        }
    }

    pub fn get(&self, id: &EndpointId) -> Option<HealthMetrics> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn snapshot(&self) -> HashMap<EndpointId, HealthMetrics> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// 合并持久化快照；内存中更新的条目不会被覆盖。
    pub fn restore(&self, persisted: HashMap<EndpointId, HealthMetrics>) -> usize {
        let mut restored = 0;
        for (id, metrics) in persisted {
            let newer = match self.entries.get(&id) {
                Some(existing) => metrics.last_attempt_ms > existing.last_attempt_ms,
                None => true,
            };
            if newer {
                self.entries.insert(id, metrics);
                restored += 1;
            }
        }
        restored
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 删除长期未触及且样本不足的条目，返回删除数量。
    pub fn prune_stale_at(&self, now_ms: i64, max_age_ms: i64, min_attempts: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, m| {
            let stale = now_ms - m.last_attempt_ms > max_age_ms;
            !(stale && m.total_attempts < min_attempts)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(target = "endpoint", removed, "stale health entries pruned");
        }
        removed
    }

    /// 可靠端点，按成功率降序、平均延迟升序排列。
    pub fn reliable_ids(&self) -> Vec<EndpointId> {
        let mut reliable: Vec<(EndpointId, HealthMetrics)> = self
            .entries
            .iter()
            .filter(|e| e.value().is_reliable())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        sort_by_reliability(&mut reliable);
        reliable.into_iter().map(|(id, _)| id).collect()
    }

    /// 全部有历史的端点，排序规则同 [`reliable_ids`](Self::reliable_ids)。
    pub fn ids_by_reliability(&self) -> Vec<EndpointId> {
        let mut all: Vec<(EndpointId, HealthMetrics)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        sort_by_reliability(&mut all);
        all.into_iter().map(|(id, _)| id).collect()
    }
}

fn sort_by_reliability(items: &mut [(EndpointId, HealthMetrics)]) {
    items.sort_by(|(a_id, a), (b_id, b)| {
        b.success_rate()
            .total_cmp(&a.success_rate())
            .then_with(|| latency_or_max(a).total_cmp(&latency_or_max(b)))
            .then_with(|| a_id.cmp(b_id))
    });
}

fn latency_or_max(m: &HealthMetrics) -> f64 {
    if m.latency_count == 0 {
        f64::MAX
    } else {
        m.avg_latency_ms
    }
}
