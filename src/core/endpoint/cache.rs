use std::{collections::HashMap, sync::Mutex};

use crate::core::config::model::TierTtlCfg;

use super::model::QualityTier;

/// 缓存条目：值、写入时间与按等级派生的 TTL。
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at_ms: i64,
    pub ttl_ms: i64,
}

impl<T> CacheEntry<T> {
    pub fn expires_at_ms(&self) -> i64 {
        self.written_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// 质量等级到 TTL（毫秒）的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTtl {
    excellent_ms: i64,
    good_ms: i64,
    fair_ms: i64,
    poor_ms: i64,
    bad_ms: i64,
    failed_ms: i64,
}

impl TierTtl {
    pub fn ttl_ms(&self, tier: QualityTier) -> i64 {
        match tier {
            QualityTier::Excellent => self.excellent_ms,
            QualityTier::Good => self.good_ms,
            QualityTier::Fair => self.fair_ms,
            QualityTier::Poor => self.poor_ms,
            QualityTier::Bad => self.bad_ms,
            QualityTier::Failed => self.failed_ms,
        }
    }
}

impl From<&TierTtlCfg> for TierTtl {
    fn from(cfg: &TierTtlCfg) -> Self {
        let ms = |secs: u64| secs as i64 * 1000;
        Self {
            excellent_ms: ms(cfg.excellent_secs),
            good_ms: ms(cfg.good_secs),
            fair_ms: ms(cfg.fair_secs),
            poor_ms: ms(cfg.poor_secs),
            bad_ms: ms(cfg.bad_secs),
            failed_ms: ms(cfg.failed_secs),
        }
    }
}

impl Default for TierTtl {
    fn default() -> Self {
        Self::from(&TierTtlCfg::default())
    }
}

/// 带惰性过期的字符串键缓存。读取时淘汰过期条目，维护任务周期性清扫。
#[derive(Debug)]
pub struct TtlCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> Default for TtlCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_at(&self, key: &str, now_ms: i64) -> Option<T> {
        let mut guard = self.entries.lock().ok()?;
        let expired = guard.get(key)?.is_expired(now_ms);
        if expired {
            guard.remove(key);
            return None;
        }
        guard.get(key).map(|e| e.value.clone())
    }

    pub fn insert_at(&self, key: impl Into<String>, value: T, ttl_ms: i64, now_ms: i64) {
        self.insert_entry(
            key,
            CacheEntry {
                value,
                written_at_ms: now_ms,
                ttl_ms,
            },
        );
    }

    pub fn insert_entry(&self, key: impl Into<String>, entry: CacheEntry<T>) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.insert(key.into(), entry);
        }
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut g| g.remove(key))
            .map(|e| e.value)
    }

    /// 清除过期条目，返回清除数量。
    pub fn prune_at(&self, now_ms: i64) -> usize {
        let Ok(mut guard) = self.entries.lock() else {
            return 0;
        };
        let before = guard.len();
        guard.retain(|_, e| !e.is_expired(now_ms));
        before - guard.len()
    }

    /// 未过期条目的快照。
    pub fn entries_at(&self, now_ms: i64) -> Vec<(String, CacheEntry<T>)> {
        self.entries
            .lock()
            .map(|g| {
                g.iter()
                    .filter(|(_, e)| !e.is_expired(now_ms))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.entries.lock() {
            g.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::endpoint::model::ProbeOutcome;

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.insert_at("k", 7, 1_000, 0);
        assert_eq!(cache.get_at("k", 999), Some(7));
        assert_eq!(cache.get_at("k", 1_000), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn prune_sweeps_only_expired() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.insert_at("short", 1, 100, 0);
        cache.insert_at("long", 2, 10_000, 0);
        assert_eq!(cache.prune_at(500), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries_at(500).len(), 1);
    }

    #[test]
    fn faster_results_live_longer() {
        let ttl = TierTtl::default();
        let fast = ProbeOutcome::Measured { latency_ms: 50 }.tier();
        let slow = ProbeOutcome::Measured { latency_ms: 700 }.tier();
        let fast_entry = CacheEntry {
            value: (),
            written_at_ms: 0,
            ttl_ms: ttl.ttl_ms(fast),
        };
        let slow_entry = CacheEntry {
            value: (),
            written_at_ms: 0,
            ttl_ms: ttl.ttl_ms(slow),
        };
        assert!(fast_entry.expires_at_ms() > slow_entry.expires_at_ms());
        assert!(ttl.ttl_ms(QualityTier::Bad) > ttl.ttl_ms(QualityTier::Failed));
    }
}
