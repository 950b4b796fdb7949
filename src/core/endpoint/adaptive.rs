use std::{sync::Arc, time::Duration};

use rand::Rng;

use crate::core::config::model::{ReconnectCfg, RetryCfg};

use super::{
    health::{HealthMetrics, HealthRegistry},
    model::EndpointId,
};

const LOW_RATE_TIMEOUT_THRESHOLD: f64 = 0.6;
const LOW_RATE_TIMEOUT_FACTOR: f64 = 1.2;
const FAIL_FAST_RATE: f64 = 0.3;
const FULL_BUDGET_RATE: f64 = 0.8;
const BAD_HISTORY_RATE: f64 = 0.5;
const BAD_HISTORY_MIN_ATTEMPTS: u32 = 3;

/// 按平均连接耗时得到的超时倍率：历史越快，超时越短。
fn connect_time_multiplier(avg_connect_ms: f64) -> f64 {
    if avg_connect_ms < 1_000.0 {
        0.6
    } else if avg_connect_ms < 2_000.0 {
        0.8
    } else if avg_connect_ms < 4_000.0 {
        1.0
    } else if avg_connect_ms < 6_000.0 {
        1.2
    } else {
        1.5
    }
}

pub fn timeout_ms_for(metrics: Option<&HealthMetrics>, cfg: &RetryCfg) -> u64 {
    let Some(m) = metrics.filter(|m| m.has_history()) else {
        return cfg.base_timeout_ms;
    };
    let mut multiplier = if m.connect_count > 0 {
        connect_time_multiplier(m.avg_connect_ms)
    } else {
        1.0
    };
    if m.success_rate() < LOW_RATE_TIMEOUT_THRESHOLD {
        multiplier *= LOW_RATE_TIMEOUT_FACTOR;
    }
    let raw = (cfg.base_timeout_ms as f64 * multiplier).round() as u64;
    raw.clamp(cfg.min_timeout_ms, cfg.max_timeout_ms.max(cfg.min_timeout_ms))
}

pub fn retries_for_metrics(metrics: Option<&HealthMetrics>, cfg: &RetryCfg) -> u32 {
    let max = cfg.max_retries.max(1);
    let reduced = max.saturating_sub(1).max(1);
    match metrics.filter(|m| m.has_history()) {
        Some(m) if m.success_rate() < FAIL_FAST_RATE => 1,
        Some(m) if m.success_rate() > FULL_BUDGET_RATE => max,
        _ => reduced,
    }
}

/// 重试间隔（毫秒），jitter 由调用方给出以便测试。attempt 从 0 开始。
pub fn retry_delay_ms_with(
    attempt: u32,
    metrics: Option<&HealthMetrics>,
    cfg: &RetryCfg,
    jitter_ms: u64,
) -> u64 {
    let pow = 2f64.powi(attempt.min(16) as i32);
    let mut delay = cfg.base_delay_ms as f64 * pow;
    if let Some(m) = metrics {
        if m.total_attempts >= BAD_HISTORY_MIN_ATTEMPTS && m.success_rate() < BAD_HISTORY_RATE {
            // 历史差的端点更快放弃
            delay *= 0.5;
        }
    }
    let delay = delay.round() as u64 + jitter_ms;
    delay.clamp(cfg.min_delay_ms, cfg.max_delay_ms.max(cfg.min_delay_ms))
}

/// 重连步骤之间的退避（毫秒），step 从 0 开始。
pub fn reconnect_backoff_ms_with(step: u32, cfg: &ReconnectCfg, jitter_ms: u64) -> u64 {
    let pow = 2u64.saturating_pow(step.min(16));
    cfg.backoff_base_ms
        .saturating_mul(pow)
        .saturating_add(jitter_ms)
        .min(cfg.backoff_max_ms)
}

/// 自适应重试与超时计算，基于健康登记表的历史。
#[derive(Clone)]
pub struct AdaptiveCalculator {
    retry: RetryCfg,
    reconnect: ReconnectCfg,
    registry: Arc<HealthRegistry>,
}

impl AdaptiveCalculator {
    pub fn new(retry: RetryCfg, reconnect: ReconnectCfg, registry: Arc<HealthRegistry>) -> Self {
        Self {
            retry,
            reconnect,
            registry,
        }
    }

    pub fn timeout_for(&self, id: &EndpointId) -> Duration {
        let metrics = self.registry.get(id);
        Duration::from_millis(timeout_ms_for(metrics.as_ref(), &self.retry))
    }

    pub fn retries_for(&self, id: &EndpointId) -> u32 {
        let metrics = self.registry.get(id);
        retries_for_metrics(metrics.as_ref(), &self.retry)
    }

    pub fn retry_delay(&self, attempt: u32, id: &EndpointId) -> Duration {
        let metrics = self.registry.get(id);
        let jitter = random_jitter(self.retry.jitter_ms);
        Duration::from_millis(retry_delay_ms_with(attempt, metrics.as_ref(), &self.retry, jitter))
    }

    pub fn reconnect_backoff(&self, step: u32) -> Duration {
        let jitter = random_jitter(self.retry.jitter_ms);
        Duration::from_millis(reconnect_backoff_ms_with(step, &self.reconnect, jitter))
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.verify_timeout_ms)
    }
}

fn random_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_ms)
    }
}
