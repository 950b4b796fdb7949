//! 评分与选择
//!
//! 纯函数：输入探测结果与一份上下文快照，输出排序与胜出者，不产生副作用。
//! 上下文由 [`ScoringContext::capture`] 从登记表和熔断器采集。

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use crate::core::config::model::ScoringCfg;

use super::{
    circuit_breaker::CircuitBreaker,
    health::{HealthMetrics, HealthRegistry},
    model::{Endpoint, EndpointId, ProbeResult, QualityTier},
};

pub const BASE_SCORE: f64 = 50.0;
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 200.0;

const LATENCY_WEIGHT: f64 = 0.005;
const SUCCESS_RATE_WEIGHT: f64 = 40.0;
const RELIABLE_BONUS: f64 = 10.0;
const RECENT_SUCCESS_BONUS: f64 = 2.0;
const RECENT_SUCCESS_CAP: f64 = 10.0;
const CIRCUIT_OPEN_PENALTY: f64 = 100.0;
const UNTESTED_BONUS: f64 = 5.0;
const PROTOCOL_BONUS: f64 = 3.0;
const REGION_BONUS: f64 = 2.0;

/// 最近成功计数的统计窗口
pub const RECENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub health: HashMap<EndpointId, HealthMetrics>,
    pub open_ids: HashSet<EndpointId>,
    /// 最近 24 小时内的成功连接次数
    pub recent_successes: HashMap<EndpointId, u32>,
    pub preferred_protocols: Vec<String>,
    pub preferred_regions: Vec<String>,
    pub now_ms: i64,
}

impl ScoringContext {
    pub fn capture(
        registry: &HealthRegistry,
        breaker: &CircuitBreaker,
        recent_successes: HashMap<EndpointId, u32>,
        prefs: &ScoringCfg,
        now_ms: i64,
    ) -> Self {
        Self {
            health: registry.snapshot(),
            open_ids: breaker.open_ids_at(now_ms).into_iter().collect(),
            recent_successes,
            preferred_protocols: prefs.preferred_protocols.clone(),
            preferred_regions: prefs.preferred_regions.clone(),
            now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub endpoint: Endpoint,
    pub result: ProbeResult,
    pub score: f64,
    /// 没有任何成功探测时按延迟兜底选出
    pub last_resort: bool,
}

fn band_bonus(tier: QualityTier) -> f64 {
    match tier {
        QualityTier::Excellent => 30.0,
        QualityTier::Good => 20.0,
        QualityTier::Fair => 10.0,
        QualityTier::Poor => 0.0,
        QualityTier::Bad => -15.0,
        QualityTier::Failed => 0.0,
    }
}

fn measured_bonus(tier: QualityTier) -> f64 {
    match tier {
        QualityTier::Excellent => 15.0,
        QualityTier::Good => 10.0,
        QualityTier::Fair => 5.0,
        QualityTier::Poor => 2.0,
        QualityTier::Bad | QualityTier::Failed => 0.0,
    }
}

fn connect_time_term(avg_connect_ms: f64) -> f64 {
    if avg_connect_ms < 1_000.0 {
        10.0
    } else if avg_connect_ms < 2_000.0 {
        5.0
    } else if avg_connect_ms < 4_000.0 {
        0.0
    } else {
        -10.0
    }
}

fn matches_any(value: Option<&str>, preferred: &[String]) -> bool {
    match value {
        Some(v) => preferred.iter().any(|p| p.eq_ignore_ascii_case(v)),
        None => false,
    }
}

/// 计算单个候选的分数；没有成功探测的结果记 0 分。
pub fn score(endpoint: &Endpoint, result: &ProbeResult, ctx: &ScoringContext) -> f64 {
    let Some(latency_ms) = result.latency_ms() else {
        return MIN_SCORE;
    };
    let tier = result.tier();
    let id = &endpoint.id;

    let mut s = BASE_SCORE;
    s += band_bonus(tier);
    s += measured_bonus(tier);
    s -= latency_ms as f64 * LATENCY_WEIGHT;

    match ctx.health.get(id) {
        Some(m) if m.has_history() => {
            s += m.success_rate().powf(1.5) * SUCCESS_RATE_WEIGHT;
            if m.connect_count > 0 {
                s += connect_time_term(m.avg_connect_ms);
            }
            if m.is_reliable() {
                s += RELIABLE_BONUS;
            }
        }
        _ => s += UNTESTED_BONUS,
    }

    let recent = ctx.recent_successes.get(id).copied().unwrap_or(0);
    s += (recent as f64 * RECENT_SUCCESS_BONUS).min(RECENT_SUCCESS_CAP);

    if ctx.open_ids.contains(id) {
        s -= CIRCUIT_OPEN_PENALTY;
    }
    if matches_any(endpoint.hints.protocol.as_deref(), &ctx.preferred_protocols) {
        s += PROTOCOL_BONUS;
    }
    if matches_any(endpoint.hints.region.as_deref(), &ctx.preferred_regions) {
        s += REGION_BONUS;
    }
    s.clamp(MIN_SCORE, MAX_SCORE)
}

fn by_score(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.result.outcome.sort_key().cmp(&b.result.outcome.sort_key()))
        .then_with(|| a.endpoint.id.cmp(&b.endpoint.id))
}

fn by_sort_key(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.result
        .outcome
        .sort_key()
        .cmp(&b.result.outcome.sort_key())
        .then_with(|| a.endpoint.id.cmp(&b.endpoint.id))
}

/// 完整排序：成功探测按分数降序，其后是失败结果按延迟排序。熔断打开的端点不出现。
pub fn rank(results: &[(Endpoint, ProbeResult)], ctx: &ScoringContext) -> Vec<ScoredCandidate> {
    let (mut ok, mut failed): (Vec<ScoredCandidate>, Vec<ScoredCandidate>) = results
        .iter()
        .filter(|(ep, _)| !ctx.open_ids.contains(&ep.id))
        .map(|(ep, r)| ScoredCandidate {
            endpoint: ep.clone(),
            result: r.clone(),
            score: score(ep, r, ctx),
            last_resort: !r.is_success(),
        })
        .partition(|c| c.result.is_success());
    ok.sort_by(by_score);
    failed.sort_by(by_sort_key);
    ok.extend(failed);
    ok
}

/// 选出最佳候选；全部失败时返回延迟值最低的结果作为兜底。
pub fn select(results: &[(Endpoint, ProbeResult)], ctx: &ScoringContext) -> Option<ScoredCandidate> {
    rank(results, ctx).into_iter().next()
}
