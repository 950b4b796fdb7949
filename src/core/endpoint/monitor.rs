//! 后台监控定时器
//!
//! 三个固定间隔的任务：健康检查、连接质量监控、缓存维护。手动断开抑制窗口内
//! 或已有选择/连接/重连在运行时，本轮直接跳过。质量连续下降时，若缓存中存在
//! 明显更好的端点则主动切换。

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};

use crate::core::config::model::{CacheCfg, MonitorCfg, ScoringCfg};
use crate::events::structured::EventBus;

use super::{
    circuit_breaker::CircuitBreaker,
    connect::{ConnectRequest, ConnectionManager},
    events::{emit_cache_pruned, emit_proactive_switch},
    health::HealthRegistry,
    model::{dedupe_endpoints, now_epoch_ms, CandidatePool, Endpoint, ProbeResult},
    persist::PersistentCache,
    probe::ProbeEngine,
    reconnect::ReconnectController,
    scoring::{self, ScoringContext},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    SkippedSuppressed,
    SkippedBusy,
    /// 没有可做的工作（例如没有活动端点）
    Idle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityStats {
    pub current_score: f64,
    pub average_score: f64,
    pub degradation_count: u32,
    pub sample_count: usize,
}

#[derive(Debug, Default)]
struct QualityWindow {
    samples: VecDeque<f64>,
    degradation_count: u32,
    consecutive_degradations: u32,
}

impl QualityWindow {
    fn push(&mut self, score: f64, limit: usize, threshold: f64) {
        if self.samples.len() >= limit.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(score);
        if score < threshold {
            self.degradation_count = self.degradation_count.saturating_add(1);
            self.consecutive_degradations = self.consecutive_degradations.saturating_add(1);
        } else {
            self.consecutive_degradations = 0;
        }
    }

    fn stats(&self) -> QualityStats {
        let sample_count = self.samples.len();
        let average_score = if sample_count == 0 {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / sample_count as f64
        };
        QualityStats {
            current_score: self.samples.back().copied().unwrap_or(0.0),
            average_score,
            degradation_count: self.degradation_count,
            sample_count,
        }
    }
}

/// 监控依赖的服务句柄
pub struct MonitorDeps {
    pub probe: ProbeEngine,
    pub registry: Arc<HealthRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub connector: Arc<ConnectionManager>,
    pub reconnect: Arc<ReconnectController>,
    pub persist: Arc<PersistentCache>,
    pub pool: Arc<CandidatePool>,
    pub select_gate: Arc<tokio::sync::Mutex<()>>,
    pub events: Arc<dyn EventBus>,
}

pub struct Monitor {
    cfg: MonitorCfg,
    cache_cfg: CacheCfg,
    scoring: ScoringCfg,
    probe_timeout: Duration,
    deps: MonitorDeps,
    quality: Mutex<QualityWindow>,
}

impl Monitor {
    pub fn new(
        cfg: MonitorCfg,
        cache_cfg: CacheCfg,
        scoring: ScoringCfg,
        probe_timeout: Duration,
        deps: MonitorDeps,
    ) -> Self {
        Self {
            cfg,
            cache_cfg,
            scoring,
            probe_timeout,
            deps,
            quality: Mutex::new(QualityWindow::default()),
        }
    }

    fn gate(&self, now_ms: i64) -> Option<TickOutcome> {
        if self.deps.reconnect.is_suppressed_at(now_ms) {
            return Some(TickOutcome::SkippedSuppressed);
        }
        let selecting = self.deps.select_gate.try_lock().is_err();
        if selecting || self.deps.connector.is_busy() || self.deps.reconnect.is_running() {
            return Some(TickOutcome::SkippedBusy);
        }
        None
    }

    /// 重新探测活动端点与若干可靠端点（绕过缓存）。
    pub async fn health_check_tick_at(&self, now_ms: i64) -> TickOutcome {
        if let Some(skip) = self.gate(now_ms) {
            tracing::debug!(target = "monitor", outcome = ?skip, "health check skipped");
            return skip;
        }
        let mut targets: Vec<Endpoint> = self.deps.connector.active_endpoint().into_iter().collect();
        targets.extend(
            self.deps
                .registry
                .reliable_ids()
                .into_iter()
                .filter(|id| !self.deps.breaker.is_open_at(id, now_ms))
                .filter_map(|id| self.deps.pool.find(&id))
                .take(self.cfg.health_check_sample_size),
        );
        let targets = dedupe_endpoints(&targets);
        if targets.is_empty() {
            return TickOutcome::Idle;
        }
        let results = join_all(
            targets
                .iter()
                .map(|ep| self.deps.probe.probe_fresh(ep, self.probe_timeout)),
        )
        .await;
        let healthy = results.iter().filter(|r| r.is_success()).count();
        tracing::info!(
            target = "monitor",
            probed = results.len(),
            healthy,
            "health check finished"
        );
        TickOutcome::Ran
    }

    /// 探测活动端点并记录质量分，连续下降时尝试主动切换。
    pub async fn quality_tick_at(&self, now_ms: i64) -> TickOutcome {
        if let Some(skip) = self.gate(now_ms) {
            tracing::debug!(target = "monitor", outcome = ?skip, "quality check skipped");
            return skip;
        }
        let Some(active) = self.deps.connector.active_endpoint() else {
            return TickOutcome::Idle;
        };
        let result = self.deps.probe.probe_fresh(&active, self.probe_timeout).await;
        let quality = result.tier().score() as f64;
        let should_switch = {
            let mut window = self.quality.lock().unwrap_or_else(PoisonError::into_inner);
            window.push(quality, self.cfg.quality_sample_limit, self.cfg.degradation_threshold);
            let trigger = window.consecutive_degradations >= self.cfg.degradation_trigger.max(1);
            if trigger {
                window.consecutive_degradations = 0;
            }
            trigger
        };
        tracing::debug!(target = "monitor", endpoint = %active.id, quality, "quality sample recorded");
        if should_switch {
            self.try_proactive_switch(&active, &result, now_ms).await;
        }
        TickOutcome::Ran
    }

    async fn try_proactive_switch(
        &self,
        active: &Endpoint,
        active_result: &ProbeResult,
        now_ms: i64,
    ) {
        let ctx = ScoringContext::capture(
            &self.deps.registry,
            &self.deps.breaker,
            self.deps.connector.recent_successes_at(now_ms),
            &self.scoring,
            now_ms,
        );
        let current_score = scoring::score(active, active_result, &ctx);
        let alternatives: Vec<_> = self
            .deps
            .pool
            .snapshot()
            .into_iter()
            .filter(|ep| ep.id != active.id)
            .filter_map(|ep| self.deps.probe.cached(&ep.id).map(|r| (ep, r)))
            .filter(|(_, r)| r.is_success())
            .collect();
        let Some(best) = scoring::select(&alternatives, &ctx) else {
            tracing::debug!(target = "monitor", "quality degraded but no cached alternative");
            return;
        };
        if best.score < current_score + self.cfg.switch_margin {
            tracing::debug!(
                target = "monitor",
                current_score,
                best_score = best.score,
                "quality degraded but alternative not better enough"
            );
            return;
        }
        emit_proactive_switch(self.deps.events.as_ref(), &active.id, &best.endpoint.id);
        let req = ConnectRequest {
            check_permission: false,
        };
        if let Err(err) = self.deps.connector.connect(&best.endpoint, req).await {
            tracing::warn!(
                target = "monitor",
                endpoint = %best.endpoint.id,
                category = err.category(),
                "proactive switch failed"
            );
        }
    }

    /// 清理过期探测缓存与陈旧健康条目，然后后台持久化快照。
    pub async fn maintenance_tick_at(&self, now_ms: i64) -> TickOutcome {
        if let Some(skip) = self.gate(now_ms) {
            tracing::debug!(target = "monitor", outcome = ?skip, "maintenance skipped");
            return skip;
        }
        let probe_entries = self.deps.probe.prune_expired_at(now_ms);
        let health_entries = self.deps.registry.prune_stale_at(
            now_ms,
            self.cache_cfg.stale_health_secs as i64 * 1000,
            self.cache_cfg.stale_health_min_attempts,
        );
        emit_cache_pruned(self.deps.events.as_ref(), probe_entries, health_entries);
        self.deps.persist.spawn_save_health(self.deps.registry.snapshot());
        self.deps
            .persist
            .spawn_save_breakers(self.deps.breaker.snapshot_all());
        self.deps
            .persist
            .spawn_save_probe_results(self.deps.probe.cache_snapshot_at(now_ms));
        TickOutcome::Ran
    }

    pub fn quality_stats(&self) -> QualityStats {
        self.quality
            .lock()
            .map(|w| w.stats())
            .unwrap_or_default()
    }

    pub fn reset_quality(&self) {
        if let Ok(mut w) = self.quality.lock() {
            *w = QualityWindow::default();
        }
    }
}

/// 后台监控任务句柄，`shutdown` 或 drop 时停止。
pub struct MonitorHandle {
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum TickKind {
    Health,
    Quality,
    Maintenance,
}

impl MonitorHandle {
    pub fn spawn(monitor: Arc<Monitor>) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let secs = |s: u64| Duration::from_secs(s.max(1));
        let plan = [
            (TickKind::Health, secs(monitor.cfg.health_check_interval_secs)),
            (TickKind::Quality, secs(monitor.cfg.quality_interval_secs)),
            (TickKind::Maintenance, secs(monitor.cfg.maintenance_interval_secs)),
        ];
        let tasks = plan
            .into_iter()
            .map(|(kind, period)| {
                tokio::spawn(run_loop(
                    monitor.clone(),
                    kind,
                    period,
                    stop_flag.clone(),
                    notify.clone(),
                ))
            })
            .collect();
        tracing::info!(target = "monitor", "monitor timers started");
        Self {
            stop_flag,
            notify,
            tasks,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub async fn shutdown(mut self) {
        self.signal_stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!(target = "monitor", "monitor timers stopped");
    }

    fn signal_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.signal_stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_loop(
    monitor: Arc<Monitor>,
    kind: TickKind,
    period: Duration,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        // 先登记唤醒再检查标志，避免错过 tick 执行期间发出的停止信号
        notified.as_mut().enable();
        if stop_flag.load(Ordering::Acquire) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut notified => {}
        }
        if stop_flag.load(Ordering::Acquire) {
            break;
        }
        let now_ms = now_epoch_ms();
        let outcome = match kind {
            TickKind::Health => monitor.health_check_tick_at(now_ms).await,
            TickKind::Quality => monitor.quality_tick_at(now_ms).await,
            TickKind::Maintenance => monitor.maintenance_tick_at(now_ms).await,
        };
        tracing::trace!(target = "monitor", kind = ?kind, outcome = ?outcome, "tick finished");
    }
}
