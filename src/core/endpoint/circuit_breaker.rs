//! 端点熔断器模块
//!
//! 为每个端点维护连续失败计数与熔断状态。连续失败达到阈值后熔断打开，
//! 冷却期结束后在下一次查询时惰性进入半开状态；半开状态下一次成功即关闭，
//! 一次失败则重新打开。熔断打开期间该端点不参与探测与选择。
//! 状态可导出为快照并在重启后恢复，恢复后的冷却判断仍基于原失败时间。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::core::config::model::BreakerCfg;
use crate::events::structured::{EventBus, NoopEventBus};

use super::{
    events::{emit_breaker_closed, emit_breaker_half_open, emit_breaker_tripped},
    model::{now_epoch_ms, EndpointId},
};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    /// 正常，允许使用
    Closed,
    /// 熔断打开，端点视为不可用
    Open,
    /// 冷却期已过，等待下一次结果
    HalfOpen,
}

/// 单个端点的熔断快照（用于观测、持久化与测试）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_ms: i64,
    pub half_open_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
struct EndpointCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_ms: i64,
    half_open_at_ms: Option<i64>,
}

impl Default for EndpointCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_ms: 0,
            half_open_at_ms: None,
        }
    }
}

impl EndpointCircuit {
    fn cooldown_elapsed(&self, now_ms: i64, cooldown_ms: i64) -> bool {
        now_ms - self.last_failure_ms > cooldown_ms
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_ms: self.last_failure_ms,
            half_open_at_ms: self.half_open_at_ms,
        }
    }

    fn from_snapshot(snap: &CircuitSnapshot) -> Self {
        Self {
            state: snap.state,
            consecutive_failures: snap.consecutive_failures,
            last_failure_ms: snap.last_failure_ms,
            half_open_at_ms: snap.half_open_at_ms,
        }
    }

    fn is_pristine(&self) -> bool {
        self.state == CircuitState::Closed && self.consecutive_failures == 0
    }
}

#[derive(Debug, Clone)]
struct BreakerSettings {
    enabled: bool,
    failure_threshold: u32,
    cooldown_ms: i64,
}

impl From<&BreakerCfg> for BreakerSettings {
    fn from(cfg: &BreakerCfg) -> Self {
        Self {
            enabled: cfg.enabled,
            failure_threshold: cfg.failure_threshold.max(1),
            cooldown_ms: cfg.cooldown_secs as i64 * 1000,
        }
    }
}

/// 端点熔断器管理器
pub struct CircuitBreaker {
    settings: BreakerSettings,
    states: Mutex<HashMap<EndpointId, EndpointCircuit>>,
    events: Arc<dyn EventBus>,
}

impl CircuitBreaker {
    pub fn new(cfg: &BreakerCfg, events: Arc<dyn EventBus>) -> Self {
        Self {
            settings: BreakerSettings::from(cfg),
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// 熔断是否处于打开状态（冷却期未过）。
    pub fn is_open(&self, id: &EndpointId) -> bool {
        self.is_open_at(id, now_epoch_ms())
    }

    pub fn is_open_at(&self, id: &EndpointId, now_ms: i64) -> bool {
        matches!(self.state_at(id, now_ms), CircuitState::Open)
    }

    pub fn state(&self, id: &EndpointId) -> CircuitState {
        self.state_at(id, now_epoch_ms())
    }

    /// 查询状态，冷却期已过的 Open 在这里迁移为 HalfOpen。
    pub fn state_at(&self, id: &EndpointId, now_ms: i64) -> CircuitState {
        if !self.settings.enabled {
            return CircuitState::Closed;
        }
        let mut states = match self.states.lock() {
            Ok(s) => s,
            Err(_) => {
                tracing::warn!(target = "endpoint", "circuit breaker state lock poisoned");
                return CircuitState::Closed;
            }
        };
        let Some(circuit) = states.get_mut(id) else {
            return CircuitState::Closed;
        };
        if circuit.state == CircuitState::Open
            && circuit.cooldown_elapsed(now_ms, self.settings.cooldown_ms)
        {
            circuit.state = CircuitState::HalfOpen;
            circuit.half_open_at_ms = Some(now_ms);
            emit_breaker_half_open(self.events.as_ref(), id);
        }
        circuit.state
    }

    /// 记录一次成功；返回状态是否有变化（清除了失败计数或关闭了熔断）。
    pub fn record_success(&self, id: &EndpointId) -> bool {
        self.record_success_at(id, now_epoch_ms())
    }

    pub fn record_success_at(&self, id: &EndpointId, now_ms: i64) -> bool {
        if !self.settings.enabled {
            return false;
        }
        // 先做惰性迁移，保证状态与时间一致
        self.state_at(id, now_ms);
        let mut states = match self.states.lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let circuit = states.entry(id.clone()).or_default();
        let changed = !circuit.is_pristine();
        let was_tripped = circuit.state != CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.state = CircuitState::Closed;
        circuit.half_open_at_ms = None;
        if was_tripped {
            emit_breaker_closed(self.events.as_ref(), id);
        }
        changed
    }

    pub fn record_failure(&self, id: &EndpointId) {
        self.record_failure_at(id, now_epoch_ms());
    }

    pub fn record_failure_at(&self, id: &EndpointId, now_ms: i64) {
        if !self.settings.enabled {
            return;
        }
        self.state_at(id, now_ms);
        let mut states = match self.states.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        let circuit = states.entry(id.clone()).or_default();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure_ms = now_ms;
        let trip = match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures >= self.settings.failure_threshold,
            CircuitState::HalfOpen => true,
            // 已打开：刷新失败时间，延长冷却
            CircuitState::Open => false,
        };
        if trip {
            circuit.state = CircuitState::Open;
            circuit.half_open_at_ms = None;
            emit_breaker_tripped(self.events.as_ref(), id, circuit.consecutive_failures);
        }
    }

    /// 手动重置指定端点的熔断状态
    pub fn reset(&self, id: &EndpointId) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(circuit) = states.remove(id) {
                if circuit.state != CircuitState::Closed {
                    tracing::info!(target = "endpoint", endpoint = %id, "circuit breaker manually reset");
                }
            }
        }
    }

    /// 清除所有熔断状态
    pub fn clear_all(&self) {
        if let Ok(mut states) = self.states.lock() {
            let count = states.len();
            states.clear();
            if count > 0 {
                tracing::info!(
                    target = "endpoint",
                    cleared_count = count,
                    "all circuit breaker states cleared"
                );
            }
        }
    }

    /// 当前处于打开状态的端点
    pub fn open_ids(&self) -> Vec<EndpointId> {
        self.open_ids_at(now_epoch_ms())
    }

    pub fn open_ids_at(&self, now_ms: i64) -> Vec<EndpointId> {
        let ids: Vec<EndpointId> = match self.states.lock() {
            Ok(s) => s.keys().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        ids.into_iter()
            .filter(|id| self.is_open_at(id, now_ms))
            .collect()
    }

    pub fn snapshot(&self, id: &EndpointId) -> Option<CircuitSnapshot> {
        let states = self.states.lock().ok()?;
        states.get(id).map(EndpointCircuit::snapshot)
    }

    /// 所有非初始状态的端点快照，用于持久化
    pub fn snapshot_all(&self) -> HashMap<EndpointId, CircuitSnapshot> {
        match self.states.lock() {
            Ok(states) => states
                .iter()
                .filter(|(_, c)| !c.is_pristine())
                .map(|(id, c)| (id.clone(), c.snapshot()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    /// 合并持久化快照，内存中已有记录的端点保持不变。返回新增条数。
    pub fn restore(&self, entries: HashMap<EndpointId, CircuitSnapshot>) -> usize {
        let Ok(mut states) = self.states.lock() else {
            return 0;
        };
        let mut restored = 0;
        for (id, snap) in entries {
            if states.contains_key(&id) {
                continue;
            }
            states.insert(id, EndpointCircuit::from_snapshot(&snap));
            restored += 1;
        }
        if restored > 0 {
            tracing::debug!(target = "endpoint", restored, "circuit breaker states restored");
        }
        restored
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&BreakerCfg::default(), Arc::new(NoopEventBus))
    }
}
