use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// 选择相关事件：一次 select 调用的起止与批量探测汇总
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SelectionEvent {
    Completed {
        id: String,
        endpoint_id: String,
        score: f64,
        latency_ms: Option<u32>,
        candidates: usize,
        last_resort: bool,
    },
    Failed { id: String, reason: String },
    BatchFinished {
        id: String,
        tested: usize,
        succeeded: usize,
        skipped: usize,
        batches: usize,
        stopped_early: bool,
    },
}

/// 健康状态相关事件：熔断器状态迁移与缓存维护
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthEvent {
    BreakerTripped { endpoint_id: String, consecutive_failures: u32 },
    BreakerHalfOpen { endpoint_id: String },
    BreakerClosed { endpoint_id: String },
    CachePruned { probe_entries: usize, health_entries: usize },
}

/// 连接相关事件：单次连接、自动重连与主动切换
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionEvent {
    Succeeded { endpoint_id: String, attempts: u32, connect_ms: u64 },
    Failed { endpoint_id: String, category: String, message: String },
    ReconnectStarted { id: String },
    ReconnectStrategy { id: String, strategy: String, step: u32 },
    ReconnectFinished { id: String, success: bool, attempts: u32 },
    ProactiveSwitch { from: String, to: String },
    ManualDisconnect { suppressed_until_ms: i64 },
}

/// 统一顶层事件枚举
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Selection(SelectionEvent),
    Health(HealthEvent),
    Connection(ConnectionEvent),
}

/// 事件总线 trait：由调用方在装配阶段显式注入
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, evt: Event);
}

/// 内存事件总线（测试与开发期使用）
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_all(&self) -> Vec<Event> {
        if let Ok(mut g) = self.inner.lock() {
            let out = g.clone();
            g.clear();
            out
        } else {
            Vec::new()
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl EventBus for MemoryEventBus {
    fn publish(&self, evt: Event) {
        if let Ok(mut g) = self.inner.lock() {
            g.push(evt);
        }
    }
}

/// 丢弃所有事件的总线，未注入总线时的默认值
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _evt: Event) {}
}
