use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use tokio::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use tunnel_orchestrator_lib::endpoint::{
    Endpoint, PermissionGate, StatusSink, TunnelEngine, TunnelStatus,
};

/// 单个端点的探测行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockProbe {
    Latency(i64),
    /// 永不返回，由探测超时兜底
    Hang,
    Error,
}

/// status() 的应答方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStatus {
    /// 反映最近一次 connect/disconnect 的结果
    Live,
    /// 始终返回固定状态
    Stuck(TunnelStatus),
    /// 永不返回
    Hang,
}

/// 按 payload 配置行为的模拟隧道引擎
pub struct MockTunnelEngine {
    probes: Mutex<HashMap<String, MockProbe>>,
    refuse_connect: Mutex<HashSet<String>>,
    probe_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    status: Mutex<TunnelStatus>,
    delay_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_log: Mutex<Vec<String>>,
    connect_times: Mutex<Vec<Instant>>,
    status_mode: Mutex<MockStatus>,
    hang_disconnect: AtomicBool,
}

impl Default for MockTunnelEngine {
    fn default() -> Self {
        Self {
            probes: Mutex::new(HashMap::new()),
            refuse_connect: Mutex::new(HashSet::new()),
            probe_delay: Mutex::new(Duration::ZERO),
            connect_delay: Mutex::new(Duration::ZERO),
            status: Mutex::new(TunnelStatus::Disconnected),
            delay_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connect_log: Mutex::new(Vec::new()),
            connect_times: Mutex::new(Vec::new()),
            status_mode: Mutex::new(MockStatus::Live),
            hang_disconnect: AtomicBool::new(false),
        }
    }
}

impl MockTunnelEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_probe(&self, payload: &str, probe: MockProbe) {
        self.probes.lock().unwrap().insert(payload.to_string(), probe);
    }

    pub fn refuse_connect(&self, payload: &str) {
        self.refuse_connect.lock().unwrap().insert(payload.to_string());
    }

    pub fn allow_connect(&self, payload: &str) {
        self.refuse_connect.lock().unwrap().remove(payload);
    }

    /// 每次 delay_test 在返回前等待的时长
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_status_mode(&self, mode: MockStatus) {
        *self.status_mode.lock().unwrap() = mode;
    }

    pub fn hang_disconnect(&self, hang: bool) {
        self.hang_disconnect.store(hang, Ordering::SeqCst);
    }

    /// 每次 connect 调用开始的时刻（tokio 时钟）
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap().clone()
    }

    /// 同时进行中的 delay_test 调用数峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn delay_calls(&self) -> usize {
        self.delay_calls.load(Ordering::SeqCst)
    }

    /// 按调用顺序记录的 connect payload
    pub fn connect_log(&self) -> Vec<String> {
        self.connect_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelEngine for MockTunnelEngine {
    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.connect_log.lock().unwrap().push(endpoint.payload.clone());
        self.connect_times.lock().unwrap().push(Instant::now());
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_connect.lock().unwrap().contains(&endpoint.payload) {
            *self.status.lock().unwrap() = TunnelStatus::Disconnected;
            return Err(anyhow!("connection refused by {}", endpoint.payload));
        }
        *self.status.lock().unwrap() = TunnelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.hang_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.status.lock().unwrap() = TunnelStatus::Disconnected;
        Ok(())
    }

    async fn delay_test(&self, endpoint: &Endpoint, _target: &str) -> Result<i64> {
        self.delay_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let probe = self
            .probes
            .lock()
            .unwrap()
            .get(&endpoint.payload)
            .copied()
            .unwrap_or(MockProbe::Error);
        match probe {
            MockProbe::Latency(ms) => Ok(ms),
            MockProbe::Hang => {
                std::future::pending::<()>().await;
                Ok(-1)
            }
            MockProbe::Error => Err(anyhow!("delay test failed")),
        }
    }

    async fn status(&self) -> Result<TunnelStatus> {
        let mode = *self.status_mode.lock().unwrap();
        match mode {
            MockStatus::Live => Ok(*self.status.lock().unwrap()),
            MockStatus::Stuck(status) => Ok(status),
            MockStatus::Hang => {
                std::future::pending::<()>().await;
                Ok(TunnelStatus::Disconnected)
            }
        }
    }
}

/// 固定应答的权限门，记录调用次数
#[derive(Default)]
pub struct CountingGate {
    pub granted: bool,
    calls: AtomicUsize,
}

impl CountingGate {
    pub fn granting() -> Self {
        Self {
            granted: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionGate for CountingGate {
    async fn request_permission(&self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.granted)
    }
}

/// 记录所有状态输出
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    progress: Mutex<Vec<(usize, usize)>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<(usize, usize)> {
        self.progress.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn message(&self, msg: &str) {
        self.messages.lock().unwrap().push(msg.to_string());
    }

    fn progress(&self, completed: usize, total: usize) {
        self.progress.lock().unwrap().push((completed, total));
    }
}
