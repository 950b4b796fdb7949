use std::sync::Arc;

use tunnel_orchestrator_lib::core::config::model::OrchestratorConfig;
use tunnel_orchestrator_lib::endpoint::{
    Collaborators, Endpoint, KvStore, MemoryKvStore, Orchestrator, StaticCandidates,
};
use tunnel_orchestrator_lib::events::MemoryEventBus;

use super::mock_engine::{CountingGate, MockProbe, MockTunnelEngine, RecordingSink};

/// 缩短超时与退避的配置，便于测试快速结束。
pub fn fast_config() -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.probe.timeout_ms = 200;
    cfg.retry.jitter_ms = 0;
    cfg.retry.base_delay_ms = 10;
    cfg.retry.min_delay_ms = 5;
    cfg.retry.max_delay_ms = 50;
    cfg.retry.verify_timeout_ms = 300;
    cfg.reconnect.backoff_base_ms = 10;
    cfg.reconnect.backoff_max_ms = 50;
    cfg.batch.inter_batch_delay_ms.fast_ms = 1;
    cfg.batch.inter_batch_delay_ms.medium_ms = 1;
    cfg.batch.inter_batch_delay_ms.slow_ms = 1;
    cfg
}

/// 生成 payload 为 `node-<i>` 的端点
pub fn endpoints(n: usize) -> Vec<Endpoint> {
    (0..n)
        .map(|i| Endpoint::new(format!("node-{i}")).with_label(format!("Node {i}")))
        .collect()
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: Arc<MockTunnelEngine>,
    pub events: Arc<MemoryEventBus>,
    pub sink: Arc<RecordingSink>,
    pub gate: Arc<CountingGate>,
}

pub struct HarnessBuilder {
    cfg: OrchestratorConfig,
    engine: Arc<MockTunnelEngine>,
    store: Arc<dyn KvStore>,
    gate: Arc<CountingGate>,
    candidates: Vec<Endpoint>,
}

impl HarnessBuilder {
    pub fn new(cfg: OrchestratorConfig) -> Self {
        Self {
            cfg,
            engine: Arc::new(MockTunnelEngine::new()),
            store: Arc::new(MemoryKvStore::new()),
            gate: Arc::new(CountingGate::granting()),
            candidates: Vec::new(),
        }
    }

    pub fn engine(mut self, engine: Arc<MockTunnelEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = store;
        self
    }

    pub fn gate(mut self, gate: CountingGate) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// 重连全量发现阶段由候选来源返回的列表
    pub fn provider(mut self, candidates: Vec<Endpoint>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn build(self) -> Harness {
        let events = Arc::new(MemoryEventBus::new());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            self.cfg,
            Collaborators {
                engine: self.engine.clone(),
                permission: self.gate.clone(),
                store: self.store,
                sink: sink.clone(),
                events: events.clone(),
                candidates: Arc::new(StaticCandidates(self.candidates)),
            },
        );
        Harness {
            orchestrator,
            engine: self.engine,
            events,
            sink,
            gate: self.gate,
        }
    }
}

/// 为每个端点设置探测延迟
pub fn set_latencies(engine: &MockTunnelEngine, eps: &[Endpoint], latencies: &[i64]) {
    for (ep, ms) in eps.iter().zip(latencies) {
        engine.set_probe(&ep.payload, MockProbe::Latency(*ms));
    }
}
