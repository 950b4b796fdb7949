//! 端点数据模型
//!
//! 端点配置对核心逻辑而言是不透明的字符串，核心只依赖其派生的稳定标识。
//! 探测结果用显式枚举表达超时与失败，不再依赖非正数哨兵值。

use std::{
    collections::HashSet,
    fmt,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 超时结果参与排序时使用的等效延迟。
pub const TIMEOUT_SORT_MS: u32 = 99_999;

const ID_BYTES: usize = 12;

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}

/// 端点稳定标识：配置内容 SHA-256 的前 12 字节（小写十六进制）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn from_payload(payload: &str) -> Self {
        let digest = Sha256::digest(payload.as_bytes());
        let hex = digest[..ID_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// 由外部配置解析器提供的提示信息，核心不解析 payload。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHints {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub payload: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub hints: EndpointHints,
}

impl Endpoint {
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            id: EndpointId::from_payload(&payload),
            payload,
            label: None,
            hints: EndpointHints::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_hints(mut self, protocol: Option<&str>, region: Option<&str>) -> Self {
        self.hints = EndpointHints {
            protocol: protocol.map(str::to_string),
            region: region.map(str::to_string),
        };
        self
    }

    /// 用于日志与状态消息的可读名称。
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }
}

/// 延迟等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
    Failed,
}

impl QualityTier {
    pub fn from_latency(latency_ms: u32) -> Self {
        match latency_ms {
            0..=99 => QualityTier::Excellent,
            100..=299 => QualityTier::Good,
            300..=599 => QualityTier::Fair,
            600..=999 => QualityTier::Poor,
            _ => QualityTier::Bad,
        }
    }

    /// 质量监控与缓存淘汰使用的等级分。
    pub fn score(&self) -> u32 {
        match self {
            QualityTier::Excellent => 100,
            QualityTier::Good => 80,
            QualityTier::Fair => 60,
            QualityTier::Poor => 40,
            QualityTier::Bad => 20,
            QualityTier::Failed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
            QualityTier::Bad => "bad",
            QualityTier::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProbeOutcome {
    Measured {
        #[serde(rename = "latencyMs")]
        latency_ms: u32,
    },
    Timeout,
    Failed,
}

impl ProbeOutcome {
    /// 将引擎返回的原始延迟规范化；非正数视为失败。
    pub fn from_engine(value: i64) -> Self {
        if value > 0 {
            ProbeOutcome::Measured {
                latency_ms: u32::try_from(value).unwrap_or(u32::MAX),
            }
        } else {
            ProbeOutcome::Failed
        }
    }

    pub fn latency_ms(&self) -> Option<u32> {
        match self {
            ProbeOutcome::Measured { latency_ms } => Some(*latency_ms),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Measured { .. })
    }

    /// 排序键：实测延迟 < 超时 < 失败。
    pub fn sort_key(&self) -> u32 {
        match self {
            // 超长实测延迟仍排在超时之前
            ProbeOutcome::Measured { latency_ms } => (*latency_ms).min(TIMEOUT_SORT_MS - 1),
            ProbeOutcome::Timeout => TIMEOUT_SORT_MS,
            ProbeOutcome::Failed => u32::MAX,
        }
    }

    pub fn tier(&self) -> QualityTier {
        match self {
            ProbeOutcome::Measured { latency_ms } => QualityTier::from_latency(*latency_ms),
            ProbeOutcome::Timeout => QualityTier::Bad,
            ProbeOutcome::Failed => QualityTier::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub endpoint_id: EndpointId,
    pub outcome: ProbeOutcome,
    pub measured_at_ms: i64,
}

impl ProbeResult {
    pub fn new(endpoint_id: EndpointId, outcome: ProbeOutcome, measured_at_ms: i64) -> Self {
        Self {
            endpoint_id,
            outcome,
            measured_at_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn tier(&self) -> QualityTier {
        self.outcome.tier()
    }

    pub fn latency_ms(&self) -> Option<u32> {
        self.outcome.latency_ms()
    }
}

/// 单次连接尝试日志
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttempt {
    pub endpoint_id: EndpointId,
    pub at_ms: i64,
    pub success: bool,
    pub connect_ms: u64,
    pub error: Option<String>,
}

/// 最近一次成功连接的端点及时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastKnownGood {
    pub endpoint: Endpoint,
    pub at_ms: i64,
}

/// 已知端点集合：最近一次候选列表与持久化恢复的端点。
///
/// 健康记录只保存标识，重连时需要在这里找回完整配置。
#[derive(Debug, Default)]
pub struct CandidatePool {
    inner: Mutex<Vec<Endpoint>>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并端点，已存在的标识不重复加入。
    pub fn merge(&self, endpoints: &[Endpoint]) {
        if let Ok(mut g) = self.inner.lock() {
            let mut seen: HashSet<EndpointId> = g.iter().map(|e| e.id.clone()).collect();
            for ep in endpoints {
                if seen.insert(ep.id.clone()) {
                    g.push(ep.clone());
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn find(&self, id: &EndpointId) -> Option<Endpoint> {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.iter().find(|e| &e.id == id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.clear();
        }
    }
}

pub fn dedupe_endpoints(endpoints: &[Endpoint]) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    endpoints
        .iter()
        .filter(|e| seen.insert(e.id.clone()))
        .cloned()
        .collect()
}
