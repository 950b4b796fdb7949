use thiserror::Error;

/// 跨越核心边界的结构化错误。瞬时的单端点失败不会出现在这里，
/// 它们在内部被转换为评分惩罚或熔断状态变化。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("no candidate endpoints supplied")]
    NoCandidates,

    #[error("no usable endpoint among candidates")]
    NoUsableEndpoint,

    #[error("circuit open for endpoint {endpoint_id}")]
    CircuitOpen { endpoint_id: String },

    #[error("network permission denied")]
    PermissionDenied,

    #[error("connect to {endpoint_id} failed after {attempts} attempts: {reason}")]
    ConnectFailed {
        endpoint_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("a connection attempt is already in progress")]
    AlreadyInProgress,

    #[error("all reconnection strategies exhausted after {attempts} attempts")]
    AllReconnectionStrategiesExhausted { attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            OrchestratorError::NoCandidates => "no_candidates",
            OrchestratorError::NoUsableEndpoint => "no_usable_endpoint",
            OrchestratorError::CircuitOpen { .. } => "circuit_open",
            OrchestratorError::PermissionDenied => "permission_denied",
            OrchestratorError::ConnectFailed { .. } => "connect_failed",
            OrchestratorError::AlreadyInProgress => "already_in_progress",
            OrchestratorError::AllReconnectionStrategiesExhausted { .. } => "reconnect_exhausted",
            OrchestratorError::Storage(_) => "storage",
        }
    }

    /// 单端点失败，选择流程可回退到下一个候选。
    pub fn is_endpoint_local(&self) -> bool {
        matches!(
            self,
            OrchestratorError::CircuitOpen { .. } | OrchestratorError::ConnectFailed { .. }
        )
    }
}

/// 探测内部错误，在发生处即被规范化为 `ProbeOutcome`。
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("engine error: {0}")]
    Engine(String),
    #[error("non-positive latency {0}")]
    NonPositive(i64),
}
