//! 外部协作方接口：隧道引擎、权限、键值存储、状态输出与候选来源。
//!
//! 这些能力由宿主提供，核心只在边界上调用，并自行施加超时。

use anyhow::Result;
use async_trait::async_trait;

use super::model::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// 隧道引擎。所有调用都可能失败或挂起。
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    /// 通过端点访问探测目标，返回毫秒延迟；非正数表示失败。
    async fn delay_test(&self, endpoint: &Endpoint, target: &str) -> Result<i64>;
    async fn status(&self) -> Result<TunnelStatus>;
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_permission(&self) -> Result<bool>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>>;
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// 纯观测的状态输出，不能影响流程。
pub trait StatusSink: Send + Sync {
    fn message(&self, msg: &str);
    fn progress(&self, completed: usize, total: usize);
}

/// 候选列表来源（订阅拉取等），重连的全量发现阶段使用。
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<Endpoint>>;
}

/// 把状态输出写入 tracing 日志
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn message(&self, msg: &str) {
        tracing::info!(target = "endpoint", status = msg, "status");
    }

    fn progress(&self, completed: usize, total: usize) {
        tracing::debug!(target = "endpoint", completed, total, "progress");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn request_permission(&self) -> Result<bool> {
        Ok(true)
    }
}

/// 固定候选列表
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates(pub Vec<Endpoint>);

#[async_trait]
impl CandidateProvider for StaticCandidates {
    async fn fetch_candidates(&self) -> Result<Vec<Endpoint>> {
        Ok(self.0.clone())
    }
}
