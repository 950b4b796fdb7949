pub mod adaptive;
pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod connect;
pub mod error;
pub mod events;
pub mod external;
pub mod health;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod persist;
pub mod probe;
pub mod reconnect;
pub mod scoring;
pub mod store;

pub use adaptive::AdaptiveCalculator;
pub use batch::{BatchEvent, BatchOptions, BatchReport, BatchTester};
pub use cache::{CacheEntry, TierTtl, TtlCache};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use connect::{
    ConnectRequest, ConnectSuccess, ConnectionManager, ConnectionStats, EndpointConnectionStats,
};
pub use error::{OrchestratorError, ProbeError};
pub use external::{
    AlwaysGranted, CandidateProvider, KvStore, PermissionGate, StaticCandidates, StatusSink,
    TracingStatusSink, TunnelEngine, TunnelStatus,
};
pub use health::{HealthMetrics, HealthRegistry};
pub use model::{
    now_epoch_ms, CandidatePool, ConnectionAttempt, Endpoint, EndpointHints, EndpointId,
    LastKnownGood, ProbeOutcome, ProbeResult, QualityTier, TIMEOUT_SORT_MS,
};
pub use monitor::{Monitor, MonitorHandle, QualityStats, TickOutcome};
pub use orchestrator::{Collaborators, Orchestrator, RestoreSummary, SelectOptions, Selection};
pub use persist::PersistentCache;
pub use probe::ProbeEngine;
pub use reconnect::{ReconnectController, ReconnectOutcome, ReconnectResult, ReconnectStrategy};
pub use scoring::{ScoredCandidate, ScoringContext};
pub use store::{JsonFileKvStore, MemoryKvStore};
