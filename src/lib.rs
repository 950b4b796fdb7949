pub mod core;
pub mod events;
pub mod logging;

// 便于测试与调用方直接使用编排器模块
pub use core::endpoint;
pub use core::endpoint::{Orchestrator, OrchestratorError};
