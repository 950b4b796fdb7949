#![allow(dead_code, unused_imports)]
//! 集成测试公共模块：日志初始化、模拟隧道引擎与装配工具。

pub mod fixtures;
pub mod mock_engine;
pub mod test_env;
