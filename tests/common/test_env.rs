use std::sync::Once;

use tunnel_orchestrator_lib::core::config::model::LoggingCfg;
use tunnel_orchestrator_lib::logging::init_logging_from_config;

static INIT: Once = Once::new();

/// 统一测试环境初始化（tracing），多次调用只生效一次。
pub fn init_test_env() {
    INIT.call_once(|| {
        init_logging_from_config(&LoggingCfg {
            log_level: "warn".into(),
        });
    });
}
