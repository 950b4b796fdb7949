//! tracing 初始化。过滤规则优先取 `RUST_LOG`，否则使用配置中的 `logging.logLevel`。

use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::model::LoggingCfg;

const FALLBACK_LEVEL: &str = "info";

pub fn init_logging() {
    init_logging_with_level(FALLBACK_LEVEL);
}

pub fn init_logging_from_config(cfg: &LoggingCfg) {
    init_logging_with_level(&cfg.log_level);
}

/// 构造过滤器：环境变量 > 指定级别 > `info`。
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// 安装全局订阅者；已安装时直接返回。
pub fn init_logging_with_level(default_level: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let subscriber = fmt()
        .with_env_filter(build_filter(default_level))
        .with_target(true)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!(target = "app", default_level, "tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back_without_panicking() {
        let _ = build_filter("not a [valid filter");
        init_logging_from_config(&LoggingCfg {
            log_level: "debug".into(),
        });
        // 第二次调用是空操作
        init_logging();
        assert!(tracing::dispatcher::has_been_set());
    }
}
