use serde::{Deserialize, Serialize};

/// 各质量等级的缓存有效期（秒），excellent 最长、failed 最短
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierTtlCfg {
    #[serde(default = "default_ttl_excellent")] pub excellent_secs: u64,
    #[serde(default = "default_ttl_good")] pub good_secs: u64,
    #[serde(default = "default_ttl_fair")] pub fair_secs: u64,
    #[serde(default = "default_ttl_poor")] pub poor_secs: u64,
    #[serde(default = "default_ttl_bad")] pub bad_secs: u64,
    #[serde(default = "default_ttl_failed")] pub failed_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeCfg {
    /// 固定的可达性探测目标，所有端点共用。
    #[serde(default = "default_probe_target")] pub target: String,
    #[serde(default = "default_probe_timeout_ms")] pub timeout_ms: u64,
    #[serde(default)] pub ttl: TierTtlCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterBatchDelayCfg {
    #[serde(default = "default_delay_fast")] pub fast_ms: u64,
    #[serde(default = "default_delay_medium")] pub medium_ms: u64,
    #[serde(default = "default_delay_slow")] pub slow_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchCfg {
    #[serde(default = "default_concurrency")] pub concurrency: usize,
    /// 为空时按候选池大小自适应（6–8）。
    #[serde(default)] pub batch_size: Option<usize>,
    #[serde(default = "default_early_stop_count")] pub early_stop_count: Option<usize>,
    #[serde(default = "default_min_batches_before_stop")] pub min_batches_before_stop: usize,
    #[serde(default)] pub inter_batch_delay_ms: InterBatchDelayCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BreakerCfg {
    #[serde(default = "default_true")] pub enabled: bool,
    #[serde(default = "default_failure_threshold")] pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")] pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryCfg {
    #[serde(default = "default_max_retries")] pub max_retries: u32,
    #[serde(default = "default_base_timeout_ms")] pub base_timeout_ms: u64,
    #[serde(default = "default_min_timeout_ms")] pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")] pub max_timeout_ms: u64,
    #[serde(default = "default_base_delay_ms")] pub base_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")] pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")] pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")] pub jitter_ms: u64,
    #[serde(default = "default_verify_timeout_ms")] pub verify_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScoringCfg {
    #[serde(default)] pub preferred_protocols: Vec<String>,
    #[serde(default)] pub preferred_regions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectCfg {
    #[serde(default = "default_true")] pub enabled: bool,
    #[serde(default = "default_manual_suppression_secs")] pub manual_suppression_secs: u64,
    #[serde(default = "default_quick_window_secs")] pub quick_window_secs: u64,
    #[serde(default = "default_quick_min_success_rate")] pub quick_min_success_rate: f64,
    #[serde(default = "default_cached_reliable_limit")] pub cached_reliable_limit: usize,
    #[serde(default = "default_reconnect_max_attempts")] pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")] pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")] pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorCfg {
    #[serde(default = "default_health_check_interval_secs")] pub health_check_interval_secs: u64,
    #[serde(default = "default_quality_interval_secs")] pub quality_interval_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")] pub maintenance_interval_secs: u64,
    #[serde(default = "default_health_check_sample_size")] pub health_check_sample_size: usize,
    #[serde(default = "default_degradation_threshold")] pub degradation_threshold: f64,
    #[serde(default = "default_degradation_trigger")] pub degradation_trigger: u32,
    #[serde(default = "default_quality_sample_limit")] pub quality_sample_limit: usize,
    #[serde(default = "default_switch_margin")] pub switch_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheCfg {
    #[serde(default = "default_candidate_list_ttl_secs")] pub candidate_list_ttl_secs: u64,
    #[serde(default = "default_health_snapshot_ttl_secs")] pub health_snapshot_ttl_secs: u64,
    #[serde(default = "default_max_probe_entries")] pub max_probe_entries: usize,
    #[serde(default = "default_stale_health_secs")] pub stale_health_secs: u64,
    #[serde(default = "default_stale_health_min_attempts")] pub stale_health_min_attempts: u32,
    #[serde(default = "default_attempt_history_limit")] pub attempt_history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingCfg {
    #[serde(default = "default_log_level")] pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default)] pub probe: ProbeCfg,
    #[serde(default)] pub batch: BatchCfg,
    #[serde(default)] pub breaker: BreakerCfg,
    #[serde(default)] pub retry: RetryCfg,
    #[serde(default)] pub scoring: ScoringCfg,
    #[serde(default)] pub reconnect: ReconnectCfg,
    #[serde(default)] pub monitor: MonitorCfg,
    #[serde(default)] pub cache: CacheCfg,
    #[serde(default)] pub logging: LoggingCfg,
}

fn default_true() -> bool { true }
fn default_ttl_excellent() -> u64 { 30 * 60 }
fn default_ttl_good() -> u64 { 25 * 60 }
fn default_ttl_fair() -> u64 { 20 * 60 }
fn default_ttl_poor() -> u64 { 15 * 60 }
fn default_ttl_bad() -> u64 { 5 * 60 }
fn default_ttl_failed() -> u64 { 2 * 60 }
fn default_probe_target() -> String { "https://www.gstatic.com/generate_204".to_string() }
fn default_probe_timeout_ms() -> u64 { 5_000 }
fn default_delay_fast() -> u64 { 20 }
fn default_delay_medium() -> u64 { 50 }
fn default_delay_slow() -> u64 { 100 }
fn default_concurrency() -> usize { 6 }
fn default_early_stop_count() -> Option<usize> { Some(5) }
fn default_min_batches_before_stop() -> usize { 3 }
fn default_failure_threshold() -> u32 { 3 }
fn default_cooldown_secs() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_base_timeout_ms() -> u64 { 8_000 }
fn default_min_timeout_ms() -> u64 { 4_000 }
fn default_max_timeout_ms() -> u64 { 12_000 }
fn default_base_delay_ms() -> u64 { 200 }
fn default_min_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 2_000 }
fn default_jitter_ms() -> u64 { 100 }
fn default_verify_timeout_ms() -> u64 { 3_000 }
fn default_manual_suppression_secs() -> u64 { 120 }
fn default_quick_window_secs() -> u64 { 30 * 60 }
fn default_quick_min_success_rate() -> f64 { 0.7 }
fn default_cached_reliable_limit() -> usize { 3 }
fn default_reconnect_max_attempts() -> u32 { 5 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 15_000 }
fn default_health_check_interval_secs() -> u64 { 5 * 60 }
fn default_quality_interval_secs() -> u64 { 2 * 60 }
fn default_maintenance_interval_secs() -> u64 { 10 * 60 }
fn default_health_check_sample_size() -> usize { 5 }
fn default_degradation_threshold() -> f64 { 40.0 }
fn default_degradation_trigger() -> u32 { 3 }
fn default_quality_sample_limit() -> usize { 50 }
fn default_switch_margin() -> f64 { 10.0 }
fn default_candidate_list_ttl_secs() -> u64 { 2 * 60 * 60 }
fn default_health_snapshot_ttl_secs() -> u64 { 60 * 60 }
fn default_max_probe_entries() -> usize { 200 }
fn default_stale_health_secs() -> u64 { 24 * 60 * 60 }
fn default_stale_health_min_attempts() -> u32 { 3 }
fn default_attempt_history_limit() -> usize { 100 }
fn default_log_level() -> String { "info".to_string() }

impl Default for TierTtlCfg {
    fn default() -> Self {
        Self {
            excellent_secs: default_ttl_excellent(),
            good_secs: default_ttl_good(),
            fair_secs: default_ttl_fair(),
            poor_secs: default_ttl_poor(),
            bad_secs: default_ttl_bad(),
            failed_secs: default_ttl_failed(),
        }
    }
}

impl Default for ProbeCfg {
    fn default() -> Self {
        Self {
            target: default_probe_target(),
            timeout_ms: default_probe_timeout_ms(),
            ttl: TierTtlCfg::default(),
        }
    }
}

impl Default for InterBatchDelayCfg {
    fn default() -> Self {
        Self {
            fast_ms: default_delay_fast(),
            medium_ms: default_delay_medium(),
            slow_ms: default_delay_slow(),
        }
    }
}

impl Default for BatchCfg {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: None,
            early_stop_count: default_early_stop_count(),
            min_batches_before_stop: default_min_batches_before_stop(),
            inter_batch_delay_ms: InterBatchDelayCfg::default(),
        }
    }
}

impl Default for BreakerCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_timeout_ms: default_base_timeout_ms(),
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
        }
    }
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            manual_suppression_secs: default_manual_suppression_secs(),
            quick_window_secs: default_quick_window_secs(),
            quick_min_success_rate: default_quick_min_success_rate(),
            cached_reliable_limit: default_cached_reliable_limit(),
            max_attempts: default_reconnect_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            quality_interval_secs: default_quality_interval_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            health_check_sample_size: default_health_check_sample_size(),
            degradation_threshold: default_degradation_threshold(),
            degradation_trigger: default_degradation_trigger(),
            quality_sample_limit: default_quality_sample_limit(),
            switch_margin: default_switch_margin(),
        }
    }
}

impl Default for CacheCfg {
    fn default() -> Self {
        Self {
            candidate_list_ttl_secs: default_candidate_list_ttl_secs(),
            health_snapshot_ttl_secs: default_health_snapshot_ttl_secs(),
            max_probe_entries: default_max_probe_entries(),
            stale_health_secs: default_stale_health_secs(),
            stale_health_min_attempts: default_stale_health_min_attempts(),
            attempt_history_limit: default_attempt_history_limit(),
        }
    }
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}
