//! 批量测试编排
//!
//! 候选列表按批顺序执行，批内通过信号量限制并发探测数。每完成一个探测就
//! 上报一次 `(completed, total)` 进度。成功数达到提前终止阈值且至少跑完
//! 若干批后，跳过剩余批次。熔断打开的端点在分批前剔除，不占探测名额。

use std::{sync::Arc, time::Duration};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Semaphore};

use crate::core::config::model::{BatchCfg, InterBatchDelayCfg};

use super::{
    circuit_breaker::CircuitBreaker,
    external::StatusSink,
    model::{Endpoint, EndpointId, ProbeResult},
    probe::ProbeEngine,
};

const FAST_RATIO: f64 = 0.7;
const MEDIUM_RATIO: f64 = 0.4;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub concurrency: usize,
    /// 为空时按候选池大小自适应
    pub batch_size: Option<usize>,
    pub early_stop_count: Option<usize>,
    pub timeout: Duration,
}

impl BatchOptions {
    pub fn from_config(cfg: &BatchCfg, timeout: Duration) -> Self {
        Self {
            concurrency: cfg.concurrency,
            batch_size: cfg.batch_size,
            early_stop_count: cfg.early_stop_count,
            timeout,
        }
    }
}

/// 按候选池大小选择批大小（6–8）。
pub fn adaptive_batch_size(total: usize) -> usize {
    match total {
        0..=12 => 6,
        13..=40 => 7,
        _ => 8,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<(Endpoint, ProbeResult)>,
    /// 因熔断打开而跳过的端点
    pub skipped: Vec<EndpointId>,
    pub batches_run: usize,
    pub stopped_early: bool,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_success()).count()
    }

    pub fn probe_results(&self) -> Vec<ProbeResult> {
        self.results.iter().map(|(_, r)| r.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub enum BatchEvent {
    Result {
        endpoint: Endpoint,
        result: ProbeResult,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    Finished(BatchReport),
}

#[derive(Clone)]
pub struct BatchTester {
    probe: ProbeEngine,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn StatusSink>,
    min_batches_before_stop: usize,
    delays: InterBatchDelayCfg,
}

impl BatchTester {
    pub fn new(
        probe: ProbeEngine,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn StatusSink>,
        cfg: &BatchCfg,
    ) -> Self {
        Self {
            probe,
            breaker,
            sink,
            min_batches_before_stop: cfg.min_batches_before_stop,
            delays: cfg.inter_batch_delay_ms.clone(),
        }
    }

    pub async fn run(&self, endpoints: &[Endpoint], opts: &BatchOptions) -> BatchReport {
        self.run_inner(endpoints, opts, None).await
    }

    /// 在后台执行同一流程，通过通道逐条推送结果与进度，最后推送汇总。
    pub fn stream(
        &self,
        endpoints: Vec<Endpoint>,
        opts: BatchOptions,
    ) -> mpsc::UnboundedReceiver<BatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tester = self.clone();
        tokio::spawn(async move {
            let report = tester.run_inner(&endpoints, &opts, Some(&tx)).await;
            let _ = tx.send(BatchEvent::Finished(report));
        });
        rx
    }

    fn inter_batch_delay(&self, prior_success_ratio: f64) -> Duration {
        let ms = if prior_success_ratio >= FAST_RATIO {
            self.delays.fast_ms
        } else if prior_success_ratio >= MEDIUM_RATIO {
            self.delays.medium_ms
        } else {
            self.delays.slow_ms
        };
        Duration::from_millis(ms)
    }

    async fn run_inner(
        &self,
        endpoints: &[Endpoint],
        opts: &BatchOptions,
        tx: Option<&mpsc::UnboundedSender<BatchEvent>>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut usable = Vec::with_capacity(endpoints.len());
        for ep in endpoints {
            if self.breaker.is_open(&ep.id) {
                tracing::debug!(target = "endpoint", endpoint = %ep.id, "skip probe: circuit open");
                report.skipped.push(ep.id.clone());
            } else {
                usable.push(ep.clone());
            }
        }

        let total = usable.len();
        if total == 0 {
            return report;
        }
        let batch_size = opts
            .batch_size
            .unwrap_or_else(|| adaptive_batch_size(total))
            .max(1);
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let batches: Vec<&[Endpoint]> = usable.chunks(batch_size).collect();
        let batch_count = batches.len();
        let mut completed = 0usize;
        let mut successes = 0usize;
        let mut prior_ratio = 1.0f64;

        tracing::debug!(
            target = "endpoint",
            total,
            batch_size,
            batches = batch_count,
            concurrency = opts.concurrency,
            "batch test started"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inter_batch_delay(prior_ratio)).await;
            }

            let mut in_flight = FuturesUnordered::new();
            for ep in batch {
                let semaphore = semaphore.clone();
                let probe = self.probe.clone();
                let ep = ep.clone();
                let timeout = opts.timeout;
                in_flight.push(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let result = probe.probe(&ep, timeout).await;
                    (ep, result)
                });
            }

            let mut batch_successes = 0usize;
            while let Some((ep, result)) = in_flight.next().await {
                completed += 1;
                if result.is_success() {
                    successes += 1;
                    batch_successes += 1;
                }
                self.sink.progress(completed, total);
                if let Some(tx) = tx {
                    let _ = tx.send(BatchEvent::Result {
                        endpoint: ep.clone(),
                        result: result.clone(),
                    });
                    let _ = tx.send(BatchEvent::Progress { completed, total });
                }
                report.results.push((ep, result));
            }

            report.batches_run += 1;
            prior_ratio = batch_successes as f64 / batch.len() as f64;

            let remaining = index + 1 < batch_count;
            if let Some(threshold) = opts.early_stop_count {
                if remaining
                    && successes >= threshold
                    && report.batches_run >= self.min_batches_before_stop
                {
                    tracing::info!(
                        target = "endpoint",
                        successes,
                        batches_run = report.batches_run,
                        skipped_batches = batch_count - index - 1,
                        "batch test stopped early"
                    );
                    report.stopped_early = true;
                    break;
                }
            }
        }
        report
    }
}
