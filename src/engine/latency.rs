//! Idle latency and jitter

use super::RunContext;
use crate::logging::Logger;
use crate::models::TestConfig;
use crate::stats;
use crate::transport::Transport;
use crate::types::{GraphTag, TestPhase};
use std::time::Duration;
use tokio::time::sleep;

/// Extra attempts per probe before the sample is skipped
pub const PROBE_RETRIES: u32 = 2;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyResult {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub sample_count: usize,
    /// No probe succeeded; the values are placeholders
    pub degraded: bool,
}

impl LatencyResult {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let latency_ms = stats::trimmed_mean(samples)?.max(0.0);
        Some(Self {
            latency_ms,
            jitter_ms: stats::jitter(samples).unwrap_or(0.0).max(0.0),
            sample_count: samples.len(),
            degraded: false,
        })
    }

    pub fn placeholder() -> Self {
        Self {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            sample_count: 0,
            degraded: true,
        }
    }
}

/// Sequential latency prober
#[derive(Debug, Clone)]
pub struct LatencySampler {
    samples: usize,
    timeout: Duration,
    retries: u32,
}

impl LatencySampler {
    pub fn new(samples: usize, timeout: Duration) -> Self {
        Self {
            samples,
            timeout,
            retries: PROBE_RETRIES,
        }
    }

    pub fn from_config(config: &TestConfig) -> Self {
        Self::new(config.latency_samples, config.probe_timeout())
    }

    /// Same probe settings, different sample count
    pub fn with_samples(&self, samples: usize) -> Self {
        Self {
            samples,
            ..self.clone()
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Network latency of one probe in milliseconds, retrying with backoff
    async fn probe(&self, transport: &dyn Transport, retries: u32, logger: &Logger) -> Option<f64> {
        for attempt in 0..=retries {
            match transport.probe_latency(self.timeout).await {
                Ok(probe) => return Some(probe.network_latency_ms()),
                Err(error) => {
                    logger
                        .debug("Latency probe failed")
                        .field("attempt", attempt + 1)
                        .error_info(&error)
                        .log()
                        .await;
                    if attempt < retries {
                        sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        None
    }

    /// Probe sequentially, skipping failed probes. `on_sample` receives the
    /// index of the probe and its latency.
    pub async fn collect<F>(
        &self,
        transport: &dyn Transport,
        logger: &Logger,
        mut on_sample: F,
    ) -> Vec<f64>
    where
        F: FnMut(usize, f64) + Send,
    {
        let mut values = Vec::with_capacity(self.samples);
        for index in 0..self.samples {
            if let Some(latency) = self.probe(transport, self.retries, logger).await {
                values.push(latency);
                on_sample(index, latency);
            }
        }
        values
    }

    /// Run the latency phase. Falls back to one extra single-attempt probe,
    /// then to a degraded placeholder.
    pub(crate) async fn measure(&self, ctx: &RunContext) -> LatencyResult {
        let total = self.samples.max(1) as f64;
        let mut values = self
            .collect(ctx.transport.as_ref(), &ctx.logger, |index, latency| {
                ctx.events
                    .progress(TestPhase::Latency, (index + 1) as f64 / total * 100.0, latency);
                ctx.events.graph(GraphTag::Latency, latency);
            })
            .await;

        if values.is_empty() {
            ctx.logger
                .warn("No latency probe succeeded, trying once more")
                .log()
                .await;
            if let Some(latency) = self.probe(ctx.transport.as_ref(), 0, &ctx.logger).await {
                ctx.events.progress(TestPhase::Latency, 100.0, latency);
                ctx.events.graph(GraphTag::Latency, latency);
                values.push(latency);
            }
        }

        match LatencyResult::from_samples(&values) {
            Some(result) => result,
            None => LatencyResult::placeholder(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::MockTransport;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_result_from_samples() {
        let result = LatencyResult::from_samples(&[20.0, 22.0, 21.0, 80.0, 1.0]).unwrap();
        assert_eq!(result.latency_ms, 21.0);
        assert_eq!(result.sample_count, 5);
        assert!(!result.degraded);

        let single = LatencyResult::from_samples(&[15.0]).unwrap();
        assert_eq!(single.jitter_ms, 0.0);

        assert!(LatencyResult::from_samples(&[]).is_none());
        assert!(LatencyResult::placeholder().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_reports_each_sample() {
        let transport = MockTransport::new().with_latency(Duration::from_millis(20));
        let sampler = LatencySampler::new(6, Duration::from_secs(1));
        let mut seen = Vec::new();

        let values = sampler
            .collect(&transport, &Logger::new("test"), |index, _| seen.push(index))
            .await;

        assert_eq!(values.len(), 6);
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(values.iter().all(|v| (*v - 20.0).abs() < 1e-6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probes_are_retried_then_skipped() {
        let transport = MockTransport::new();
        transport.fail_latency.store(true, Ordering::SeqCst);
        let sampler = LatencySampler::new(3, Duration::from_millis(100));

        let values = sampler.collect(&transport, &Logger::new("test"), |_, _| {}).await;

        assert!(values.is_empty());
        assert_eq!(
            transport.latency_probes.load(Ordering::SeqCst),
            3 * (PROBE_RETRIES as usize + 1)
        );
    }

    #[test]
    fn test_with_samples_keeps_timeout() {
        let sampler = LatencySampler::new(10, Duration::from_millis(750)).with_samples(5);
        assert_eq!(sampler.samples(), 5);
        assert_eq!(sampler.timeout, Duration::from_millis(750));
    }
}
