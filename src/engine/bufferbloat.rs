//! Latency under induced load

use super::latency::LatencySampler;
use super::RunContext;
use crate::error::Result;
use crate::models::{BufferbloatResult, TestConfig};
use crate::stats;
use crate::transport::Transport;
use crate::types::{GraphTag, TestPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const LOAD_CONNECTIONS: usize = 3;
pub const RAMP_UP: Duration = Duration::from_millis(500);
pub const LOADED_SAMPLES: usize = 5;
/// Upper bound for one background download before it is restarted
pub const LOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Background downloads that saturate the link. Their throughput is
/// discarded; dropping the generator stops them.
pub struct LoadGenerator {
    tasks: Vec<JoinHandle<()>>,
}

impl LoadGenerator {
    pub fn start(transport: Arc<dyn Transport>, connections: usize, request_bytes: u64) -> Self {
        let tasks = (0..connections)
            .map(|_| {
                let transport = transport.clone();
                tokio::spawn(async move {
                    loop {
                        let request = drain(transport.as_ref(), request_bytes);
                        match timeout(LOAD_REQUEST_TIMEOUT, request).await {
                            Ok(Ok(_)) | Err(_) => {}
                            Ok(Err(_)) => sleep(LOAD_RETRY_PAUSE).await,
                        }
                    }
                })
            })
            .collect();
        Self { tasks }
    }

    pub fn connections(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for LoadGenerator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn drain(transport: &dyn Transport, bytes: u64) -> Result<u64> {
    let mut stream = transport.stream_down(bytes).await?;
    while let Some(chunk) = stream.next_chunk().await {
        chunk?;
    }
    Ok(stream.payload_bytes())
}

#[derive(Debug, Clone)]
pub struct BufferbloatAnalyzer {
    connections: usize,
    ramp_up: Duration,
    sampler: LatencySampler,
    request_bytes: u64,
}

impl BufferbloatAnalyzer {
    pub fn from_config(config: &TestConfig, max_parallel_streams: usize) -> Self {
        Self {
            connections: LOAD_CONNECTIONS.min(max_parallel_streams).max(1),
            ramp_up: RAMP_UP,
            sampler: LatencySampler::from_config(config).with_samples(LOADED_SAMPLES),
            request_bytes: config.download_request_bytes,
        }
    }

    /// Loaded latency compared against `baseline_ms`; `None` when no probe
    /// succeeded under load
    pub(crate) async fn measure(
        &self,
        ctx: &RunContext,
        baseline_ms: f64,
    ) -> Option<BufferbloatResult> {
        let load =
            LoadGenerator::start(ctx.transport.clone(), self.connections, self.request_bytes);
        ctx.logger
            .debug("Background load started")
            .field("connections", load.connections())
            .log()
            .await;

        sleep(self.ramp_up).await;

        let total = self.sampler.samples().max(1) as f64;
        let loaded = self
            .sampler
            .collect(ctx.transport.as_ref(), &ctx.logger, |index, latency| {
                ctx.events
                    .progress(TestPhase::Bufferbloat, (index + 1) as f64 / total * 100.0, latency);
                ctx.events.graph(GraphTag::Bufferbloat, latency);
            })
            .await;
        drop(load);

        let loaded_ms = stats::trimmed_mean(&loaded)?;
        let result = BufferbloatResult::from_latencies(baseline_ms, loaded_ms);
        ctx.logger
            .info("Bufferbloat measured")
            .field("baseline_ms", baseline_ms)
            .field("loaded_ms", result.loaded_latency_ms)
            .field("rating", result.rating.to_string())
            .log()
            .await;
        Some(result)
    }
}
