//! Batched lightweight probes

use super::RunContext;
use crate::models::{PacketLossStats, TestConfig};
use crate::transport::Transport;
use crate::types::TestPhase;
use futures::future::join_all;
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PacketLossProbe {
    total_probes: usize,
    batch_size: usize,
    probe_timeout: Duration,
    batch_pause: Duration,
}

impl PacketLossProbe {
    pub fn new(total_probes: usize, probe_timeout: Duration) -> Self {
        Self {
            total_probes,
            batch_size: DEFAULT_BATCH_SIZE,
            probe_timeout,
            batch_pause: BATCH_PAUSE,
        }
    }

    pub fn from_config(config: &TestConfig) -> Self {
        Self::new(config.packet_loss_probes, config.probe_timeout())
    }

    /// Send every probe, one batch at a time. `on_batch` receives the running
    /// sent and received counts after each batch.
    pub async fn run<F>(&self, transport: &dyn Transport, mut on_batch: F) -> PacketLossStats
    where
        F: FnMut(u32, u32) + Send,
    {
        let mut sent = 0u32;
        let mut received = 0u32;
        let mut remaining = self.total_probes;

        while remaining > 0 {
            let batch = remaining.min(self.batch_size);
            let wait = self.probe_timeout;
            let outcomes =
                join_all((0..batch).map(|_| timeout(wait, transport.probe_packet(wait)))).await;

            sent += batch as u32;
            received += outcomes
                .iter()
                .filter(|outcome| matches!(outcome, Ok(Ok(()))))
                .count() as u32;
            remaining -= batch;
            on_batch(sent, received);

            if remaining > 0 {
                sleep(self.batch_pause).await;
            }
        }

        PacketLossStats::from_counts(sent, received)
    }

    pub(crate) async fn measure(&self, ctx: &RunContext) -> PacketLossStats {
        let total = self.total_probes.max(1) as f64;
        let stats = self
            .run(ctx.transport.as_ref(), |sent, received| {
                let lost = f64::from(sent - received.min(sent));
                let loss = if sent == 0 { 0.0 } else { lost / f64::from(sent) * 100.0 };
                ctx.events
                    .progress(TestPhase::PacketLoss, f64::from(sent) / total * 100.0, loss);
            })
            .await;

        ctx.logger
            .info("Packet loss measured")
            .field("sent", stats.sent)
            .field("received", stats.received)
            .field("percentage", stats.percentage)
            .log()
            .await;
        stats
    }
}
