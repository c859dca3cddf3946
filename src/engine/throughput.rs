//! Download and upload throughput with warm-up exclusion
//!
//! Each phase fans out to parallel connections joined before the phase ends.
//! Every connection owns a [`GracePeriod`] that excludes its ramp-up from the
//! rate, and computes its own post-grace rate. The phase reports the mean of
//! the per-connection rates scaled by the protocol overhead factor. Only the
//! first connection emits progress and graph events.

use super::RunContext;
use crate::defaults;
use crate::error::{AppError, Result};
use crate::models::{Sample, TestConfig};
use crate::stats;
use crate::transport::UploadAck;
use crate::types::{ConnectionClass, GraphTag, TestPhase};
use bytes::Bytes;
use futures::future::join_all;
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Spacing of early-rate samples while the grace window is undecided
pub const GRACE_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Minimum elapsed time before a connection is classified
pub const GRACE_DECISION_AFTER: Duration = Duration::from_secs(1);
pub const MIN_GRACE_SAMPLES: usize = 2;
/// Granularity of progress events and recorded samples
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
/// Bin width for the stability series
pub const STABILITY_BIN: Duration = Duration::from_millis(500);
/// Consecutive chunk failures that end an upload connection
pub const MAX_UPLOAD_FAILURES: u32 = 3;

/// Warm-up window of one connection. Moves from `Collecting` to `Decided` at
/// most once.
#[derive(Debug, Clone, PartialEq)]
pub enum GracePeriod {
    Collecting {
        samples: Vec<f64>,
        last_sample_at: Option<Duration>,
    },
    Decided {
        window: Duration,
        /// `None` for a configured static window
        class: Option<ConnectionClass>,
    },
}

impl GracePeriod {
    pub fn dynamic() -> Self {
        GracePeriod::Collecting {
            samples: Vec::new(),
            last_sample_at: None,
        }
    }

    pub fn fixed(window: Duration) -> Self {
        GracePeriod::Decided { window, class: None }
    }

    pub fn for_config(config: &TestConfig) -> Self {
        if config.dynamic_grace_period {
            Self::dynamic()
        } else {
            Self::fixed(config.static_grace_period())
        }
    }

    pub fn window(&self) -> Option<Duration> {
        match self {
            GracePeriod::Collecting { .. } => None,
            GracePeriod::Decided { window, .. } => Some(*window),
        }
    }

    pub fn is_decided(&self) -> bool {
        matches!(self, GracePeriod::Decided { .. })
    }

    /// Feed the cumulative rate observed `elapsed` after the connection
    /// started. Returns the class when this observation made the decision.
    pub fn observe(&mut self, elapsed: Duration, rate_mbps: f64) -> Option<ConnectionClass> {
        let GracePeriod::Collecting {
            samples,
            last_sample_at,
        } = self
        else {
            return None;
        };

        let since_last = elapsed.saturating_sub(last_sample_at.unwrap_or(Duration::ZERO));
        if since_last >= GRACE_SAMPLE_INTERVAL {
            samples.push(rate_mbps);
            *last_sample_at = Some(elapsed);
        }

        let enough = samples.len() >= MIN_GRACE_SAMPLES && elapsed >= GRACE_DECISION_AFTER;
        // A connection too slow to deliver two samples is classified at the
        // widest window with what it has
        let overdue = !samples.is_empty() && elapsed >= defaults::MAX_DYNAMIC_GRACE;
        if !(enough || overdue) {
            return None;
        }

        let early_rate = stats::mean(samples).unwrap_or(0.0);
        let class = ConnectionClass::from_rate(early_rate);
        *self = GracePeriod::Decided {
            window: class.grace_period(),
            class: Some(class),
        };
        Some(class)
    }
}

/// Byte deltas appended by concurrent connections
#[derive(Debug)]
pub struct SampleLog {
    phase: TestPhase,
    samples: Mutex<Vec<Sample>>,
    /// Connections that appended at least one sample
    contributors: Mutex<BTreeSet<usize>>,
}

impl SampleLog {
    pub fn new(phase: TestPhase) -> Self {
        Self {
            phase,
            samples: Mutex::new(Vec::new()),
            contributors: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn push(&self, connection: usize, timestamp_ms: f64, bytes: u64) {
        let sample = Sample {
            timestamp_ms,
            value: bytes as f64,
            phase: self.phase,
        };
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
        self.contributors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection);
    }

    pub fn contributing_connections(&self) -> usize {
        self.contributors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rate in Mbps per contributing connection for each full `bin`. The
    /// first and last bins are partial and dropped.
    pub fn binned_rates(&self, bin: Duration) -> Vec<f64> {
        let samples = self.snapshot();
        let connections = self.contributing_connections();
        let bin_ms = bin.as_secs_f64() * 1000.0;
        if samples.is_empty() || bin_ms <= 0.0 || connections == 0 {
            return Vec::new();
        }

        let first = samples
            .iter()
            .map(|s| s.timestamp_ms)
            .fold(f64::INFINITY, f64::min);
        let mut bins: Vec<f64> = Vec::new();
        for sample in &samples {
            let index = ((sample.timestamp_ms - first) / bin_ms).floor() as usize;
            if bins.len() <= index {
                bins.resize(index + 1, 0.0);
            }
            bins[index] += sample.value;
        }
        if bins.len() < 3 {
            return Vec::new();
        }

        bins[1..bins.len() - 1]
            .iter()
            .map(|bytes| bytes * 8.0 / bin.as_secs_f64() / 1_000_000.0 / connections as f64)
            .collect()
    }
}

/// Coalesces one connection's post-grace bytes into log samples
struct SampleBuffer<'a> {
    log: &'a SampleLog,
    connection: usize,
    pending: u64,
    last_flush: Option<Instant>,
}

impl<'a> SampleBuffer<'a> {
    fn new(log: &'a SampleLog, connection: usize) -> Self {
        Self {
            log,
            connection,
            pending: 0,
            last_flush: None,
        }
    }

    fn add(&mut self, ctx: &RunContext, bytes: u64, at: Instant) {
        self.pending += bytes;
        let due = self
            .last_flush
            .map_or(true, |last| at.saturating_duration_since(last) >= PROGRESS_INTERVAL);
        if due {
            self.flush(ctx, at);
        }
    }

    fn flush(&mut self, ctx: &RunContext, at: Instant) {
        if self.pending > 0 {
            self.log
                .push(self.connection, ctx.events.elapsed_ms_at(at), self.pending);
            self.pending = 0;
        }
        self.last_flush = Some(at);
    }
}

/// Progress reporting of the designated connection
struct Reporter {
    phase: TestPhase,
    phase_start: Instant,
    last_emit: Option<Instant>,
}

impl Reporter {
    fn new(phase: TestPhase, phase_start: Instant) -> Self {
        Self {
            phase,
            phase_start,
            last_emit: None,
        }
    }

    fn tick(
        &mut self,
        ctx: &RunContext,
        now: Instant,
        raw_rate: f64,
        in_grace: bool,
        window: Option<Duration>,
    ) {
        let due = self
            .last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= PROGRESS_INTERVAL);
        if !due {
            return;
        }
        self.last_emit = Some(now);

        let config = &ctx.config;
        let expected = match window {
            Some(window) => config.duration() + window,
            None => config.throughput_deadline(),
        };
        let elapsed = now.saturating_duration_since(self.phase_start);
        let percent =
            (elapsed.as_secs_f64() / expected.as_secs_f64().max(f64::EPSILON) * 100.0).min(100.0);
        let rate = raw_rate * ctx.overhead_factor();

        ctx.events.progress_at(self.phase, percent, rate, now);
        ctx.events
            .graph_at(GraphTag::for_throughput(self.phase, in_grace), rate, now);
    }
}

/// Byte accounting of one download connection
#[derive(Debug)]
struct ConnectionMeter {
    started: Instant,
    grace: GracePeriod,
    total_bytes: u64,
    measured_bytes: u64,
    measure_start: Option<Instant>,
    last_byte_at: Instant,
}

impl ConnectionMeter {
    fn new(started: Instant, grace: GracePeriod) -> Self {
        Self {
            started,
            grace,
            total_bytes: 0,
            measured_bytes: 0,
            measure_start: None,
            last_byte_at: started,
        }
    }

    fn in_grace(&self) -> bool {
        self.measure_start.is_none()
    }

    /// Record payload bytes. Returns true when the bytes count toward the rate.
    /// The chunk that crosses the grace boundary starts the measurement clock
    /// but is not counted.
    fn record(&mut self, bytes: u64, at: Instant) -> (bool, Option<ConnectionClass>) {
        self.total_bytes += bytes;
        self.last_byte_at = at;

        if self.measure_start.is_some() {
            self.measured_bytes += bytes;
            return (true, None);
        }

        let elapsed = at.saturating_duration_since(self.started);
        let decided = self.grace.observe(elapsed, stats::mbps(self.total_bytes, elapsed));
        if let Some(window) = self.grace.window() {
            if elapsed >= window {
                self.measure_start = Some(at);
            }
        }
        (false, decided)
    }

    /// When this connection stops requesting more data
    fn stop_at(&self, duration: Duration, hard_stop: Instant) -> Instant {
        match self.measure_start {
            Some(start) => (start + duration).min(hard_stop),
            None => hard_stop,
        }
    }

    fn current_rate(&self, now: Instant) -> f64 {
        match self.measure_start {
            Some(start) => stats::mbps(self.measured_bytes, now.saturating_duration_since(start)),
            None => stats::mbps(self.total_bytes, now.saturating_duration_since(self.started)),
        }
    }

    /// Post-grace rate, or the whole transfer when grace never ended
    fn final_rate(&self) -> f64 {
        match self.measure_start {
            Some(start) if self.measured_bytes > 0 => stats::mbps(
                self.measured_bytes,
                self.last_byte_at.saturating_duration_since(start),
            ),
            _ => stats::mbps(
                self.total_bytes,
                self.last_byte_at.saturating_duration_since(self.started),
            ),
        }
    }
}

/// Byte accounting of one upload connection, at chunk granularity
#[derive(Debug)]
struct UploadMeter {
    started: Instant,
    grace: GracePeriod,
    total_bytes: u64,
    total_time: Duration,
    measured_bytes: u64,
    measured_time: Duration,
}

impl UploadMeter {
    fn new(started: Instant, grace: GracePeriod) -> Self {
        Self {
            started,
            grace,
            total_bytes: 0,
            total_time: Duration::ZERO,
            measured_bytes: 0,
            measured_time: Duration::ZERO,
        }
    }

    fn grace_ends_at(&self) -> Option<Instant> {
        self.grace.window().map(|window| self.started + window)
    }

    fn in_grace(&self, now: Instant) -> bool {
        self.grace_ends_at().map_or(true, |end| now < end)
    }

    /// Record an acknowledged chunk. Only chunks that started after the grace
    /// window count.
    fn record(&mut self, ack: &UploadAck) -> (bool, Option<ConnectionClass>) {
        self.total_bytes += ack.bytes;
        self.total_time += ack.elapsed();

        let decided = if self.grace.is_decided() {
            None
        } else {
            let elapsed = ack.acked_at.saturating_duration_since(self.started);
            self.grace.observe(elapsed, stats::mbps(self.total_bytes, self.total_time))
        };

        let counted = self
            .grace_ends_at()
            .is_some_and(|end| ack.started_at >= end);
        if counted {
            self.measured_bytes += ack.bytes;
            self.measured_time += ack.elapsed();
        }
        (counted, decided)
    }

    fn stop_at(&self, duration: Duration, hard_stop: Instant) -> Instant {
        match self.grace_ends_at() {
            Some(end) => (end + duration).min(hard_stop),
            None => hard_stop,
        }
    }

    fn current_rate(&self) -> f64 {
        if self.measured_bytes > 0 {
            stats::mbps(self.measured_bytes, self.measured_time)
        } else {
            stats::mbps(self.total_bytes, self.total_time)
        }
    }

    fn final_rate(&self) -> f64 {
        self.current_rate()
    }
}

/// Result of one throughput phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    /// Mean per-connection rate, overhead-corrected
    pub mbps: f64,
    /// Connections that produced a rate
    pub connections: usize,
    /// Per-connection post-grace rate series for stability
    pub rate_series: Vec<f64>,
    pub degraded: bool,
}

impl PhaseOutcome {
    fn degraded() -> Self {
        Self {
            mbps: 0.0,
            connections: 0,
            rate_series: Vec::new(),
            degraded: true,
        }
    }
}

pub(crate) async fn run_download(ctx: &RunContext) -> PhaseOutcome {
    run_phase(ctx, TestPhase::Download).await
}

pub(crate) async fn run_upload(ctx: &RunContext) -> PhaseOutcome {
    run_phase(ctx, TestPhase::Upload).await
}

/// Measure with every connection; on a phase with no usable sample retry
/// once on a single connection, then report a degraded zero
async fn run_phase(ctx: &RunContext, phase: TestPhase) -> PhaseOutcome {
    let connections = ctx
        .config
        .parallel_connections
        .min(ctx.transport.max_parallel_streams())
        .max(1);

    let error = match measure(ctx, phase, connections).await {
        Ok(outcome) => return outcome,
        Err(error) => error,
    };
    ctx.logger
        .warn(&format!("{} phase produced no samples, retrying once", phase))
        .error_info(&error)
        .log()
        .await;

    match measure(ctx, phase, 1).await {
        Ok(outcome) => outcome,
        Err(error) => {
            ctx.logger
                .warn(&format!("{} phase degraded", phase))
                .error_info(&error)
                .log()
                .await;
            PhaseOutcome::degraded()
        }
    }
}

async fn measure(ctx: &RunContext, phase: TestPhase, connections: usize) -> Result<PhaseOutcome> {
    let log = SampleLog::new(phase);
    let phase_start = Instant::now();

    let results = match phase {
        TestPhase::Upload => {
            let payload = random_payload(ctx.config.upload_chunk_bytes);
            let uploads = (0..connections)
                .map(|index| upload_connection(ctx, index, phase_start, payload.clone(), &log));
            join_all(uploads).await
        }
        _ => {
            let downloads =
                (0..connections).map(|index| download_connection(ctx, index, phase_start, &log));
            join_all(downloads).await
        }
    };

    let mut rates = Vec::with_capacity(connections);
    let mut last_error = None;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(rate) if rate > 0.0 && rate.is_finite() => rates.push(rate),
            Ok(_) => {}
            Err(error) => {
                ctx.logger
                    .debug("Connection skipped")
                    .field("phase", phase)
                    .field("connection", index)
                    .error_info(&error)
                    .log()
                    .await;
                last_error = Some(error);
            }
        }
    }

    let mean = stats::mean(&rates).ok_or_else(|| {
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no bytes transferred".to_string());
        AppError::phase_exhausted(format!("{}: {}", phase, reason))
    })?;
    let factor = ctx.overhead_factor();
    let outcome = PhaseOutcome {
        mbps: mean * factor,
        connections: rates.len(),
        rate_series: log.binned_rates(STABILITY_BIN),
        degraded: false,
    };

    ctx.logger
        .info(&format!("{} measured", phase))
        .field("mbps", stats::round_to(outcome.mbps, 1))
        .field("connections", outcome.connections)
        .field("overhead_factor", factor)
        .log()
        .await;
    Ok(outcome)
}

async fn download_connection(
    ctx: &RunContext,
    index: usize,
    phase_start: Instant,
    log: &SampleLog,
) -> Result<f64> {
    let config = &ctx.config;
    let duration = config.duration();
    let hard_stop = phase_start + config.throughput_deadline();
    let idle = config.request_timeout();

    let mut meter = ConnectionMeter::new(phase_start, GracePeriod::for_config(config));
    let mut buffer = SampleBuffer::new(log, index);
    let mut reporter = (index == 0).then(|| Reporter::new(TestPhase::Download, phase_start));
    let mut failure = None;

    'requests: while Instant::now() < meter.stop_at(duration, hard_stop) {
        let stop = meter.stop_at(duration, hard_stop);
        let request = ctx.transport.stream_down(config.download_request_bytes);
        let mut stream = match timeout_at(stop, request).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                failure = Some(error);
                break;
            }
            Err(_) => break,
        };

        loop {
            let stop = meter.stop_at(duration, hard_stop);
            let now = Instant::now();
            if now >= stop {
                break 'requests;
            }

            match timeout_at(stop.min(now + idle), stream.next_chunk()).await {
                Err(_) if Instant::now() >= stop => break 'requests,
                Err(_) => {
                    failure = Some(AppError::timeout("download stalled"));
                    break 'requests;
                }
                Ok(None) => break,
                Ok(Some(Err(error))) => {
                    failure = Some(error);
                    break 'requests;
                }
                Ok(Some(Ok(chunk))) => {
                    if chunk.payload == 0 {
                        continue;
                    }
                    let (counted, decided) = meter.record(chunk.payload as u64, chunk.received_at);
                    if counted {
                        buffer.add(ctx, chunk.payload as u64, chunk.received_at);
                    }
                    if let (Some(class), 0) = (decided, index) {
                        log_grace_decision(ctx, TestPhase::Download, class).await;
                    }
                    if let Some(reporter) = reporter.as_mut() {
                        let now = chunk.received_at;
                        let rate = meter.current_rate(now);
                        reporter.tick(ctx, now, rate, meter.in_grace(), meter.grace.window());
                    }
                }
            }
        }

        if let Some((declared, observed)) = stream.overhead_observation() {
            ctx.observe_overhead(declared, observed).await;
        }
    }

    buffer.flush(ctx, meter.last_byte_at);
    finish_connection(meter.total_bytes, meter.final_rate(), failure)
}

async fn upload_connection(
    ctx: &RunContext,
    index: usize,
    phase_start: Instant,
    payload: Bytes,
    log: &SampleLog,
) -> Result<f64> {
    let config = &ctx.config;
    let duration = config.duration();
    let hard_stop = phase_start + config.throughput_deadline();
    let chunk_timeout = config.upload_chunk_timeout();

    let mut meter = UploadMeter::new(phase_start, GracePeriod::for_config(config));
    let mut buffer = SampleBuffer::new(log, index);
    let mut reporter = (index == 0).then(|| Reporter::new(TestPhase::Upload, phase_start));
    let mut failures = 0u32;
    let mut last_error = None;

    while Instant::now() < meter.stop_at(duration, hard_stop) {
        let limit = (Instant::now() + chunk_timeout).min(hard_stop);
        let outcome = match timeout_at(limit, ctx.transport.stream_up(payload.clone())).await {
            Ok(outcome) => outcome,
            Err(_) if Instant::now() >= hard_stop => break,
            Err(_) => Err(AppError::timeout("upload chunk not acknowledged")),
        };

        match outcome {
            Ok(ack) => {
                failures = 0;
                let (counted, decided) = meter.record(&ack);
                if counted {
                    buffer.add(ctx, ack.bytes, ack.acked_at);
                }
                if let (Some(class), 0) = (decided, index) {
                    log_grace_decision(ctx, TestPhase::Upload, class).await;
                }
                if let Some(reporter) = reporter.as_mut() {
                    let in_grace = meter.in_grace(ack.started_at);
                    let rate = meter.current_rate();
                    reporter.tick(ctx, ack.acked_at, rate, in_grace, meter.grace.window());
                }
            }
            Err(error) => {
                failures += 1;
                last_error = Some(error);
                if failures >= MAX_UPLOAD_FAILURES {
                    break;
                }
            }
        }
    }

    buffer.flush(ctx, Instant::now());
    finish_connection(meter.total_bytes, meter.final_rate(), last_error)
}

/// A connection that moved bytes reports its rate despite a late failure
fn finish_connection(total_bytes: u64, rate: f64, failure: Option<AppError>) -> Result<f64> {
    match failure {
        Some(error) if total_bytes == 0 => Err(error),
        _ => Ok(rate),
    }
}

async fn log_grace_decision(ctx: &RunContext, phase: TestPhase, class: ConnectionClass) {
    ctx.logger
        .debug("Grace period decided")
        .field("phase", phase)
        .field("class", class)
        .field("grace_secs", class.grace_period().as_secs())
        .log()
        .await;
}

/// Random bytes generated once per phase and shared by every chunk
fn random_payload(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UploadAck;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_grace_samples_every_200ms_then_decides_once() {
        let mut grace = GracePeriod::dynamic();
        assert_eq!(grace.observe(ms(100), 80.0), None);
        assert_eq!(grace.observe(ms(200), 80.0), None);
        assert_eq!(grace.observe(ms(300), 1.0), None);
        assert_eq!(grace.observe(ms(400), 80.0), None);
        match &grace {
            GracePeriod::Collecting { samples, .. } => assert_eq!(samples.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(grace.observe(ms(1000), 80.0), Some(ConnectionClass::Fast));
        assert_eq!(grace.window(), Some(ms(1000)));
        // Decided state never reclassifies
        assert_eq!(grace.observe(ms(1200), 1.0), None);
        assert_eq!(grace.window(), Some(ms(1000)));
    }

    #[test]
    fn test_grace_uses_mean_of_early_samples() {
        let mut grace = GracePeriod::dynamic();
        grace.observe(ms(200), 20.0);
        grace.observe(ms(400), 40.0);
        assert_eq!(grace.observe(ms(1000), 30.0), Some(ConnectionClass::Medium));
        assert_eq!(grace.window(), Some(ms(2000)));
    }

    #[test]
    fn test_grace_waits_for_two_samples() {
        let mut grace = GracePeriod::dynamic();
        assert_eq!(grace.observe(ms(1100), 5.0), None);
        assert_eq!(grace.observe(ms(1300), 5.0), Some(ConnectionClass::Slow));
        assert_eq!(grace.window(), Some(ms(3000)));
    }

    #[test]
    fn test_grace_overdue_decides_with_one_sample() {
        let mut grace = GracePeriod::dynamic();
        assert_eq!(grace.observe(ms(3500), 60.0), Some(ConnectionClass::Fast));
    }

    #[test]
    fn test_static_grace_is_decided() {
        let config = TestConfig {
            dynamic_grace_period: false,
            static_grace_period_secs: 2.5,
            ..TestConfig::default()
        };
        let grace = GracePeriod::for_config(&config);
        assert_eq!(grace.window(), Some(ms(2500)));
        assert!(GracePeriod::for_config(&TestConfig::default()).window().is_none());
    }

    #[test]
    fn test_meter_excludes_grace_bytes() {
        let start = Instant::now();
        let mut meter = ConnectionMeter::new(start, GracePeriod::fixed(ms(1000)));

        // 100 chunks of 125KB at 10ms spacing = 100 Mbps
        for i in 1..=300u64 {
            meter.record(125_000, start + ms(i * 10));
        }
        assert!(!meter.in_grace());
        // chunks 101..=300 counted, the crossing chunk 100 was not
        assert_eq!(meter.measured_bytes, 200 * 125_000);
        assert!((meter.final_rate() - 100.0).abs() < 1e-6);
        assert_eq!(meter.stop_at(ms(10_000), start + ms(13_000)), start + ms(11_000));
    }

    #[test]
    fn test_meter_falls_back_to_full_transfer() {
        let start = Instant::now();
        let mut meter = ConnectionMeter::new(start, GracePeriod::fixed(ms(2000)));
        for i in 1..=50u64 {
            meter.record(125_000, start + ms(i * 10));
        }
        assert!(meter.in_grace());
        assert!((meter.final_rate() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_upload_meter_counts_chunks_started_after_grace() {
        let start = Instant::now();
        let mut meter = UploadMeter::new(start, GracePeriod::fixed(ms(1000)));
        let ack = |from: u64, to: u64| UploadAck {
            bytes: 1_000_000,
            started_at: start + ms(from),
            acked_at: start + ms(to),
        };

        assert!(!meter.record(&ack(0, 800)).0);
        // Straddles the boundary
        assert!(!meter.record(&ack(800, 1100)).0);
        assert!(meter.record(&ack(1100, 1180)).0);
        assert!(meter.record(&ack(1180, 1260)).0);

        assert_eq!(meter.measured_bytes, 2_000_000);
        // 2MB over 160ms
        assert!((meter.final_rate() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_log_bins() {
        let log = SampleLog::new(TestPhase::Download);
        // 125KB every 100ms for 2s on one connection = 10 Mbps
        for i in 0..20u64 {
            log.push(0, 1_000.0 + i as f64 * 100.0, 125_000);
        }
        let rates = log.binned_rates(STABILITY_BIN);
        assert_eq!(rates.len(), 2);
        assert!(rates.iter().all(|r| (*r - 10.0).abs() < 1e-9));
        assert_eq!(log.snapshot().len(), 20);
        assert!(SampleLog::new(TestPhase::Upload).binned_rates(STABILITY_BIN).is_empty());
    }

    #[test]
    fn test_sample_log_bins_average_contributing_connections() {
        // Two of four connections deliver 10 Mbps each, the others never start
        let log = SampleLog::new(TestPhase::Download);
        for connection in [0, 2] {
            for i in 0..20u64 {
                log.push(connection, 1_000.0 + i as f64 * 100.0, 125_000);
            }
        }
        assert_eq!(log.contributing_connections(), 2);
        let rates = log.binned_rates(STABILITY_BIN);
        assert_eq!(rates.len(), 2);
        assert!(rates.iter().all(|r| (*r - 10.0).abs() < 1e-9), "{:?}", rates);
    }

    #[test]
    fn test_finish_connection() {
        let reset = Some(AppError::transport("reset"));
        assert_eq!(finish_connection(10, 5.0, reset).unwrap(), 5.0);
        assert!(finish_connection(0, 0.0, Some(AppError::transport("refused"))).is_err());
        assert_eq!(finish_connection(0, 0.0, None).unwrap(), 0.0);
    }

    #[test]
    fn test_random_payload_length() {
        assert_eq!(random_payload(4096).len(), 4096);
    }
}
