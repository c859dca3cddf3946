//! Measurement engine
//!
//! [`Orchestrator`] sequences the phases of one run over a [`Transport`] and
//! reports to its host through [`EngineEvents`]: progress, graph points and
//! state changes while the run is live, then exactly one terminal
//! [`EngineMessage::Complete`] or [`EngineMessage::Error`]. An aborted run ends
//! the stream without a terminal message.

pub mod bufferbloat;
pub mod latency;
pub mod overhead;
pub mod packet_loss;
pub mod selection;
pub mod throughput;

#[cfg(test)]
pub(crate) mod test_support;

pub use bufferbloat::BufferbloatAnalyzer;
pub use latency::{LatencyResult, LatencySampler};
pub use overhead::ProtocolOverheadEstimator;
pub use packet_loss::PacketLossProbe;
pub use throughput::{GracePeriod, PhaseOutcome};

use crate::error::{AppError, Result};
use crate::logging::{Logger, PhaseTimer};
use crate::models::{
    DegradedPhases, GraphPoint, ProgressEvent, ProtocolOverhead, SpeedTestResult, StabilityMetrics,
    TestConfig,
};
use crate::stats::{self, round_to};
use crate::transport::Transport;
use crate::types::{EngineState, GraphTag, TestPhase};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Everything the engine tells its host
#[derive(Debug)]
pub enum EngineMessage {
    Progress(ProgressEvent),
    Graph(GraphPoint),
    StateChanged(EngineState),
    Complete(Box<SpeedTestResult>),
    Error(AppError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read side of the abort flag
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort was requested; never resolves otherwise
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Host side of a run
#[derive(Debug)]
pub struct EngineEvents {
    rx: mpsc::UnboundedReceiver<EngineMessage>,
    abort: AbortSignal,
}

impl EngineEvents {
    /// Next message; `None` once the run ended or was aborted
    pub async fn recv(&mut self) -> Option<EngineMessage> {
        if self.abort.is_aborted() {
            return None;
        }
        let message = tokio::select! {
            biased;
            _ = self.abort.aborted() => None,
            message = self.rx.recv() => message,
        };
        if self.abort.is_aborted() {
            return None;
        }
        message
    }

    /// Drain the stream and return the terminal outcome
    pub async fn into_result(mut self) -> Result<SpeedTestResult> {
        while let Some(message) = self.recv().await {
            match message {
                EngineMessage::Complete(result) => return Ok(*result),
                EngineMessage::Error(error) => return Err(error),
                _ => {}
            }
        }
        Err(AppError::Aborted)
    }
}

/// Engine side of the channel. Drops everything once abort was requested.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<EngineMessage>,
    abort: AbortSignal,
    run_started: Instant,
}

impl EventSink {
    fn send(&self, message: EngineMessage) {
        if !self.abort.is_aborted() {
            let _ = self.tx.send(message);
        }
    }

    pub fn elapsed_ms_at(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.run_started).as_secs_f64() * 1000.0
    }

    pub fn progress(&self, phase: TestPhase, percent: f64, value: f64) {
        self.progress_at(phase, percent, value, Instant::now());
    }

    pub fn progress_at(&self, phase: TestPhase, percent: f64, value: f64, at: Instant) {
        self.send(EngineMessage::Progress(ProgressEvent {
            phase,
            progress_percent: percent.clamp(0.0, 100.0),
            current_value: value,
            elapsed_ms: self.elapsed_ms_at(at),
        }));
    }

    pub fn graph(&self, tag: GraphTag, value: f64) {
        self.graph_at(tag, value, Instant::now());
    }

    pub fn graph_at(&self, tag: GraphTag, value: f64, at: Instant) {
        self.send(EngineMessage::Graph(GraphPoint {
            elapsed_ms: self.elapsed_ms_at(at),
            value,
            tag,
        }));
    }

    fn state(&self, state: EngineState) {
        self.send(EngineMessage::StateChanged(state));
    }
}

/// Per-run state shared by the phases
pub(crate) struct RunContext {
    pub config: Arc<TestConfig>,
    pub transport: Arc<dyn Transport>,
    pub events: EventSink,
    pub logger: Logger,
    overhead: Mutex<ProtocolOverheadEstimator>,
}

impl RunContext {
    fn new(
        config: Arc<TestConfig>,
        transport: Arc<dyn Transport>,
        events: EventSink,
        logger: Logger,
    ) -> Self {
        let overhead = ProtocolOverheadEstimator::new(config.protocol_overhead_factor);
        Self {
            config,
            transport,
            events,
            logger,
            overhead: Mutex::new(overhead),
        }
    }

    /// Factor applied to raw throughput: detected if auto-detection found one,
    /// the configured value otherwise
    pub fn overhead_factor(&self) -> f64 {
        if self.config.auto_detect_overhead {
            lock(&self.overhead).factor()
        } else {
            self.config.protocol_overhead_factor
        }
    }

    pub async fn observe_overhead(&self, declared: u64, observed: u64) {
        if !self.config.auto_detect_overhead {
            return;
        }
        let detected = {
            let mut estimator = lock(&self.overhead);
            estimator.observe(declared, observed).then(|| estimator.factor())
        };
        if let Some(factor) = detected {
            self.logger
                .info("Protocol overhead detected")
                .field("factor", round_to(factor, 4))
                .log()
                .await;
        }
    }

    fn overhead_report(&self) -> ProtocolOverhead {
        lock(&self.overhead).report()
    }
}

/// Shared lifecycle state; transitions follow [`EngineState::can_transition_to`]
#[derive(Debug, Clone)]
struct StateCell(Arc<Mutex<EngineState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(EngineState::Idle)))
    }

    fn get(&self) -> EngineState {
        *lock(&self.0)
    }

    fn advance(&self, next: EngineState) -> bool {
        let mut state = lock(&self.0);
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Runs one speed test. Create a new orchestrator for every run.
pub struct Orchestrator {
    state: StateCell,
    abort_tx: watch::Sender<bool>,
    transport: Option<Arc<dyn Transport>>,
    task: Option<JoinHandle<()>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Orchestrator that selects a server and opens the configured transport
    pub fn new() -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            state: StateCell::new(),
            abort_tx,
            transport: None,
            task: None,
        }
    }

    /// Orchestrator that measures over an already open transport
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let mut orchestrator = Self::new();
        orchestrator.transport = Some(transport);
        orchestrator
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Validate `config` and start the run in the background
    pub fn start(&mut self, config: TestConfig) -> Result<EngineEvents> {
        if self.task.is_some() || self.state.get() != EngineState::Idle {
            return Err(AppError::validation(
                "An orchestrator runs a single test; create a new one for every run",
            ));
        }
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let abort = AbortSignal {
            rx: self.abort_tx.subscribe(),
        };
        let events = EventSink {
            tx,
            abort: abort.clone(),
            run_started: Instant::now(),
        };
        let run = Run {
            config: Arc::new(config),
            transport: self.transport.clone(),
            state: self.state.clone(),
            events,
        };

        self.task = Some(tokio::spawn(run.drive()));
        Ok(EngineEvents { rx, abort })
    }

    /// Stop in-flight I/O and end the event stream. No terminal message
    /// follows an abort.
    pub fn abort(&self) {
        if self.state.advance(EngineState::Aborted) {
            self.abort_tx.send_replace(true);
        }
    }

    /// Abort if still running and release the transport
    pub async fn dispose(mut self) {
        self.abort();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.abort();
        }
    }
}

struct Run {
    config: Arc<TestConfig>,
    transport: Option<Arc<dyn Transport>>,
    state: StateCell,
    events: EventSink,
}

impl Run {
    async fn drive(self) {
        let logger = Logger::with_config("engine", &self.config);
        let run_id = Uuid::new_v4();
        logger.set_session_id(run_id.to_string()).await;

        let abort = self.events.abort.clone();
        let outcome = tokio::select! {
            biased;
            _ = abort.aborted() => None,
            outcome = self.execute(run_id, &logger) => Some(outcome),
        };

        match outcome {
            None => logger.info("Test aborted").log().await,
            Some(Ok(result)) => {
                if self.transition(EngineState::Complete) {
                    self.events.send(EngineMessage::Complete(Box::new(result)));
                }
            }
            Some(Err(error)) if error.is_abort() => {}
            Some(Err(error)) => {
                logger.error("Test failed").error_info(&error).log().await;
                if self.transition(EngineState::Failed) {
                    self.events.send(EngineMessage::Error(error));
                }
            }
        }
    }

    fn transition(&self, next: EngineState) -> bool {
        let moved = self.state.advance(next);
        if moved {
            self.events.state(next);
        }
        moved
    }

    async fn enter(&self, phase: TestPhase, timer: &mut PhaseTimer) -> Result<()> {
        if !self.transition(phase.into()) {
            return Err(AppError::Aborted);
        }
        timer.start(phase.as_str()).await;
        Ok(())
    }

    async fn execute(&self, run_id: Uuid, logger: &Logger) -> Result<SpeedTestResult> {
        let config = self.config.clone();
        let (server, transport) = match &self.transport {
            Some(transport) => {
                let probe_timeout = config.probe_timeout();
                selection::ensure_reachable(transport.as_ref(), probe_timeout, logger).await?;
                (transport.endpoint().to_string(), transport.clone())
            }
            None => selection::select_server(&config, logger).await?,
        };

        let ctx = RunContext::new(
            config.clone(),
            transport.clone(),
            self.events.clone(),
            logger.clone(),
        );
        let mut timer = PhaseTimer::new(logger.child("timing"));
        let mut degraded = DegradedPhases::default();

        self.enter(TestPhase::Latency, &mut timer).await?;
        let latency = LatencySampler::from_config(&config).measure(&ctx).await;
        if latency.degraded {
            degraded.mark(TestPhase::Latency);
        }
        timer.finish(TestPhase::Latency.as_str()).await;

        self.enter(TestPhase::Download, &mut timer).await?;
        let download = throughput::run_download(&ctx).await;
        if download.degraded {
            degraded.mark(TestPhase::Download);
        }
        timer.finish(TestPhase::Download.as_str()).await;

        self.enter(TestPhase::Upload, &mut timer).await?;
        let upload = throughput::run_upload(&ctx).await;
        if upload.degraded {
            degraded.mark(TestPhase::Upload);
        }
        timer.finish(TestPhase::Upload.as_str()).await;

        self.enter(TestPhase::PacketLoss, &mut timer).await?;
        let packet_loss = PacketLossProbe::from_config(&config).measure(&ctx).await;
        if packet_loss.sent > 0 && packet_loss.received == 0 {
            degraded.mark(TestPhase::PacketLoss);
        }
        timer.finish(TestPhase::PacketLoss.as_str()).await;

        let bufferbloat = if !config.enable_bufferbloat {
            None
        } else if latency.degraded {
            logger
                .warn("Skipping bufferbloat: no idle latency baseline")
                .log()
                .await;
            degraded.mark(TestPhase::Bufferbloat);
            None
        } else {
            self.enter(TestPhase::Bufferbloat, &mut timer).await?;
            let streams = transport.max_parallel_streams();
            let analyzer = BufferbloatAnalyzer::from_config(&config, streams);
            let result = analyzer.measure(&ctx, latency.latency_ms).await;
            if result.is_none() {
                degraded.mark(TestPhase::Bufferbloat);
            }
            timer.finish(TestPhase::Bufferbloat.as_str()).await;
            result
        };

        let stability = if config.enable_stress_test {
            least_stable(&download, &upload)
        } else {
            None
        };

        if degraded.any() {
            logger
                .warn("Some phases fell back to placeholder values")
                .field("phases", degraded.phases())
                .log()
                .await;
        }

        let result = SpeedTestResult {
            id: run_id,
            timestamp: Utc::now(),
            download_mbps: round_to(download.mbps, 1),
            upload_mbps: round_to(upload.mbps, 1),
            ping_ms: round_to(latency.latency_ms, 1),
            jitter_ms: round_to(latency.jitter_ms, 1),
            test_duration_s: round_to(self.events.run_started.elapsed().as_secs_f64(), 1),
            bufferbloat,
            packet_loss,
            protocol_overhead: if config.auto_detect_overhead {
                ctx.overhead_report()
            } else {
                ProtocolOverhead::new(false, config.protocol_overhead_factor)
            },
            stability,
            server,
            transport: transport.kind(),
            degraded,
        };

        if let Err(error) = transport.close().await {
            logger.debug("Transport close failed").error_info(&error).log().await;
        }
        Ok(result)
    }
}

/// Stability of the less steady throughput phase
fn least_stable(download: &PhaseOutcome, upload: &PhaseOutcome) -> Option<StabilityMetrics> {
    let candidates = [
        stats::stability(&download.rate_series),
        stats::stability(&upload.rate_series),
    ];
    candidates
        .into_iter()
        .flatten()
        .min_by(|a, b| a.score.total_cmp(&b.score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_enforces_order() {
        let state = StateCell::new();
        assert!(!state.advance(EngineState::Download));
        assert!(state.advance(EngineState::Latency));
        assert!(state.advance(EngineState::Download));
        assert!(state.advance(EngineState::Aborted));
        assert!(!state.advance(EngineState::Upload));
        assert_eq!(state.get(), EngineState::Aborted);
    }

    #[tokio::test]
    async fn test_sink_silent_after_abort() {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink {
            tx,
            abort: AbortSignal { rx: abort_rx },
            run_started: Instant::now(),
        };

        sink.progress(TestPhase::Latency, 10.0, 12.0);
        abort_tx.send_replace(true);
        sink.progress(TestPhase::Latency, 20.0, 12.0);
        drop(sink);

        assert!(matches!(rx.recv().await, Some(EngineMessage::Progress(_))));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let mut orchestrator = Orchestrator::new();
        let config = TestConfig {
            parallel_connections: 0,
            ..TestConfig::default()
        };
        assert!(orchestrator.start(config).is_err());
        assert_eq!(orchestrator.state(), EngineState::Idle);
    }

    #[test]
    fn test_least_stable_picks_lower_score() {
        let outcome = |series: Vec<f64>| PhaseOutcome {
            mbps: 1.0,
            connections: 1,
            rate_series: series,
            degraded: false,
        };
        let steady = outcome(vec![100.0, 100.0, 100.0]);
        let noisy = outcome(vec![10.0, 190.0]);
        assert_eq!(least_stable(&steady, &noisy).unwrap().score, 10.0);
        assert!(least_stable(&outcome(vec![]), &outcome(vec![])).is_none());
    }
}
