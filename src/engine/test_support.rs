//! Deterministic in-memory transport for virtual-time tests

use crate::error::{AppError, Result};
use crate::transport::{DownloadChunk, DownloadStream, LatencyProbe, Transport, UploadAck};
use crate::types::TransportKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Decrements the active download count when a stream is dropped
struct ActiveDownload(Arc<AtomicUsize>);

impl ActiveDownload {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveDownload {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted link: fixed idle latency, extra latency per active download,
/// downloads paced as `chunk_bytes` every `chunk_interval`, uploads at
/// `upload_mbps`
pub struct MockTransport {
    pub kind: TransportKind,
    pub latency: Duration,
    pub loaded_latency: Duration,
    pub chunk_bytes: usize,
    pub chunk_interval: Duration,
    pub upload_mbps: f64,
    pub max_streams: usize,
    /// Every nth packet probe is dropped
    pub lost_every: Option<u32>,
    /// Bytes of framing reported per download response
    pub framing_bytes: usize,
    pub fail_latency: AtomicBool,
    /// Latency probes answered before every later one fails
    pub latency_budget: Option<usize>,
    pub fail_downloads: AtomicBool,
    pub fail_uploads: AtomicBool,
    pub latency_probes: AtomicUsize,
    pub packet_probes: AtomicUsize,
    pub download_requests: AtomicUsize,
    pub upload_requests: AtomicUsize,
    pub closed: AtomicBool,
    packet_counter: AtomicU32,
    active: Arc<AtomicUsize>,
}

impl MockTransport {
    /// 10ms latency, 100 Mbps in both directions
    pub fn new() -> Self {
        Self {
            kind: TransportKind::Streaming,
            latency: Duration::from_millis(10),
            loaded_latency: Duration::ZERO,
            chunk_bytes: 125_000,
            chunk_interval: Duration::from_millis(10),
            upload_mbps: 100.0,
            max_streams: usize::MAX,
            lost_every: None,
            framing_bytes: 0,
            fail_latency: AtomicBool::new(false),
            latency_budget: None,
            fail_downloads: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            latency_probes: AtomicUsize::new(0),
            packet_probes: AtomicUsize::new(0),
            download_requests: AtomicUsize::new(0),
            upload_requests: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            packet_counter: AtomicU32::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_loaded_latency(mut self, per_download: Duration) -> Self {
        self.loaded_latency = per_download;
        self
    }

    pub fn with_download_rate(mut self, chunk_bytes: usize, interval: Duration) -> Self {
        self.chunk_bytes = chunk_bytes;
        self.chunk_interval = interval;
        self
    }

    pub fn with_upload_rate(mut self, mbps: f64) -> Self {
        self.upload_mbps = mbps;
        self
    }

    pub fn with_latency_budget(mut self, probes: usize) -> Self {
        self.latency_budget = Some(probes);
        self
    }

    pub fn with_lost_every(mut self, nth: u32) -> Self {
        self.lost_every = Some(nth);
        self
    }

    pub fn with_framing(mut self, bytes: usize) -> Self {
        self.framing_bytes = bytes;
        self
    }

    pub fn with_max_streams(mut self, streams: usize) -> Self {
        self.max_streams = streams;
        self
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn active_downloads(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        "mock://speedtest"
    }

    fn max_parallel_streams(&self) -> usize {
        self.max_streams
    }

    async fn probe_latency(&self, timeout: Duration) -> Result<LatencyProbe> {
        let n = self.latency_probes.fetch_add(1, Ordering::SeqCst) + 1;
        let over_budget = self.latency_budget.is_some_and(|budget| n > budget);
        if over_budget || self.fail_latency.load(Ordering::SeqCst) {
            return Err(AppError::transport("connection refused"));
        }

        let rtt = self.latency + self.loaded_latency * self.active_downloads() as u32;
        if rtt > timeout {
            sleep(timeout).await;
            return Err(AppError::timeout("probe timed out"));
        }
        sleep(rtt).await;
        Ok(LatencyProbe {
            rtt,
            server_processing: None,
        })
    }

    async fn probe_packet(&self, timeout: Duration) -> Result<()> {
        self.packet_probes.fetch_add(1, Ordering::SeqCst);
        let n = self.packet_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let lost = self.lost_every.is_some_and(|every| n % every == 0);
        if lost || self.latency > timeout {
            sleep(timeout).await;
            return Err(AppError::timeout("probe lost"));
        }
        sleep(self.latency).await;
        Ok(())
    }

    async fn stream_down(&self, bytes: u64) -> Result<DownloadStream> {
        self.download_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(AppError::transport("connection refused"));
        }

        let guard = ActiveDownload::new(self.active.clone());
        let chunk = self.chunk_bytes.max(1) as u64;
        let interval = self.chunk_interval;
        let framing = self.framing_bytes;
        let first_at = Instant::now() + interval;

        let chunks = futures::stream::unfold(
            (0u64, first_at, false, guard),
            move |(sent, next_at, framed, guard)| async move {
                if sent >= bytes {
                    if framing > 0 && !framed {
                        let item = Ok(DownloadChunk::framing(framing, Instant::now()));
                        return Some((item, (sent, next_at, true, guard)));
                    }
                    return None;
                }
                sleep_until(next_at).await;
                let len = chunk.min(bytes - sent);
                let item = Ok(DownloadChunk::payload(len as usize, Instant::now()));
                Some((item, (sent + len, next_at + interval, framed, guard)))
            },
        )
        .boxed();

        Ok(DownloadStream::new(Some(bytes), 0, chunks))
    }

    async fn stream_up(&self, payload: Bytes) -> Result<UploadAck> {
        self.upload_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(AppError::transport("connection reset"));
        }

        let started_at = Instant::now();
        let secs = payload.len() as f64 * 8.0 / (self.upload_mbps * 1_000_000.0);
        sleep(Duration::from_secs_f64(secs)).await;
        Ok(UploadAck {
            bytes: payload.len() as u64,
            started_at,
            acked_at: Instant::now(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
